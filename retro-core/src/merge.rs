/// Card combine hierarchy.
///
/// A card with `merged_with` set is a child; a card referenced by any
/// `merged_with` is a parent. The graph is kept at depth exactly one: combining
/// a card that already has children re-points those children at the new parent,
/// and children always live in their parent's column.
///
/// Votes stay attached to the card they were cast on. Display totals come from
/// [`vote_rollup`].
use crate::error::ValidationError;
use crate::store::EntityStore;

/// Combine `child_id` into `parent_id`. Returns the ids of every card whose
/// `merged_with`, column or position changed.
pub fn combine(
    store: &mut EntityStore,
    parent_id: &str,
    child_id: &str,
) -> Result<Vec<String>, ValidationError> {
    if parent_id == child_id {
        return Err(ValidationError::SelfCombine(child_id.to_string()));
    }
    let parent = store
        .card(parent_id)
        .ok_or_else(|| ValidationError::CardNotFound(parent_id.to_string()))?;
    if store.card(child_id).is_none() {
        return Err(ValidationError::CardNotFound(child_id.to_string()));
    }

    let mut changed = Vec::new();

    // Resolve the group root so no chain can form.
    let root_id = match parent.merged_with.clone() {
        None => parent_id.to_string(),
        Some(grand) if grand == child_id || store.card(&grand).is_none() => {
            // The target was itself inside the child's group (or dangles):
            // it takes over as the root.
            if let Some(card) = store.card_mut(parent_id) {
                card.merged_with = None;
            }
            changed.push(parent_id.to_string());
            parent_id.to_string()
        }
        Some(grand) => grand,
    };

    let root_column = match store.card(&root_id) {
        Some(root) => root.column_id.clone(),
        None => return Err(ValidationError::CardNotFound(root_id)),
    };

    let mut members = vec![child_id.to_string()];
    members.extend(
        store
            .children_of(child_id)
            .iter()
            .map(|c| c.id.clone())
            .filter(|id| id != &root_id),
    );

    for id in members {
        let needs_move = match store.card_mut(&id) {
            Some(card) => {
                if card.merged_with.as_deref() != Some(root_id.as_str()) {
                    card.merged_with = Some(root_id.clone());
                    push_unique(&mut changed, &id);
                }
                card.column_id != root_column
            }
            None => false,
        };
        if needs_move {
            if let Some(moved) = store.move_card(&id, &root_column, usize::MAX) {
                for moved_id in moved {
                    push_unique(&mut changed, &moved_id);
                }
            }
        }
    }

    log::debug!(
        "[retro.merge.combine] {} -> {} ({} cards touched)",
        child_id,
        root_id,
        changed.len()
    );
    Ok(changed)
}

/// Detach `child_id` from its parent, leaving it in its current column.
/// Returns `Ok(false)` when the card had no parent.
pub fn uncombine(store: &mut EntityStore, child_id: &str) -> Result<bool, ValidationError> {
    let card = store
        .card_mut(child_id)
        .ok_or_else(|| ValidationError::CardNotFound(child_id.to_string()))?;
    if card.merged_with.is_none() {
        return Ok(false);
    }
    card.merged_with = None;
    Ok(true)
}

/// Detach every child of `parent_id`. Returns the ids that were detached.
pub fn release_children(store: &mut EntityStore, parent_id: &str) -> Vec<String> {
    let ids: Vec<String> = store
        .children_of(parent_id)
        .iter()
        .map(|c| c.id.clone())
        .collect();
    for id in &ids {
        if let Some(card) = store.card_mut(id) {
            card.merged_with = None;
        }
    }
    ids
}

/// Votes shown on a card: its own plus those of all its children.
pub fn vote_rollup(store: &EntityStore, card_id: &str) -> usize {
    let own = store.votes_for_card(card_id).len();
    let children: usize = store
        .children_of(card_id)
        .iter()
        .map(|c| store.votes_for_card(&c.id).len())
        .sum();
    own + children
}

/// True when no card's parent is itself a child.
pub fn is_flat(store: &EntityStore) -> bool {
    store.cards().all(|card| match card.merged_with.as_deref() {
        Some(parent) => store
            .card(parent)
            .map_or(true, |p| p.merged_with.is_none()),
        None => true,
    })
}

fn push_unique(ids: &mut Vec<String>, id: &str) {
    if !ids.iter().any(|existing| existing == id) {
        ids.push(id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::tests::card;
    use crate::store::tests::{sample_store, vote};
    use crate::types::Row;

    fn parent_of(store: &EntityStore, id: &str) -> Option<String> {
        store.card(id).and_then(|c| c.merged_with.clone())
    }

    #[test]
    fn test_self_combine_rejected() {
        let mut store = sample_store();
        let before = store.clone();
        assert_eq!(
            combine(&mut store, "a1", "a1"),
            Err(ValidationError::SelfCombine("a1".to_string()))
        );
        assert_eq!(store, before);
    }

    #[test]
    fn test_combine_moves_child_into_parent_column() {
        let mut store = sample_store();
        let changed = combine(&mut store, "a1", "b1c").unwrap();
        assert!(changed.contains(&"b1c".to_string()));
        let child = store.card("b1c").unwrap();
        assert_eq!(child.merged_with.as_deref(), Some("a1"));
        assert_eq!(child.column_id, "A");
        assert!(store.cards_in_column("B").is_empty());
        let positions: Vec<i32> = store.cards_in_column("A").iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[test]
    fn test_combine_is_idempotent() {
        let mut store = sample_store();
        combine(&mut store, "a1", "b1c").unwrap();
        let after_first = store.clone();
        let changed = combine(&mut store, "a1", "b1c").unwrap();
        assert!(changed.is_empty());
        assert_eq!(store, after_first);
        assert_eq!(store.children_of("a1").len(), 1);
    }

    #[test]
    fn test_combine_flattens_grandchildren() {
        // Z combined into Y, then Y combined into X: Z ends up under X.
        let mut store = sample_store();
        store.put_row(Row::Card(card("X", "A", 2)));
        store.put_row(Row::Card(card("Y", "B", 1)));
        store.put_row(Row::Card(card("Z", "B", 2)));

        combine(&mut store, "Y", "Z").unwrap();
        assert_eq!(parent_of(&store, "Z").as_deref(), Some("Y"));

        combine(&mut store, "X", "Y").unwrap();
        assert_eq!(parent_of(&store, "Y").as_deref(), Some("X"));
        assert_eq!(parent_of(&store, "Z").as_deref(), Some("X"));
        assert_eq!(store.card("Z").unwrap().column_id, "A");
        assert!(is_flat(&store));
    }

    #[test]
    fn test_combine_into_child_targets_root() {
        let mut store = sample_store();
        combine(&mut store, "a1", "a2").unwrap();
        // a2 is a child; combining b1c into it lands under a1.
        combine(&mut store, "a2", "b1c").unwrap();
        assert_eq!(parent_of(&store, "b1c").as_deref(), Some("a1"));
        assert!(is_flat(&store));
    }

    #[test]
    fn test_combine_parent_into_own_child_swaps_roles() {
        let mut store = sample_store();
        combine(&mut store, "a1", "a2").unwrap();
        combine(&mut store, "a1", "b1c").unwrap();
        // a2 is a child of a1; now fold a1 into a2.
        combine(&mut store, "a2", "a1").unwrap();
        assert_eq!(parent_of(&store, "a2"), None);
        assert_eq!(parent_of(&store, "a1").as_deref(), Some("a2"));
        assert_eq!(parent_of(&store, "b1c").as_deref(), Some("a2"));
        assert!(is_flat(&store));
    }

    #[test]
    fn test_never_chains_under_mixed_sequence() {
        let mut store = sample_store();
        for (id, pos) in [("c", 3), ("d", 4), ("e", 5)] {
            store.put_row(Row::Card(card(id, "A", pos)));
        }
        let steps: [(&str, &str); 8] = [
            ("a1", "a2"),
            ("c", "a1"),
            ("d", "e"),
            ("a2", "d"),
            ("e", "c"),
            ("b1c", "e"),
            ("a1", "b1c"),
            ("c", "a2"),
        ];
        for (parent, child) in steps {
            let _ = combine(&mut store, parent, child);
            assert!(is_flat(&store), "chain after combining {} into {}", child, parent);
            if child == "d" {
                uncombine(&mut store, "a1").unwrap();
                assert!(is_flat(&store));
            }
        }
    }

    #[test]
    fn test_uncombine() {
        let mut store = sample_store();
        assert!(!uncombine(&mut store, "a1").unwrap());
        combine(&mut store, "a1", "b1c").unwrap();
        assert!(uncombine(&mut store, "b1c").unwrap());
        let card = store.card("b1c").unwrap();
        assert_eq!(card.merged_with, None);
        assert_eq!(card.column_id, "A");
        assert!(matches!(
            uncombine(&mut store, "ghost"),
            Err(ValidationError::CardNotFound(_))
        ));
    }

    #[test]
    fn test_votes_stay_on_child_and_roll_up() {
        let mut store = sample_store();
        store.put_row(Row::Vote(vote("v1", "a1", "p1")));
        store.put_row(Row::Vote(vote("v2", "b1c", "p1")));
        store.put_row(Row::Vote(vote("v3", "b1c", "p2")));
        combine(&mut store, "a1", "b1c").unwrap();
        assert_eq!(store.votes_for_card("b1c").len(), 2);
        assert_eq!(store.votes_for_card("a1").len(), 1);
        assert_eq!(store.vote_count(), 3);
        assert_eq!(vote_rollup(&store, "a1"), 3);
    }

    #[test]
    fn test_release_children() {
        let mut store = sample_store();
        combine(&mut store, "a1", "a2").unwrap();
        combine(&mut store, "a1", "b1c").unwrap();
        let mut released = release_children(&mut store, "a1");
        released.sort();
        assert_eq!(released, vec!["a2", "b1c"]);
        assert!(store.children_of("a1").is_empty());
    }
}
