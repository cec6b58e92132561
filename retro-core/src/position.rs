/// Dense position ordering for columns (within a board) and cards (within a column).
///
/// Every structural change reassigns positions 0..N-1 in each touched container,
/// so ties can't survive a move. Ordering reads sort by (position, id) which
/// makes a corrupted container with duplicate positions deterministic to repair.
use std::collections::HashMap;

use crate::types::{Card, Column};

/// An item that lives at an integer position inside a container.
pub trait Positioned {
    fn item_id(&self) -> &str;
    fn container(&self) -> &str;
    fn position(&self) -> i32;
    fn place(&mut self, container: &str, position: i32);
}

impl Positioned for Card {
    fn item_id(&self) -> &str {
        &self.id
    }

    fn container(&self) -> &str {
        &self.column_id
    }

    fn position(&self) -> i32 {
        self.position
    }

    fn place(&mut self, container: &str, position: i32) {
        if self.column_id != container {
            self.column_id = container.to_string();
        }
        self.position = position;
    }
}

impl Positioned for Column {
    fn item_id(&self) -> &str {
        &self.id
    }

    fn container(&self) -> &str {
        &self.board_id
    }

    fn position(&self) -> i32 {
        self.position
    }

    fn place(&mut self, container: &str, position: i32) {
        if self.board_id != container {
            self.board_id = container.to_string();
        }
        self.position = position;
    }
}

/// Ids of the items in `container`, in display order.
pub fn ordered_ids<T: Positioned>(items: &HashMap<String, T>, container: &str) -> Vec<String> {
    let mut members: Vec<&T> = items
        .values()
        .filter(|item| item.container() == container)
        .collect();
    members.sort_by(|a, b| {
        a.position()
            .cmp(&b.position())
            .then_with(|| a.item_id().cmp(b.item_id()))
    });
    members
        .into_iter()
        .map(|item| item.item_id().to_string())
        .collect()
}

/// Position for an item appended to the end of `container`.
pub fn next_position<T: Positioned>(items: &HashMap<String, T>, container: &str) -> i32 {
    items
        .values()
        .filter(|item| item.container() == container)
        .map(|item| item.position())
        .max()
        .map_or(0, |max| max + 1)
}

/// Move `item_id` into `target` at `target_index` (clamped to the container length).
///
/// Returns `None` when the item is unknown, otherwise the ids whose container or
/// position changed. Replaying the same move returns an empty list.
pub fn move_item<T: Positioned>(
    items: &mut HashMap<String, T>,
    item_id: &str,
    target: &str,
    target_index: usize,
) -> Option<Vec<String>> {
    let source = items.get(item_id)?.container().to_string();

    let mut target_order: Vec<String> = ordered_ids(items, target)
        .into_iter()
        .filter(|id| id != item_id)
        .collect();
    let index = target_index.min(target_order.len());
    target_order.insert(index, item_id.to_string());

    let mut changed = assign(items, target, &target_order);
    if source != target {
        let source_order: Vec<String> = ordered_ids(items, &source)
            .into_iter()
            .filter(|id| id != item_id)
            .collect();
        changed.extend(assign(items, &source, &source_order));
    }
    Some(changed)
}

/// Repair `container` into dense 0..N-1 order. Returns the ids that moved.
pub fn reindex<T: Positioned>(items: &mut HashMap<String, T>, container: &str) -> Vec<String> {
    let order = ordered_ids(items, container);
    assign(items, container, &order)
}

fn assign<T: Positioned>(items: &mut HashMap<String, T>, container: &str, order: &[String]) -> Vec<String> {
    let mut changed = Vec::new();
    for (index, id) in order.iter().enumerate() {
        let Some(item) = items.get_mut(id) else {
            continue;
        };
        let position = index as i32;
        if item.container() != container || item.position() != position {
            item.place(container, position);
            changed.push(id.clone());
        }
    }
    changed
}
