/// In-memory snapshot of one board's entities.
///
/// Pure data: no I/O, no notion of optimism or conflict. Lookups and removals
/// of unknown ids are no-ops rather than errors.
use std::collections::HashMap;

use crate::position::{self, Positioned};
use crate::types::*;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityStore {
    board: Option<Board>,
    columns: HashMap<String, Column>,
    cards: HashMap<String, Card>,
    votes: HashMap<String, Vote>,
    action_items: HashMap<String, ActionItem>,
    participants: HashMap<String, Participant>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: BoardSnapshot) -> Self {
        let mut store = Self::new();
        store.replace_all(snapshot);
        store
    }

    /// Drop everything and load `snapshot` in its place.
    pub fn replace_all(&mut self, snapshot: BoardSnapshot) {
        *self = Self::default();
        for row in snapshot.into_rows() {
            self.put_row(row);
        }
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        let mut columns: Vec<Column> = self.columns.values().cloned().collect();
        columns.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        let mut cards: Vec<Card> = self.cards.values().cloned().collect();
        cards.sort_by(|a, b| {
            a.column_id
                .cmp(&b.column_id)
                .then_with(|| a.position.cmp(&b.position))
                .then_with(|| a.id.cmp(&b.id))
        });
        let mut votes: Vec<Vote> = self.votes.values().cloned().collect();
        votes.sort_by(|a, b| a.id.cmp(&b.id));
        let mut action_items: Vec<ActionItem> = self.action_items.values().cloned().collect();
        action_items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let mut participants: Vec<Participant> = self.participants.values().cloned().collect();
        participants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));

        BoardSnapshot {
            board: self.board.clone(),
            columns,
            cards,
            votes,
            action_items,
            participants,
        }
    }

    // ── Generic row access ──────────────────────────────────────────────────

    pub fn contains(&self, key: &RowKey) -> bool {
        match key.table {
            Table::Boards => self.board.as_ref().is_some_and(|b| b.id == key.id),
            Table::Columns => self.columns.contains_key(&key.id),
            Table::Cards => self.cards.contains_key(&key.id),
            Table::Votes => self.votes.contains_key(&key.id),
            Table::ActionItems => self.action_items.contains_key(&key.id),
            Table::Participants => self.participants.contains_key(&key.id),
        }
    }

    pub fn get_row(&self, key: &RowKey) -> Option<Row> {
        match key.table {
            Table::Boards => self
                .board
                .as_ref()
                .filter(|b| b.id == key.id)
                .cloned()
                .map(Row::Board),
            Table::Columns => self.columns.get(&key.id).cloned().map(Row::Column),
            Table::Cards => self.cards.get(&key.id).cloned().map(Row::Card),
            Table::Votes => self.votes.get(&key.id).cloned().map(Row::Vote),
            Table::ActionItems => self.action_items.get(&key.id).cloned().map(Row::ActionItem),
            Table::Participants => self.participants.get(&key.id).cloned().map(Row::Participant),
        }
    }

    /// Insert or overwrite a row.
    pub fn put_row(&mut self, row: Row) {
        match row {
            Row::Board(b) => self.board = Some(b),
            Row::Column(c) => {
                self.columns.insert(c.id.clone(), c);
            }
            Row::Card(c) => {
                self.cards.insert(c.id.clone(), c);
            }
            Row::Vote(v) => {
                self.votes.insert(v.id.clone(), v);
            }
            Row::ActionItem(a) => {
                self.action_items.insert(a.id.clone(), a);
            }
            Row::Participant(p) => {
                self.participants.insert(p.id.clone(), p);
            }
        }
    }

    /// Insert a row only if its id is unknown. Returns whether it was inserted.
    pub fn insert_row(&mut self, row: Row) -> bool {
        if self.contains(&row.key()) {
            return false;
        }
        self.put_row(row);
        true
    }

    /// Overwrite a row only if its id is known. Returns whether it was replaced.
    pub fn replace_row(&mut self, row: Row) -> bool {
        if !self.contains(&row.key()) {
            return false;
        }
        self.put_row(row);
        true
    }

    /// Remove a single row without cascading.
    pub fn remove_row(&mut self, key: &RowKey) -> Option<Row> {
        match key.table {
            Table::Boards => {
                if self.board.as_ref().is_some_and(|b| b.id == key.id) {
                    self.board.take().map(Row::Board)
                } else {
                    None
                }
            }
            Table::Columns => self.columns.remove(&key.id).map(Row::Column),
            Table::Cards => self.cards.remove(&key.id).map(Row::Card),
            Table::Votes => self.votes.remove(&key.id).map(Row::Vote),
            Table::ActionItems => self.action_items.remove(&key.id).map(Row::ActionItem),
            Table::Participants => self.participants.remove(&key.id).map(Row::Participant),
        }
    }

    /// Rows that disappear together with `key`: a column takes its cards and
    /// their votes, a card takes its votes. The root row itself is excluded.
    pub fn cascade_keys(&self, key: &RowKey) -> Vec<RowKey> {
        let mut keys = Vec::new();
        match key.table {
            Table::Columns => {
                for card in self.cards.values().filter(|c| c.column_id == key.id) {
                    keys.extend(self.vote_keys_for_card(&card.id));
                    keys.push(RowKey::new(Table::Cards, card.id.clone()));
                }
            }
            Table::Cards => keys.extend(self.vote_keys_for_card(&key.id)),
            _ => {}
        }
        keys
    }

    /// Remove a row and everything that cascades from it. Returns every removed row.
    pub fn remove_cascade(&mut self, key: &RowKey) -> Vec<Row> {
        let mut removed = Vec::new();
        for dependent in self.cascade_keys(key) {
            if let Some(row) = self.remove_row(&dependent) {
                removed.push(row);
            }
        }
        if let Some(row) = self.remove_row(key) {
            removed.push(row);
        }
        removed
    }

    fn vote_keys_for_card(&self, card_id: &str) -> Vec<RowKey> {
        self.votes
            .values()
            .filter(|v| v.card_id == card_id)
            .map(|v| RowKey::new(Table::Votes, v.id.clone()))
            .collect()
    }

    // ── Typed reads ─────────────────────────────────────────────────────────

    pub fn board(&self) -> Option<&Board> {
        self.board.as_ref()
    }

    pub fn board_mut(&mut self) -> Option<&mut Board> {
        self.board.as_mut()
    }

    pub fn column(&self, id: &str) -> Option<&Column> {
        self.columns.get(id)
    }

    pub fn column_mut(&mut self, id: &str) -> Option<&mut Column> {
        self.columns.get_mut(id)
    }

    pub fn card(&self, id: &str) -> Option<&Card> {
        self.cards.get(id)
    }

    pub fn card_mut(&mut self, id: &str) -> Option<&mut Card> {
        self.cards.get_mut(id)
    }

    pub fn vote(&self, id: &str) -> Option<&Vote> {
        self.votes.get(id)
    }

    pub fn action_item(&self, id: &str) -> Option<&ActionItem> {
        self.action_items.get(id)
    }

    pub fn action_item_mut(&mut self, id: &str) -> Option<&mut ActionItem> {
        self.action_items.get_mut(id)
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn card_count(&self) -> usize {
        self.cards.len()
    }

    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }

    /// Columns of the board in display order.
    pub fn columns(&self) -> Vec<&Column> {
        let Some(board) = self.board.as_ref() else {
            let mut all: Vec<&Column> = self.columns.values().collect();
            all.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
            return all;
        };
        position::ordered_ids(&self.columns, &board.id)
            .iter()
            .filter_map(|id| self.columns.get(id))
            .collect()
    }

    /// Cards of a column in display order.
    pub fn cards_in_column(&self, column_id: &str) -> Vec<&Card> {
        position::ordered_ids(&self.cards, column_id)
            .iter()
            .filter_map(|id| self.cards.get(id))
            .collect()
    }

    pub fn cards(&self) -> impl Iterator<Item = &Card> {
        self.cards.values()
    }

    /// Cards whose `merged_with` points at `parent_id`.
    pub fn children_of(&self, parent_id: &str) -> Vec<&Card> {
        let mut children: Vec<&Card> = self
            .cards
            .values()
            .filter(|c| c.merged_with.as_deref() == Some(parent_id))
            .collect();
        children.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        children
    }

    pub fn votes_for_card(&self, card_id: &str) -> Vec<&Vote> {
        self.votes.values().filter(|v| v.card_id == card_id).collect()
    }

    pub fn votes_by_voter(&self, voter_id: &str) -> Vec<&Vote> {
        self.votes.values().filter(|v| v.voter_id == voter_id).collect()
    }

    pub fn find_vote(&self, card_id: &str, voter_id: &str) -> Option<&Vote> {
        self.votes
            .values()
            .find(|v| v.card_id == card_id && v.voter_id == voter_id)
    }

    pub fn action_items(&self) -> Vec<&ActionItem> {
        let mut items: Vec<&ActionItem> = self.action_items.values().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        items
    }

    pub fn participants(&self) -> Vec<&Participant> {
        let mut all: Vec<&Participant> = self.participants.values().collect();
        all.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn has_admin(&self) -> bool {
        self.participants.values().any(|p| p.is_admin)
    }

    // ── Ordering ────────────────────────────────────────────────────────────

    /// Move a card to `column_id` at `index`. Returns the cards whose placement changed.
    pub fn move_card(&mut self, card_id: &str, column_id: &str, index: usize) -> Option<Vec<String>> {
        position::move_item(&mut self.cards, card_id, column_id, index)
    }

    /// Reorder a column within its board. Returns the columns whose position changed.
    pub fn move_column(&mut self, column_id: &str, index: usize) -> Option<Vec<String>> {
        let board_id = self.columns.get(column_id)?.container().to_string();
        position::move_item(&mut self.columns, column_id, &board_id, index)
    }

    pub fn next_card_position(&self, column_id: &str) -> i32 {
        position::next_position(&self.cards, column_id)
    }

    pub fn next_column_position(&self, board_id: &str) -> i32 {
        position::next_position(&self.columns, board_id)
    }

    pub fn reindex_cards(&mut self, column_id: &str) -> Vec<String> {
        position::reindex(&mut self.cards, column_id)
    }
}
