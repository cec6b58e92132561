/// Optimistic mutation gateway.
///
/// Every intent runs the same four steps:
/// 1. validate against the local snapshot (fail fast, nothing touched)
/// 2. apply to the store under one lock, remembering the prior rows
/// 3. issue the durable writes
/// 4. on failure put the prior rows back and return the error; if some of the
///    intent's writes were already accepted, re-read the board instead
///
/// Successful writes come back later as change-stream echoes; the reconciler
/// recognizes them as already applied.
use std::sync::{Arc, PoisonError, RwLock};

use chrono::NaiveDate;

use crate::backend::RecordStore;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{StoreError, SyncError, ValidationError};
use crate::merge;
use crate::state::SharedStore;
use crate::store::EntityStore;
use crate::types::*;

/// Outcome of a vote toggle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteToggle {
    Added(Vote),
    Removed(Vote),
    /// The participant is out of votes; nothing changed.
    CapReached,
}

#[derive(Debug, Clone)]
enum Write {
    Insert(Row),
    Update(Row),
    Delete(RowKey),
}

impl Write {
    fn key(&self) -> RowKey {
        match self {
            Write::Insert(row) | Write::Update(row) => row.key(),
            Write::Delete(key) => key.clone(),
        }
    }
}

/// Prior versions of every row an intent touched. `None` means the row did
/// not exist before.
#[derive(Debug, Default)]
struct Undo {
    priors: Vec<(RowKey, Option<Row>)>,
}

impl Undo {
    fn capture(&mut self, store: &EntityStore, key: RowKey) {
        if self.priors.iter().any(|(k, _)| k == &key) {
            return;
        }
        let prior = store.get_row(&key);
        self.priors.push((key, prior));
    }

    fn revert(self, store: &mut EntityStore) {
        for (key, prior) in self.priors.into_iter().rev() {
            match prior {
                Some(row) => store.put_row(row),
                None => {
                    store.remove_row(&key);
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.priors.len()
    }
}

/// Writes plus the undo record for one intent.
#[derive(Debug, Default)]
struct Pending {
    writes: Vec<Write>,
    undo: Undo,
}

impl Pending {
    fn insert(&mut self, store: &mut EntityStore, row: Row) {
        self.undo.capture(store, row.key());
        store.put_row(row.clone());
        self.writes.push(Write::Insert(row));
    }

    /// Remember `key` before it is mutated in place.
    fn touch(&mut self, store: &EntityStore, key: RowKey) {
        self.undo.capture(store, key);
    }

    /// Queue an update carrying the current version of `key`.
    fn update(&mut self, store: &EntityStore, key: &RowKey) {
        if let Some(row) = store.get_row(key) {
            self.writes.push(Write::Update(row));
        }
    }

    /// Queue updates for rows changed between `before` and `store`.
    fn updates_since(&mut self, before: &EntityStore, store: &EntityStore, table: Table, ids: &[String]) {
        for id in ids {
            let key = RowKey::new(table, id.clone());
            self.undo.capture(before, key.clone());
            self.update(store, &key);
        }
    }

    /// Remove `key` with its cascade and queue a single delete for the root.
    fn delete(&mut self, store: &mut EntityStore, key: RowKey) {
        for dependent in store.cascade_keys(&key) {
            self.undo.capture(store, dependent);
        }
        self.undo.capture(store, key.clone());
        store.remove_cascade(&key);
        self.writes.push(Write::Delete(key));
    }
}

fn loaded_board(store: &EntityStore) -> Result<&Board, ValidationError> {
    store.board().ok_or(ValidationError::BoardNotLoaded)
}

fn writable_board(store: &EntityStore) -> Result<&Board, ValidationError> {
    let board = loaded_board(store)?;
    if board.is_archived() {
        return Err(ValidationError::BoardArchived);
    }
    Ok(board)
}

fn non_empty(text: &str, what: &'static str) -> Result<String, ValidationError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyText(what));
    }
    Ok(trimmed.to_string())
}

fn board_key(board: &Board) -> RowKey {
    RowKey::new(Table::Boards, board.id.clone())
}

/// Issue one durable write, treating a missing answer as a failure.
async fn send_write(records: &dyn RecordStore, write: Write, config: &EngineConfig) -> Result<(), StoreError> {
    let request = match write {
        Write::Insert(row) => records.insert(row),
        Write::Update(row) => records.update(row),
        Write::Delete(key) => records.delete(key),
    };
    match tokio::time::timeout(config.write_timeout(), request).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(config.write_timeout_ms)),
    }
}

/// Read every row of `board_id` and replace the local snapshot wholesale.
pub async fn refresh_snapshot(
    records: &dyn RecordStore,
    board_id: &str,
    state: &SharedStore,
    config: &EngineConfig,
) -> Result<(), StoreError> {
    let snapshot = match tokio::time::timeout(config.write_timeout(), records.fetch(board_id)).await {
        Ok(result) => result?,
        Err(_) => return Err(StoreError::Timeout(config.write_timeout_ms)),
    };
    if snapshot.board.is_none() {
        return Err(StoreError::BoardNotFound(board_id.to_string()));
    }
    log::info!(
        "[retro.gateway.fetch] Loaded board {} ({} columns, {} cards, {} votes)",
        board_id,
        snapshot.columns.len(),
        snapshot.cards.len(),
        snapshot.votes.len()
    );
    state.replace_all(snapshot);
    Ok(())
}

/// Create a board, plus its template columns, directly in the record store.
pub async fn create_board(
    records: &dyn RecordStore,
    clock: &dyn Clock,
    title: &str,
    description: Option<String>,
    template: BoardTemplate,
) -> Result<Board, SyncError> {
    let title = non_empty(title, "board title")?;
    let now = clock.now();
    let board = Board {
        id: new_id(),
        title,
        description: description.filter(|d| !d.trim().is_empty()),
        template,
        created_by: None,
        settings: BoardSettings::default(),
        created_at: now,
        archived_at: None,
    };
    records.insert(Row::Board(board.clone())).await?;

    for (index, column) in template.columns().iter().enumerate() {
        let row = Column {
            id: new_id(),
            board_id: board.id.clone(),
            title: column.title.to_string(),
            description: column.description.map(str::to_string),
            color: column.color.to_string(),
            position: index as i32,
            created_at: now,
        };
        records.insert(Row::Column(row)).await?;
    }

    log::info!(
        "[retro.gateway.create] Created board {} from template {:?}",
        board.id,
        template
    );
    Ok(board)
}

/// Applies local intents optimistically and makes them durable.
#[derive(Clone)]
pub struct Gateway {
    board_id: String,
    state: SharedStore,
    records: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    participant: Arc<RwLock<Option<String>>>,
}

impl Gateway {
    pub fn new(
        board_id: impl Into<String>,
        state: SharedStore,
        records: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            board_id: board_id.into(),
            state,
            records,
            clock,
            config,
            participant: Arc::new(RwLock::new(None)),
        }
    }

    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    pub fn state(&self) -> &SharedStore {
        &self.state
    }

    /// The participant this client acts as, once joined.
    pub fn participant_id(&self) -> Option<String> {
        self.participant
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_participant(&self, id: Option<String>) {
        *self.participant.write().unwrap_or_else(PoisonError::into_inner) = id;
    }

    fn require_participant(&self, action: &'static str) -> Result<String, ValidationError> {
        self.participant_id().ok_or(ValidationError::NotJoined(action))
    }

    /// Whether the board has been completed. Columns, cards and votes are
    /// read-only once it has.
    pub fn is_archived(&self) -> bool {
        self.state
            .read(|store| store.board().is_some_and(Board::is_archived))
    }

    pub async fn load(&self) -> Result<(), SyncError> {
        refresh_snapshot(self.records.as_ref(), &self.board_id, &self.state, &self.config).await?;
        Ok(())
    }

    async fn commit(&self, intent: &'static str, pending: Pending) -> Result<(), SyncError> {
        let Pending { writes, undo } = pending;
        let mut accepted = 0;
        for write in writes {
            let key = write.key();
            if let Err(e) = send_write(self.records.as_ref(), write, &self.config).await {
                log::warn!(
                    "[retro.gateway.{}] Write to {} failed, restoring {} rows: {}",
                    intent,
                    key,
                    undo.len(),
                    e
                );
                self.state.update(move |store| undo.revert(store));
                if accepted > 0 {
                    // Earlier writes are durable and their echoes may already be
                    // consumed; read back what the store actually holds.
                    if let Err(refetch) =
                        refresh_snapshot(self.records.as_ref(), &self.board_id, &self.state, &self.config)
                            .await
                    {
                        log::warn!(
                            "[retro.gateway.{}] Re-fetch after partial write failed: {}",
                            intent,
                            refetch
                        );
                    }
                }
                return Err(SyncError::Write(e));
            }
            accepted += 1;
        }
        log::debug!("[retro.gateway.{}] Committed", intent);
        Ok(())
    }

    // ── Participants ────────────────────────────────────────────────────────

    /// Join the board under `display_name`. The first participant on a board
    /// without an admin becomes admin and owner.
    pub async fn join(&self, display_name: &str) -> Result<Participant, SyncError> {
        let display_name = non_empty(display_name, "display name")?;
        let now = self.clock.now();
        let (participant, pending) = self.state.try_update(|store| {
            let board = loaded_board(store)?.clone();
            let participant = Participant {
                id: new_id(),
                board_id: board.id.clone(),
                display_name,
                is_admin: !store.has_admin(),
                joined_at: now,
                last_seen: now,
            };
            let mut pending = Pending::default();
            pending.insert(store, Row::Participant(participant.clone()));
            if participant.is_admin && board.created_by.is_none() {
                let key = board_key(&board);
                pending.touch(store, key.clone());
                if let Some(b) = store.board_mut() {
                    b.created_by = Some(participant.id.clone());
                }
                pending.update(store, &key);
            }
            Ok::<_, ValidationError>((participant, pending))
        })?;
        self.commit("join", pending).await?;
        self.set_participant(Some(participant.id.clone()));
        log::info!(
            "[retro.gateway.join] {} joined board {} (admin={})",
            participant.id,
            self.board_id,
            participant.is_admin
        );
        Ok(participant)
    }

    /// Act as a participant that joined earlier.
    pub fn resume(&self, participant_id: &str) -> Result<Participant, SyncError> {
        let participant = self
            .state
            .read(|store| store.participant(participant_id).cloned())
            .ok_or_else(|| ValidationError::ParticipantNotFound(participant_id.to_string()))?;
        self.set_participant(Some(participant.id.clone()));
        Ok(participant)
    }

    // ── Board ───────────────────────────────────────────────────────────────

    pub async fn update_settings(&self, patch: SettingsPatch) -> Result<BoardSettings, SyncError> {
        let (settings, pending) = self.state.try_update(|store| {
            let key = board_key(writable_board(store)?);
            let mut pending = Pending::default();
            pending.touch(store, key.clone());
            let settings = match store.board_mut() {
                Some(board) => {
                    patch.apply(&mut board.settings);
                    board.settings.clone()
                }
                None => return Err(ValidationError::BoardNotLoaded),
            };
            pending.update(store, &key);
            Ok((settings, pending))
        })?;
        self.commit("settings", pending).await?;
        Ok(settings)
    }

    /// One-way completion: archive, reveal every card and lock the board.
    pub async fn complete_board(&self) -> Result<(), SyncError> {
        let now = self.clock.now();
        let pending = self.state.try_update(|store| {
            let board = loaded_board(store)?;
            let mut pending = Pending::default();
            if board.is_archived() {
                return Ok(pending);
            }
            let key = board_key(board);
            pending.touch(store, key.clone());
            if let Some(board) = store.board_mut() {
                board.archived_at = Some(now);
                board.settings.card_visibility = CardVisibility::Visible;
                board.settings.board_locked = true;
            }
            pending.update(store, &key);
            Ok::<_, ValidationError>(pending)
        })?;
        self.commit("complete", pending).await?;
        log::info!("[retro.gateway.complete] Board {} archived", self.board_id);
        Ok(())
    }

    // ── Columns ─────────────────────────────────────────────────────────────

    pub async fn add_column(
        &self,
        title: &str,
        color: &str,
        description: Option<String>,
    ) -> Result<Column, SyncError> {
        let title = non_empty(title, "column title")?;
        let now = self.clock.now();
        let max_columns = self.config.max_columns;
        let (column, pending) = self.state.try_update(|store| {
            let board_id = writable_board(store)?.id.clone();
            if store.column_count() >= max_columns {
                return Err(ValidationError::TooManyColumns { max: max_columns });
            }
            let column = Column {
                id: new_id(),
                position: store.next_column_position(&board_id),
                board_id,
                title,
                description,
                color: color.to_string(),
                created_at: now,
            };
            let mut pending = Pending::default();
            pending.insert(store, Row::Column(column.clone()));
            Ok((column, pending))
        })?;
        self.commit("add_column", pending).await?;
        Ok(column)
    }

    pub async fn update_column(&self, column_id: &str, patch: ColumnPatch) -> Result<(), SyncError> {
        if let Some(title) = &patch.title {
            non_empty(title, "column title")?;
        }
        let pending = self.state.try_update(|store| {
            writable_board(store)?;
            let key = RowKey::new(Table::Columns, column_id);
            let mut pending = Pending::default();
            pending.touch(store, key.clone());
            let column = store
                .column_mut(column_id)
                .ok_or_else(|| ValidationError::ColumnNotFound(column_id.to_string()))?;
            patch.apply(column);
            pending.update(store, &key);
            Ok::<_, ValidationError>(pending)
        })?;
        self.commit("update_column", pending).await
    }

    /// Delete a column with its cards and their votes.
    pub async fn delete_column(&self, column_id: &str) -> Result<(), SyncError> {
        let pending = self.state.try_update(|store| {
            writable_board(store)?;
            if store.column(column_id).is_none() {
                return Err(ValidationError::ColumnNotFound(column_id.to_string()));
            }
            let mut pending = Pending::default();
            pending.delete(store, RowKey::new(Table::Columns, column_id));
            Ok(pending)
        })?;
        self.commit("delete_column", pending).await
    }

    pub async fn move_column(&self, column_id: &str, index: usize) -> Result<(), SyncError> {
        let pending = self.state.try_update(|store| {
            writable_board(store)?;
            let before = store.clone();
            let changed = store
                .move_column(column_id, index)
                .ok_or_else(|| ValidationError::ColumnNotFound(column_id.to_string()))?;
            let mut pending = Pending::default();
            pending.updates_since(&before, store, Table::Columns, &changed);
            Ok::<_, ValidationError>(pending)
        })?;
        self.commit("move_column", pending).await
    }

    // ── Cards ───────────────────────────────────────────────────────────────

    pub async fn add_card(&self, column_id: &str, text: &str) -> Result<Card, SyncError> {
        let text = non_empty(text, "card text")?;
        let author_id = self.require_participant("adding cards")?;
        let now = self.clock.now();
        let (card, pending) = self.state.try_update(|store| {
            let board = writable_board(store)?;
            if board.settings.board_locked || board.settings.card_creation_disabled {
                return Err(ValidationError::CardCreationDisabled);
            }
            let board_id = board.id.clone();
            if store.column(column_id).is_none() {
                return Err(ValidationError::ColumnNotFound(column_id.to_string()));
            }
            let author_name = store
                .participant(&author_id)
                .map(|p| p.display_name.clone())
                .unwrap_or_else(|| ANONYMOUS_AUTHOR.to_string());
            let card = Card {
                id: new_id(),
                column_id: column_id.to_string(),
                board_id,
                text,
                author_name,
                author_id,
                color: None,
                position: store.next_card_position(column_id),
                merged_with: None,
                created_at: now,
                updated_at: now,
            };
            let mut pending = Pending::default();
            pending.insert(store, Row::Card(card.clone()));
            Ok((card, pending))
        })?;
        self.commit("add_card", pending).await?;
        Ok(card)
    }

    pub async fn update_card(&self, card_id: &str, patch: CardPatch) -> Result<(), SyncError> {
        if let Some(text) = &patch.text {
            non_empty(text, "card text")?;
        }
        let now = self.clock.now();
        let pending = self.state.try_update(|store| {
            writable_board(store)?;
            let key = RowKey::new(Table::Cards, card_id);
            let mut pending = Pending::default();
            pending.touch(store, key.clone());
            let card = store
                .card_mut(card_id)
                .ok_or_else(|| ValidationError::CardNotFound(card_id.to_string()))?;
            patch.apply(card);
            card.updated_at = now;
            pending.update(store, &key);
            Ok::<_, ValidationError>(pending)
        })?;
        self.commit("update_card", pending).await
    }

    /// Delete a card with its votes. Its children are released in place.
    pub async fn delete_card(&self, card_id: &str) -> Result<(), SyncError> {
        let pending = self.state.try_update(|store| {
            writable_board(store)?;
            if store.card(card_id).is_none() {
                return Err(ValidationError::CardNotFound(card_id.to_string()));
            }
            let before = store.clone();
            let released = merge::release_children(store, card_id);
            let mut pending = Pending::default();
            pending.updates_since(&before, store, Table::Cards, &released);
            pending.delete(store, RowKey::new(Table::Cards, card_id));
            Ok(pending)
        })?;
        self.commit("delete_card", pending).await
    }

    /// Move a card to `column_id` at `index`. A parent takes its children
    /// along; a child moved out of its parent's column is released.
    pub async fn move_card(&self, card_id: &str, column_id: &str, index: usize) -> Result<(), SyncError> {
        let pending = self.state.try_update(|store| {
            writable_board(store)?;
            let card = store
                .card(card_id)
                .ok_or_else(|| ValidationError::CardNotFound(card_id.to_string()))?;
            if store.column(column_id).is_none() {
                return Err(ValidationError::ColumnNotFound(column_id.to_string()));
            }
            let leaves_column = card.column_id != column_id;
            let is_child = card.merged_with.is_some();
            let children: Vec<String> = store
                .children_of(card_id)
                .iter()
                .map(|c| c.id.clone())
                .collect();

            let before = store.clone();
            let mut changed = store.move_card(card_id, column_id, index).unwrap_or_default();
            if leaves_column && is_child && merge::uncombine(store, card_id)? {
                changed.push(card_id.to_string());
            }
            if leaves_column {
                for child in &children {
                    changed.extend(store.move_card(child, column_id, usize::MAX).unwrap_or_default());
                }
            }
            changed.sort();
            changed.dedup();

            let mut pending = Pending::default();
            pending.updates_since(&before, store, Table::Cards, &changed);
            Ok(pending)
        })?;
        self.commit("move_card", pending).await
    }

    pub async fn combine_cards(&self, parent_id: &str, child_id: &str) -> Result<(), SyncError> {
        let pending = self.state.try_update(|store| {
            writable_board(store)?;
            let before = store.clone();
            let changed = merge::combine(store, parent_id, child_id)?;
            let mut pending = Pending::default();
            pending.updates_since(&before, store, Table::Cards, &changed);
            Ok::<_, ValidationError>(pending)
        })?;
        self.commit("combine", pending).await
    }

    /// Returns `false` when the card had no parent.
    pub async fn uncombine_card(&self, child_id: &str) -> Result<bool, SyncError> {
        let (detached, pending) = self.state.try_update(|store| {
            writable_board(store)?;
            let key = RowKey::new(Table::Cards, child_id);
            let mut pending = Pending::default();
            pending.touch(store, key.clone());
            let detached = merge::uncombine(store, child_id)?;
            if detached {
                pending.update(store, &key);
            }
            Ok::<_, ValidationError>((detached, pending))
        })?;
        self.commit("uncombine", pending).await?;
        Ok(detached)
    }

    // ── Votes ───────────────────────────────────────────────────────────────

    /// Remove this participant's vote on the card, or cast one if they still
    /// have votes left. Running out of votes is not an error.
    pub async fn toggle_vote(&self, card_id: &str) -> Result<VoteToggle, SyncError> {
        let voter_id = self.require_participant("voting")?;
        let now = self.clock.now();
        let (outcome, pending) = self.state.try_update(|store| {
            let board = writable_board(store)?;
            if !board.settings.voting_enabled {
                return Err(ValidationError::VotingDisabled);
            }
            let settings = board.settings.clone();
            let board_id = board.id.clone();
            if store.card(card_id).is_none() {
                return Err(ValidationError::CardNotFound(card_id.to_string()));
            }

            let mut pending = Pending::default();
            if let Some(existing) = store.find_vote(card_id, &voter_id).cloned() {
                pending.delete(store, RowKey::new(Table::Votes, existing.id.clone()));
                return Ok((VoteToggle::Removed(existing), pending));
            }

            let used = store.votes_by_voter(&voter_id).len();
            let on_card = store
                .votes_for_card(card_id)
                .iter()
                .filter(|v| v.voter_id == voter_id)
                .count();
            if used >= settings.max_votes_per_participant as usize
                || on_card >= settings.max_votes_per_card as usize
            {
                return Ok((VoteToggle::CapReached, pending));
            }

            let vote = Vote {
                id: new_id(),
                card_id: card_id.to_string(),
                board_id,
                voter_id: voter_id.clone(),
                created_at: now,
            };
            pending.insert(store, Row::Vote(vote.clone()));
            Ok((VoteToggle::Added(vote), pending))
        })?;
        if outcome == VoteToggle::CapReached {
            log::debug!("[retro.gateway.vote] {} is out of votes", voter_id);
        }
        self.commit("vote", pending).await?;
        Ok(outcome)
    }

    // ── Action items ────────────────────────────────────────────────────────
    // Still editable after the board is archived.

    pub async fn add_action_item(
        &self,
        description: &str,
        assignee: Option<String>,
        due_date: Option<NaiveDate>,
    ) -> Result<ActionItem, SyncError> {
        let description = non_empty(description, "action item")?;
        let now = self.clock.now();
        let (item, pending) = self.state.try_update(|store| {
            let board_id = loaded_board(store)?.id.clone();
            let item = ActionItem {
                id: new_id(),
                board_id,
                description,
                assignee,
                due_date,
                status: ActionItemStatus::Open,
                created_at: now,
            };
            let mut pending = Pending::default();
            pending.insert(store, Row::ActionItem(item.clone()));
            Ok::<_, ValidationError>((item, pending))
        })?;
        self.commit("add_action_item", pending).await?;
        Ok(item)
    }

    pub async fn update_action_item(&self, item_id: &str, patch: ActionItemPatch) -> Result<(), SyncError> {
        if let Some(description) = &patch.description {
            non_empty(description, "action item")?;
        }
        let pending = self.state.try_update(|store| {
            loaded_board(store)?;
            let key = RowKey::new(Table::ActionItems, item_id);
            let mut pending = Pending::default();
            pending.touch(store, key.clone());
            let item = store
                .action_item_mut(item_id)
                .ok_or_else(|| ValidationError::ActionItemNotFound(item_id.to_string()))?;
            patch.apply(item);
            pending.update(store, &key);
            Ok::<_, ValidationError>(pending)
        })?;
        self.commit("update_action_item", pending).await
    }

    pub async fn delete_action_item(&self, item_id: &str) -> Result<(), SyncError> {
        let pending = self.state.try_update(|store| {
            loaded_board(store)?;
            if store.action_item(item_id).is_none() {
                return Err(ValidationError::ActionItemNotFound(item_id.to_string()));
            }
            let mut pending = Pending::default();
            pending.delete(store, RowKey::new(Table::ActionItems, item_id));
            Ok(pending)
        })?;
        self.commit("delete_action_item", pending).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryClient, MemoryHub};
    use crate::backend::{Subscription, Transport};
    use crate::clock::SystemClock;
    use crate::position::tests::card;
    use crate::reconciler::Reconciler;
    use crate::store::tests::{board, column, vote};
    use futures_util::future::{join_all, BoxFuture};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    /// Rejects the `fail_on`-th update. Accepted updates answer only after
    /// their echo has had a chance to reach subscribers.
    struct FlakyUpdates {
        inner: MemoryClient,
        updates: AtomicUsize,
        fail_on: usize,
    }

    impl RecordStore for FlakyUpdates {
        fn fetch(&self, board_id: &str) -> BoxFuture<'_, Result<BoardSnapshot, StoreError>> {
            self.inner.fetch(board_id)
        }

        fn insert(&self, row: Row) -> BoxFuture<'_, Result<(), StoreError>> {
            self.inner.insert(row)
        }

        fn update(&self, row: Row) -> BoxFuture<'_, Result<(), StoreError>> {
            Box::pin(async move {
                let n = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
                if n == self.fail_on {
                    return Err(StoreError::Rejected("second write".to_string()));
                }
                self.inner.update(row).await?;
                settle().await;
                Ok(())
            })
        }

        fn delete(&self, key: RowKey) -> BoxFuture<'_, Result<(), StoreError>> {
            self.inner.delete(key)
        }

        fn subscribe(&self, board_id: &str) -> BoxFuture<'_, Result<Subscription, StoreError>> {
            self.inner.subscribe(board_id)
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn seed(hub: &MemoryHub) {
        let mut b = board("b1");
        b.settings.voting_enabled = true;
        hub.seed(BoardSnapshot {
            board: Some(b),
            columns: vec![column("A", 0), column("B", 1)],
            cards: vec![card("C1", "A", 0)],
            ..Default::default()
        });
    }

    fn gateway_for(hub: &MemoryHub) -> Gateway {
        let (events, _) = broadcast::channel(64);
        let client = hub.connect();
        Gateway::new(
            "b1",
            SharedStore::new(events),
            client.records(),
            Arc::new(SystemClock),
            EngineConfig::default(),
        )
    }

    async fn joined() -> (MemoryHub, Gateway) {
        let hub = MemoryHub::new();
        seed(&hub);
        let gateway = gateway_for(&hub);
        gateway.load().await.unwrap();
        gateway.join("Ada").await.unwrap();
        (hub, gateway)
    }

    fn column_ids(gateway: &Gateway, column: &str) -> Vec<String> {
        gateway.state().read(|s| {
            s.cards_in_column(column)
                .iter()
                .map(|c| c.id.clone())
                .collect()
        })
    }

    #[tokio::test]
    async fn test_move_card_to_empty_column() {
        let (hub, gateway) = joined().await;
        gateway.move_card("C1", "B", 0).await.unwrap();
        assert!(column_ids(&gateway, "A").is_empty());
        assert_eq!(column_ids(&gateway, "B"), vec!["C1"]);
        let durable = hub.snapshot("b1");
        let c1 = durable.cards.iter().find(|c| c.id == "C1").unwrap();
        assert_eq!((c1.column_id.as_str(), c1.position), ("B", 0));
    }

    #[tokio::test]
    async fn test_failed_move_rolls_back() {
        let (hub, gateway) = joined().await;
        gateway.add_card("B", "second").await.unwrap();
        let before = gateway.state().snapshot();
        hub.reject_next_writes(1);
        let err = gateway.move_card("C1", "B", 0).await.unwrap_err();
        assert!(matches!(err, SyncError::Write(StoreError::Rejected(_))));
        assert_eq!(gateway.state().snapshot(), before);
    }

    #[tokio::test]
    async fn test_partial_write_failure_matches_store() {
        let hub = MemoryHub::new();
        seed(&hub);
        let client = hub.connect();
        client.insert(Row::Card(card("C2", "A", 1))).await.unwrap();

        let records: Arc<dyn RecordStore> = Arc::new(FlakyUpdates {
            inner: client,
            updates: AtomicUsize::new(0),
            fail_on: 2,
        });
        let (events, _) = broadcast::channel(64);
        let state = SharedStore::new(events);
        let gateway = Gateway::new(
            "b1",
            state.clone(),
            records.clone(),
            Arc::new(SystemClock),
            EngineConfig::default(),
        );
        gateway.load().await.unwrap();
        let _task = Reconciler::new("b1", state.clone(), records, EngineConfig::default())
            .start()
            .await
            .unwrap();
        settle().await;

        // C1 lands in B; repacking C2 in A is rejected.
        let err = gateway.move_card("C1", "B", 0).await.unwrap_err();
        assert!(matches!(err, SyncError::Write(StoreError::Rejected(_))));
        settle().await;

        let durable = hub.snapshot("b1");
        let c1 = durable.cards.iter().find(|c| c.id == "C1").unwrap();
        assert_eq!((c1.column_id.as_str(), c1.position), ("B", 0));
        assert_eq!(state.snapshot(), durable);
    }

    #[tokio::test]
    async fn test_failed_delete_restores_cascade() {
        let (hub, gateway) = joined().await;
        gateway.toggle_vote("C1").await.unwrap();
        let before = gateway.state().snapshot();
        hub.reject_next_writes(1);
        assert!(gateway.delete_column("A").await.is_err());
        assert_eq!(gateway.state().snapshot(), before);
        assert_eq!(gateway.state().read(|s| s.vote_count()), 1);
    }

    #[tokio::test]
    async fn test_validation_touches_nothing() {
        let (hub, gateway) = joined().await;
        let writes = hub.write_count();
        let before = gateway.state().snapshot();

        let err = gateway.combine_cards("C1", "C1").await.unwrap_err();
        assert_eq!(err, SyncError::Validation(ValidationError::SelfCombine("C1".into())));
        assert!(gateway.add_card("nope", "text").await.unwrap_err().is_validation());
        assert!(gateway.add_card("A", "   ").await.unwrap_err().is_validation());
        assert!(gateway.move_card("C1", "nope", 0).await.unwrap_err().is_validation());

        assert_eq!(hub.write_count(), writes);
        assert_eq!(gateway.state().snapshot(), before);
    }

    #[tokio::test]
    async fn test_missing_board_rejected_before_io() {
        let hub = MemoryHub::new();
        let gateway = gateway_for(&hub);
        let err = gateway.add_column("Ideas", "#fff", None).await.unwrap_err();
        assert_eq!(err, SyncError::Validation(ValidationError::BoardNotLoaded));
        assert_eq!(hub.write_count(), 0);
    }

    #[tokio::test]
    async fn test_toggle_vote_twice_restores_count() {
        let (_hub, gateway) = joined().await;
        let before = gateway.state().read(|s| s.votes_for_card("C1").len());
        assert!(matches!(gateway.toggle_vote("C1").await.unwrap(), VoteToggle::Added(_)));
        assert!(matches!(gateway.toggle_vote("C1").await.unwrap(), VoteToggle::Removed(_)));
        assert_eq!(gateway.state().read(|s| s.votes_for_card("C1").len()), before);
    }

    #[tokio::test]
    async fn test_vote_cap_is_silent() {
        let (hub, gateway) = joined().await;
        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(gateway.add_card("A", &format!("idea {}", i)).await.unwrap().id);
        }
        for id in &ids[..5] {
            gateway.toggle_vote(id).await.unwrap();
        }
        let writes = hub.write_count();
        assert_eq!(gateway.toggle_vote(&ids[5]).await.unwrap(), VoteToggle::CapReached);
        let me = gateway.participant_id().unwrap();
        assert_eq!(gateway.state().read(|s| s.votes_by_voter(&me).len()), 5);
        assert_eq!(hub.write_count(), writes);
    }

    #[tokio::test]
    async fn test_vote_cap_holds_under_interleaving() {
        let (hub, gateway) = joined().await;
        let mut ids = Vec::new();
        for i in 0..8 {
            ids.push(gateway.add_card("A", &format!("idea {}", i)).await.unwrap().id);
        }
        let outcomes = join_all(ids.iter().map(|id| gateway.toggle_vote(id))).await;
        let added = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(VoteToggle::Added(_))))
            .count();
        assert_eq!(added, 5);
        let me = gateway.participant_id().unwrap();
        assert_eq!(gateway.state().read(|s| s.votes_by_voter(&me).len()), 5);
        let durable = hub.snapshot("b1");
        assert_eq!(durable.votes.iter().filter(|v| v.voter_id == me).count(), 5);
    }

    #[tokio::test]
    async fn test_voting_disabled() {
        let (_hub, gateway) = joined().await;
        gateway
            .update_settings(SettingsPatch {
                voting_enabled: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        let err = gateway.toggle_vote("C1").await.unwrap_err();
        assert_eq!(err, SyncError::Validation(ValidationError::VotingDisabled));
    }

    #[tokio::test]
    async fn test_delete_column_cascades() {
        let hub = MemoryHub::new();
        let mut b = board("b1");
        b.settings.voting_enabled = true;
        hub.seed(BoardSnapshot {
            board: Some(b),
            columns: vec![column("A", 0), column("B", 1)],
            cards: vec![card("x", "A", 0), card("y", "A", 1), card("z", "B", 0)],
            votes: vec![vote("v1", "x", "p1"), vote("v2", "x", "p2"), vote("v3", "y", "p1")],
            ..Default::default()
        });
        let gateway = gateway_for(&hub);
        gateway.load().await.unwrap();

        gateway.delete_column("A").await.unwrap();
        gateway.state().read(|s| {
            assert!(s.column("A").is_none());
            assert_eq!(s.card_count(), 1);
            assert_eq!(s.vote_count(), 0);
        });
        let durable = hub.snapshot("b1");
        assert_eq!(durable.cards.len(), 1);
        assert!(durable.votes.is_empty());
    }

    #[tokio::test]
    async fn test_first_joiner_becomes_admin_once() {
        let (hub, first) = joined().await;
        let second = gateway_for(&hub);
        second.load().await.unwrap();
        let other = second.join("Grace").await.unwrap();
        assert!(!other.is_admin);

        let admin_id = first.participant_id().unwrap();
        let board = hub.snapshot("b1").board.unwrap();
        assert_eq!(board.created_by.as_deref(), Some(admin_id.as_str()));
        assert!(hub.snapshot("b1").participants.iter().any(|p| p.id == admin_id && p.is_admin));
    }

    #[tokio::test]
    async fn test_cards_need_join() {
        let hub = MemoryHub::new();
        seed(&hub);
        let gateway = gateway_for(&hub);
        gateway.load().await.unwrap();
        let err = gateway.add_card("A", "hello").await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(ValidationError::NotJoined(_))));
    }

    #[tokio::test]
    async fn test_locked_board_blocks_new_cards() {
        let (_hub, gateway) = joined().await;
        gateway
            .update_settings(SettingsPatch {
                board_locked: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        let err = gateway.add_card("A", "late idea").await.unwrap_err();
        assert_eq!(err, SyncError::Validation(ValidationError::CardCreationDisabled));
        // Existing cards can still be edited.
        gateway
            .update_card(
                "C1",
                CardPatch {
                    text: Some("edited".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_complete_board_is_terminal() {
        let (_hub, gateway) = joined().await;
        gateway.complete_board().await.unwrap();
        assert!(gateway.is_archived());
        gateway.state().read(|s| {
            let settings = &s.board().unwrap().settings;
            assert_eq!(settings.card_visibility, CardVisibility::Visible);
            assert!(settings.board_locked);
        });

        let archived = SyncError::Validation(ValidationError::BoardArchived);
        assert_eq!(gateway.move_card("C1", "B", 0).await.unwrap_err(), archived);
        assert_eq!(gateway.toggle_vote("C1").await.unwrap_err(), archived);
        assert_eq!(gateway.delete_column("A").await.unwrap_err(), archived);
        assert_eq!(
            gateway.add_column("More", "#000", None).await.unwrap_err(),
            archived
        );

        let item = gateway.add_action_item("Fix CI", None, None).await.unwrap();
        gateway
            .update_action_item(
                &item.id,
                ActionItemPatch {
                    status: Some(ActionItemStatus::Done),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        gateway.complete_board().await.unwrap();
    }

    #[tokio::test]
    async fn test_column_limit() {
        let hub = MemoryHub::new();
        seed(&hub);
        let (events, _) = broadcast::channel(16);
        let config = EngineConfig {
            max_columns: 3,
            ..Default::default()
        };
        let gateway = Gateway::new(
            "b1",
            SharedStore::new(events),
            hub.connect().records(),
            Arc::new(SystemClock),
            config,
        );
        gateway.load().await.unwrap();
        let third = gateway.add_column("Third", "#111", None).await.unwrap();
        assert_eq!(third.position, 2);
        let err = gateway.add_column("Fourth", "#222", None).await.unwrap_err();
        assert_eq!(err, SyncError::Validation(ValidationError::TooManyColumns { max: 3 }));
    }

    #[tokio::test]
    async fn test_move_column() {
        let (hub, gateway) = joined().await;
        gateway.move_column("B", 0).await.unwrap();
        let order: Vec<String> = gateway
            .state()
            .read(|s| s.columns().iter().map(|c| c.id.clone()).collect());
        assert_eq!(order, vec!["B", "A"]);
        let durable: Vec<(String, i32)> = hub
            .snapshot("b1")
            .columns
            .into_iter()
            .map(|c| (c.id, c.position))
            .collect();
        assert_eq!(durable, vec![("B".to_string(), 0), ("A".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_parent_move_carries_children() {
        let (_hub, gateway) = joined().await;
        let child = gateway.add_card("A", "dup").await.unwrap();
        gateway.combine_cards("C1", &child.id).await.unwrap();
        gateway.move_card("C1", "B", 0).await.unwrap();
        gateway.state().read(|s| {
            assert_eq!(s.card(&child.id).unwrap().column_id, "B");
            assert_eq!(s.card(&child.id).unwrap().merged_with.as_deref(), Some("C1"));
            assert!(s.cards_in_column("A").is_empty());
        });

        // Dragging the child elsewhere releases it.
        gateway.move_card(&child.id, "A", 0).await.unwrap();
        gateway.state().read(|s| assert_eq!(s.card(&child.id).unwrap().merged_with, None));
    }

    #[tokio::test]
    async fn test_delete_parent_releases_children() {
        let (hub, gateway) = joined().await;
        let child = gateway.add_card("B", "dup").await.unwrap();
        gateway.combine_cards("C1", &child.id).await.unwrap();
        gateway.delete_card("C1").await.unwrap();
        let durable = hub.snapshot("b1");
        let released = durable.cards.iter().find(|c| c.id == child.id).unwrap();
        assert_eq!(released.merged_with, None);
        assert_eq!(released.column_id, "A");
    }

    #[tokio::test]
    async fn test_create_board_from_template() {
        let hub = MemoryHub::new();
        let client = hub.connect();
        let records = client.records();
        let board = create_board(
            records.as_ref(),
            &SystemClock,
            "Sprint 7",
            None,
            BoardTemplate::StartStopContinue,
        )
        .await
        .unwrap();
        let snapshot = hub.snapshot(&board.id);
        let titles: Vec<(String, i32)> = snapshot
            .columns
            .into_iter()
            .map(|c| (c.title, c.position))
            .collect();
        assert_eq!(
            titles,
            vec![
                ("Start".to_string(), 0),
                ("Stop".to_string(), 1),
                ("Continue".to_string(), 2)
            ]
        );
        assert_eq!(snapshot.board.unwrap().created_by, None);
    }
}
