use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Author name used when the joining participant cannot be resolved.
pub const ANONYMOUS_AUTHOR: &str = "Anonymous";

/// Generate a fresh entity id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BoardTemplate {
    MadSadGlad,
    LikedLearnedLacked,
    StartStopContinue,
    WentWellDidntAction,
    #[default]
    Custom,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardVisibility {
    #[default]
    Hidden,
    Visible,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardSettings {
    pub card_visibility: CardVisibility,
    pub voting_enabled: bool,
    pub max_votes_per_participant: u32,
    pub max_votes_per_card: u32,
    pub secret_voting: bool,
    pub board_locked: bool,
    pub card_creation_disabled: bool,
    pub anonymous_cards: bool,
    pub highlighted_card_id: Option<String>,
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            card_visibility: CardVisibility::Hidden,
            voting_enabled: false,
            max_votes_per_participant: 5,
            max_votes_per_card: 1,
            secret_voting: false,
            board_locked: false,
            card_creation_disabled: false,
            anonymous_cards: false,
            highlighted_card_id: None,
        }
    }
}

/// Shallow settings patch. Present fields overwrite, absent fields are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_visibility: Option<CardVisibility>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voting_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_votes_per_participant: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_votes_per_card: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_voting: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub board_locked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_creation_disabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anonymous_cards: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlighted_card_id: Option<Option<String>>,
}

impl SettingsPatch {
    pub fn apply(&self, settings: &mut BoardSettings) {
        if let Some(v) = self.card_visibility {
            settings.card_visibility = v;
        }
        if let Some(v) = self.voting_enabled {
            settings.voting_enabled = v;
        }
        if let Some(v) = self.max_votes_per_participant {
            settings.max_votes_per_participant = v;
        }
        if let Some(v) = self.max_votes_per_card {
            settings.max_votes_per_card = v;
        }
        if let Some(v) = self.secret_voting {
            settings.secret_voting = v;
        }
        if let Some(v) = self.board_locked {
            settings.board_locked = v;
        }
        if let Some(v) = self.card_creation_disabled {
            settings.card_creation_disabled = v;
        }
        if let Some(v) = self.anonymous_cards {
            settings.anonymous_cards = v;
        }
        if let Some(v) = &self.highlighted_card_id {
            settings.highlighted_card_id = v.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub template: BoardTemplate,
    /// Owner participant id, assigned to the first admin on join.
    pub created_by: Option<String>,
    #[serde(default)]
    pub settings: BoardSettings,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Board {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub id: String,
    pub board_id: String,
    pub title: String,
    pub description: Option<String>,
    pub color: String,
    pub position: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
}

impl ColumnPatch {
    pub fn apply(&self, column: &mut Column) {
        if let Some(title) = &self.title {
            column.title = title.clone();
        }
        if let Some(color) = &self.color {
            column.color = color.clone();
        }
        if let Some(description) = &self.description {
            column.description = description.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub column_id: String,
    pub board_id: String,
    pub text: String,
    pub author_name: String,
    pub author_id: String,
    pub color: Option<String>,
    pub position: i32,
    /// Parent card when this card is combined into another one.
    pub merged_with: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CardPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<Option<String>>,
}

impl CardPatch {
    pub fn apply(&self, card: &mut Card) {
        if let Some(text) = &self.text {
            card.text = text.clone();
        }
        if let Some(color) = &self.color {
            card.color = color.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub id: String,
    pub card_id: String,
    pub board_id: String,
    pub voter_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionItemStatus {
    #[default]
    Open,
    InProgress,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionItem {
    pub id: String,
    pub board_id: String,
    pub description: String,
    pub assignee: Option<String>,
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub status: ActionItemStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionItemPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<NaiveDate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ActionItemStatus>,
}

impl ActionItemPatch {
    pub fn apply(&self, item: &mut ActionItem) {
        if let Some(description) = &self.description {
            item.description = description.clone();
        }
        if let Some(assignee) = &self.assignee {
            item.assignee = assignee.clone();
        }
        if let Some(due_date) = self.due_date {
            item.due_date = due_date;
        }
        if let Some(status) = self.status {
            item.status = status;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub board_id: String,
    pub display_name: String,
    pub is_admin: bool,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Durable tables, named the way the record store names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Boards,
    Columns,
    Cards,
    Votes,
    ActionItems,
    Participants,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Boards => "boards",
            Table::Columns => "columns",
            Table::Cards => "cards",
            Table::Votes => "votes",
            Table::ActionItems => "action_items",
            Table::Participants => "participants",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a single row: its table plus its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    pub table: Table,
    pub id: String,
}

impl RowKey {
    pub fn new(table: Table, id: impl Into<String>) -> Self {
        Self {
            table,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.table, self.id)
    }
}

/// A full row of any durable table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum Row {
    #[serde(rename = "boards")]
    Board(Board),
    #[serde(rename = "columns")]
    Column(Column),
    #[serde(rename = "cards")]
    Card(Card),
    #[serde(rename = "votes")]
    Vote(Vote),
    #[serde(rename = "action_items")]
    ActionItem(ActionItem),
    #[serde(rename = "participants")]
    Participant(Participant),
}

impl Row {
    pub fn table(&self) -> Table {
        match self {
            Row::Board(_) => Table::Boards,
            Row::Column(_) => Table::Columns,
            Row::Card(_) => Table::Cards,
            Row::Vote(_) => Table::Votes,
            Row::ActionItem(_) => Table::ActionItems,
            Row::Participant(_) => Table::Participants,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Row::Board(b) => &b.id,
            Row::Column(c) => &c.id,
            Row::Card(c) => &c.id,
            Row::Vote(v) => &v.id,
            Row::ActionItem(a) => &a.id,
            Row::Participant(p) => &p.id,
        }
    }

    /// The board this row belongs to. A board row belongs to itself.
    pub fn board_id(&self) -> &str {
        match self {
            Row::Board(b) => &b.id,
            Row::Column(c) => &c.board_id,
            Row::Card(c) => &c.board_id,
            Row::Vote(v) => &v.board_id,
            Row::ActionItem(a) => &a.board_id,
            Row::Participant(p) => &p.board_id,
        }
    }

    pub fn key(&self) -> RowKey {
        RowKey::new(self.table(), self.id())
    }
}

/// Every row of one board, as returned by a full fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardSnapshot {
    pub board: Option<Board>,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub cards: Vec<Card>,
    #[serde(default)]
    pub votes: Vec<Vote>,
    #[serde(default)]
    pub action_items: Vec<ActionItem>,
    #[serde(default)]
    pub participants: Vec<Participant>,
}

impl BoardSnapshot {
    /// Flatten into rows, board first so dependents can reference it.
    pub fn into_rows(self) -> Vec<Row> {
        let mut rows = Vec::new();
        if let Some(board) = self.board {
            rows.push(Row::Board(board));
        }
        rows.extend(self.columns.into_iter().map(Row::Column));
        rows.extend(self.cards.into_iter().map(Row::Card));
        rows.extend(self.votes.into_iter().map(Row::Vote));
        rows.extend(self.action_items.into_iter().map(Row::ActionItem));
        rows.extend(self.participants.into_iter().map(Row::Participant));
        rows
    }
}
