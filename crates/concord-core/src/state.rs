//! State sections and snapshots
//!
//! Application state is a versioned aggregate of named sections.
//! Each section is replaced as a whole under last-writer-wins; there is
//! no field-level merge between contexts.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::{ConcordError, LogicalTime};

/// Named section of the application state
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SectionKey {
    /// Conversation collection keyed by id
    Conversations,
    /// User preferences record
    Preferences,
    /// Application settings record
    Settings,
    /// UI record
    Ui,
}

impl SectionKey {
    pub const ALL: [SectionKey; 4] = [
        SectionKey::Conversations,
        SectionKey::Preferences,
        SectionKey::Settings,
        SectionKey::Ui,
    ];

    /// Wire and storage name
    pub fn as_str(self) -> &'static str {
        match self {
            SectionKey::Conversations => "conversations",
            SectionKey::Preferences => "preferences",
            SectionKey::Settings => "settings",
            SectionKey::Ui => "ui",
        }
    }
}

impl fmt::Display for SectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SectionKey {
    type Err = ConcordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversations" => Ok(SectionKey::Conversations),
            "preferences" => Ok(SectionKey::Preferences),
            "settings" => Ok(SectionKey::Settings),
            "ui" => Ok(SectionKey::Ui),
            other => Err(ConcordError::UnknownSection(other.to_string())),
        }
    }
}

/// Free-form record section (preferences, settings)
pub type Record = BTreeMap<String, Value>;

/// Conversation collection, keyed by conversation id
pub type ConversationMap = BTreeMap<String, Conversation>;

/// Single chat message inside a conversation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub timestamp: u64,
}

/// Conversation entity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    pub tags: BTreeSet<String>,
    pub updated_at: u64,
}

impl Conversation {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Conversation {
            id: id.into(),
            title: title.into(),
            messages: Vec::new(),
            tags: BTreeSet::new(),
            updated_at: 0,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_message(mut self, role: &str, content: &str, timestamp: u64) -> Self {
        self.messages.push(ChatMessage {
            role: role.to_string(),
            content: content.to_string(),
            timestamp,
        });
        self.updated_at = self.updated_at.max(timestamp);
        self
    }
}

/// UI section
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UiState {
    /// Conversation currently shown, if any
    pub active_conversation: Option<String>,
    /// Expanded panels / tree nodes
    pub expanded: BTreeSet<String>,
    /// Remaining UI fields
    pub fields: Record,
}

/// Value of one section; one variant per [`SectionKey`]
#[derive(Clone, Debug, PartialEq)]
pub enum SectionValue {
    Conversations(ConversationMap),
    Preferences(Record),
    Settings(Record),
    Ui(UiState),
}

impl SectionValue {
    /// Empty value for a section
    pub fn default_for(key: SectionKey) -> Self {
        match key {
            SectionKey::Conversations => SectionValue::Conversations(ConversationMap::new()),
            SectionKey::Preferences => SectionValue::Preferences(Record::new()),
            SectionKey::Settings => SectionValue::Settings(Record::new()),
            SectionKey::Ui => SectionValue::Ui(UiState::default()),
        }
    }

    /// Section this value belongs to
    pub fn key(&self) -> SectionKey {
        match self {
            SectionValue::Conversations(_) => SectionKey::Conversations,
            SectionValue::Preferences(_) => SectionKey::Preferences,
            SectionValue::Settings(_) => SectionKey::Settings,
            SectionValue::Ui(_) => SectionKey::Ui,
        }
    }

    /// Record view (preferences, settings, UI fields)
    pub fn record(&self) -> Option<&Record> {
        match self {
            SectionValue::Preferences(r) | SectionValue::Settings(r) => Some(r),
            SectionValue::Ui(ui) => Some(&ui.fields),
            SectionValue::Conversations(_) => None,
        }
    }

    pub fn record_mut(&mut self) -> Option<&mut Record> {
        match self {
            SectionValue::Preferences(r) | SectionValue::Settings(r) => Some(r),
            SectionValue::Ui(ui) => Some(&mut ui.fields),
            SectionValue::Conversations(_) => None,
        }
    }

    pub fn conversations(&self) -> Option<&ConversationMap> {
        match self {
            SectionValue::Conversations(map) => Some(map),
            _ => None,
        }
    }

    pub fn conversations_mut(&mut self) -> Option<&mut ConversationMap> {
        match self {
            SectionValue::Conversations(map) => Some(map),
            _ => None,
        }
    }

    pub fn ui_mut(&mut self) -> Option<&mut UiState> {
        match self {
            SectionValue::Ui(ui) => Some(ui),
            _ => None,
        }
    }
}

/// A section value with the logical timestamp of its last committed write
#[derive(Clone, Debug, PartialEq)]
pub struct SectionState {
    pub value: SectionValue,
    pub timestamp: LogicalTime,
}

impl SectionState {
    pub fn new(value: SectionValue, timestamp: LogicalTime) -> Self {
        SectionState { value, timestamp }
    }

    /// Default value, never written
    pub fn initial(key: SectionKey) -> Self {
        SectionState {
            value: SectionValue::default_for(key),
            timestamp: LogicalTime::ZERO,
        }
    }
}

/// Versioned aggregate of all sections
/// INVARIANT: every [`SectionKey`] is present
#[derive(Clone, Debug, PartialEq)]
pub struct StateSnapshot {
    pub version: u64,
    pub sections: BTreeMap<SectionKey, SectionState>,
}

impl StateSnapshot {
    pub fn new() -> Self {
        StateSnapshot {
            version: 0,
            sections: SectionKey::ALL
                .iter()
                .map(|&key| (key, SectionState::initial(key)))
                .collect(),
        }
    }

    pub fn section(&self, key: SectionKey) -> &SectionState {
        // Every key is inserted at construction and never removed
        &self.sections[&key]
    }

    pub fn section_mut(&mut self, key: SectionKey) -> &mut SectionState {
        self.sections
            .entry(key)
            .or_insert_with(|| SectionState::initial(key))
    }

    /// Highest section timestamp (what a fresh clock must observe after load)
    pub fn latest_timestamp(&self) -> LogicalTime {
        self.sections
            .values()
            .map(|s| s.timestamp)
            .max()
            .unwrap_or(LogicalTime::ZERO)
    }
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

/// Addresses one entity inside a section
///
/// For the conversation collection `id` is the conversation id; for
/// record sections it is the field name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub section: SectionKey,
    pub id: String,
}

impl EntityKey {
    pub fn new(section: SectionKey, id: impl Into<String>) -> Self {
        EntityKey {
            section,
            id: id.into(),
        }
    }

    pub fn conversation(id: impl Into<String>) -> Self {
        Self::new(SectionKey::Conversations, id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.section, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_key_parse_roundtrip() {
        for key in SectionKey::ALL {
            assert_eq!(key.as_str().parse::<SectionKey>().unwrap(), key);
        }
        assert!(matches!(
            "billing".parse::<SectionKey>(),
            Err(ConcordError::UnknownSection(_))
        ));
    }

    #[test]
    fn test_snapshot_has_every_section() {
        let snapshot = StateSnapshot::new();
        assert_eq!(snapshot.sections.len(), SectionKey::ALL.len());
        for key in SectionKey::ALL {
            assert_eq!(snapshot.section(key).value.key(), key);
            assert!(snapshot.section(key).timestamp.is_zero());
        }
    }

    #[test]
    fn test_record_view_covers_ui_fields() {
        let mut value = SectionValue::default_for(SectionKey::Ui);
        value
            .record_mut()
            .unwrap()
            .insert("sidebar".into(), Value::Bool(true));

        assert_eq!(value.record().unwrap().len(), 1);
        assert!(value.conversations().is_none());
    }
}
