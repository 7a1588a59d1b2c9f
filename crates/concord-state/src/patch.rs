//! Common section patches
//!
//! A patch is any `FnOnce(&mut SectionValue) -> ConcordResult<()>`; these
//! are the ones the application reaches for most.

use serde_json::Value;

use concord_core::{ConcordError, ConcordResult, Conversation, SectionValue};

/// Shallow-merge an object into a record section; `null` fields are removed
pub fn merge_record(fields: Value) -> impl FnOnce(&mut SectionValue) -> ConcordResult<()> + Send {
    move |value: &mut SectionValue| {
        let section = value.key();
        let Value::Object(fields) = fields else {
            return Err(ConcordError::validation(section, "record patch must be an object"));
        };
        let record = value
            .record_mut()
            .ok_or_else(|| ConcordError::validation(section, "not a record section"))?;

        for (name, field) in fields {
            if field.is_null() {
                record.remove(&name);
            } else {
                record.insert(name, field);
            }
        }
        Ok(())
    }
}

/// Replace the whole section value
pub fn replace(new_value: SectionValue) -> impl FnOnce(&mut SectionValue) -> ConcordResult<()> + Send {
    move |value: &mut SectionValue| {
        *value = new_value;
        Ok(())
    }
}

/// Insert or replace a conversation by id
pub fn upsert_conversation(
    conversation: Conversation,
) -> impl FnOnce(&mut SectionValue) -> ConcordResult<()> + Send {
    move |value: &mut SectionValue| {
        let section = value.key();
        let map = value
            .conversations_mut()
            .ok_or_else(|| ConcordError::validation(section, "not the conversation section"))?;
        map.insert(conversation.id.clone(), conversation);
        Ok(())
    }
}

/// Remove a conversation; removing a missing id is not an error
pub fn remove_conversation(
    id: impl Into<String>,
) -> impl FnOnce(&mut SectionValue) -> ConcordResult<()> + Send {
    let id = id.into();
    move |value: &mut SectionValue| {
        let section = value.key();
        let map = value
            .conversations_mut()
            .ok_or_else(|| ConcordError::validation(section, "not the conversation section"))?;
        map.remove(&id);
        Ok(())
    }
}

/// Point the UI at a conversation (or none)
pub fn set_active_conversation(
    id: Option<String>,
) -> impl FnOnce(&mut SectionValue) -> ConcordResult<()> + Send {
    move |value: &mut SectionValue| {
        let section = value.key();
        let ui = value
            .ui_mut()
            .ok_or_else(|| ConcordError::validation(section, "not the ui section"))?;
        ui.active_conversation = id;
        Ok(())
    }
}

/// Expand or collapse a UI panel
pub fn set_expanded(
    panel: impl Into<String>,
    expanded: bool,
) -> impl FnOnce(&mut SectionValue) -> ConcordResult<()> + Send {
    let panel = panel.into();
    move |value: &mut SectionValue| {
        let section = value.key();
        let ui = value
            .ui_mut()
            .ok_or_else(|| ConcordError::validation(section, "not the ui section"))?;
        if expanded {
            ui.expanded.insert(panel);
        } else {
            ui.expanded.remove(&panel);
        }
        Ok(())
    }
}
