//! Section validation hooks
//!
//! Hooks run against the candidate value before a commit. A failing hook
//! rejects the whole mutation; nothing is applied.

use std::collections::HashMap;

use concord_core::{ConcordError, ConcordResult, SectionKey, SectionValue};

/// Validation hook for one section
pub type ValidationHook = Box<dyn Fn(&SectionValue) -> Result<(), String> + Send + Sync>;

/// Per-section validation hooks
#[derive(Default)]
pub struct ValidatorSet {
    hooks: HashMap<SectionKey, Vec<ValidationHook>>,
}

impl ValidatorSet {
    /// Shape check only
    pub fn new() -> Self {
        Self::default()
    }

    /// Shape check plus the built-in structural rules
    pub fn standard() -> Self {
        Self::new().with(SectionKey::Conversations, conversation_keys_match)
    }

    /// Add a hook for a section
    pub fn register<F>(&mut self, section: SectionKey, hook: F)
    where
        F: Fn(&SectionValue) -> Result<(), String> + Send + Sync + 'static,
    {
        self.hooks.entry(section).or_default().push(Box::new(hook));
    }

    pub fn with<F>(mut self, section: SectionKey, hook: F) -> Self
    where
        F: Fn(&SectionValue) -> Result<(), String> + Send + Sync + 'static,
    {
        self.register(section, hook);
        self
    }

    /// Validate a candidate value for `section`
    pub fn validate(&self, section: SectionKey, value: &SectionValue) -> ConcordResult<()> {
        if value.key() != section {
            return Err(ConcordError::validation(
                section,
                format!("value belongs to section {}", value.key()),
            ));
        }

        for hook in self.hooks.get(&section).into_iter().flatten() {
            hook(value).map_err(|reason| ConcordError::validation(section, reason))?;
        }
        Ok(())
    }
}

/// Conversation map keys must equal the conversation ids they hold
pub fn conversation_keys_match(value: &SectionValue) -> Result<(), String> {
    let Some(map) = value.conversations() else {
        return Ok(());
    };
    match map.iter().find(|(key, conversation)| *key != &conversation.id) {
        Some((key, conversation)) => Err(format!(
            "conversation stored under {} has id {}",
            key, conversation.id
        )),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::Conversation;
    use serde_json::json;

    #[test]
    fn test_shape_mismatch_rejected() {
        let validators = ValidatorSet::new();
        let value = SectionValue::default_for(SectionKey::Ui);

        assert!(matches!(
            validators.validate(SectionKey::Preferences, &value),
            Err(ConcordError::Validation { section: SectionKey::Preferences, .. })
        ));
    }

    #[test]
    fn test_custom_hook() {
        let validators = ValidatorSet::new().with(SectionKey::Preferences, |value| {
            match value.record().and_then(|r| r.get("theme")) {
                Some(theme) if theme != "light" && theme != "dark" => {
                    Err(format!("unsupported theme {}", theme))
                }
                _ => Ok(()),
            }
        });

        let mut value = SectionValue::default_for(SectionKey::Preferences);
        value.record_mut().unwrap().insert("theme".into(), json!("dark"));
        assert!(validators.validate(SectionKey::Preferences, &value).is_ok());

        value.record_mut().unwrap().insert("theme".into(), json!("neon"));
        assert!(validators.validate(SectionKey::Preferences, &value).is_err());
    }

    #[test]
    fn test_conversation_keys_match() {
        let mut value = SectionValue::default_for(SectionKey::Conversations);
        value
            .conversations_mut()
            .unwrap()
            .insert("c-1".into(), Conversation::new("c-2", "mismatch"));

        assert!(ValidatorSet::standard()
            .validate(SectionKey::Conversations, &value)
            .is_err());
    }
}
