//! Merge-action vocabulary returned by the conflict-resolution model.
//!
//! The model answers with either a single action object or an array of
//! them. Parsing and validation are strict and all-or-nothing: one bad
//! action rejects the whole batch, which the caller treats as a no-op.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::{Glossary, GlossaryEntry, NewEntry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MergeAction {
    /// Leave the glossary as-is.
    None,
    /// Append the proposal verbatim; the caller assigns the id.
    AddEntry,
    Delete { id: u32 },
    /// Replace the entire value of the target entry.
    Update { id: u32, data: String },
    AddKey { id: u32, data: Vec<String> },
    DelKey { id: u32, data: Vec<String> },
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("action {index}: not a JSON object")]
    NotAnObject { index: usize },
    #[error("action {index}: {reason}")]
    Malformed { index: usize, reason: String },
    #[error("action {index} ({kind}): unexpected '{field}' field")]
    UnexpectedField {
        index: usize,
        kind: &'static str,
        field: &'static str,
    },
    #[error("action {index}: id {id} not in conflict set")]
    IdNotInConflictSet { index: usize, id: u32 },
}

/// Parses a model response into actions. Accepts a single object or an
/// array; shape errors reject the whole batch.
pub fn parse_actions(value: &Value) -> Result<Vec<MergeAction>, ActionError> {
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    let mut actions = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let object = item.as_object().ok_or(ActionError::NotAnObject { index })?;

        // Fields serde would silently ignore are contract violations here.
        let kind = object.get("action").and_then(Value::as_str).unwrap_or("");
        match kind {
            "none" | "add_entry" => {
                let label = if kind == "none" { "none" } else { "add_entry" };
                if object.contains_key("id") {
                    return Err(ActionError::UnexpectedField {
                        index,
                        kind: label,
                        field: "id",
                    });
                }
                if object.contains_key("data") {
                    return Err(ActionError::UnexpectedField {
                        index,
                        kind: label,
                        field: "data",
                    });
                }
            }
            "delete" => {
                if object.contains_key("data") {
                    return Err(ActionError::UnexpectedField {
                        index,
                        kind: "delete",
                        field: "data",
                    });
                }
            }
            _ => {}
        }

        let action: MergeAction =
            serde_json::from_value(item.clone()).map_err(|e| ActionError::Malformed {
                index,
                reason: e.to_string(),
            })?;
        actions.push(action);
    }
    Ok(actions)
}

/// Every id an action touches must belong to the conflict set computed
/// when the merge was scheduled. The model never sees other ids.
pub fn validate_actions(
    actions: &[MergeAction],
    conflict_ids: &HashSet<u32>,
) -> Result<(), ActionError> {
    for (index, action) in actions.iter().enumerate() {
        let id = match action {
            MergeAction::Delete { id }
            | MergeAction::Update { id, .. }
            | MergeAction::AddKey { id, .. }
            | MergeAction::DelKey { id, .. } => *id,
            MergeAction::None | MergeAction::AddEntry => continue,
        };
        if !conflict_ids.contains(&id) {
            return Err(ActionError::IdNotInConflictSet { index, id });
        }
    }
    Ok(())
}

/// Applies a validated batch. An action referencing an entry that another
/// action already deleted is logged and skipped; everything else lands.
pub fn apply_actions(
    glossary: &mut Glossary,
    actions: &[MergeAction],
    proposal: &NewEntry,
    next_id: &mut u32,
) {
    for action in actions {
        match action {
            MergeAction::None => {}
            MergeAction::AddEntry => {
                append_entry(glossary, proposal, next_id);
            }
            MergeAction::Delete { id } => {
                let before = glossary.entries.len();
                glossary.entries.retain(|e| e.id != *id);
                if glossary.entries.len() == before {
                    log::warn!("delete action: entry {} not found", id);
                }
            }
            MergeAction::Update { id, data } => match glossary.entry_mut(*id) {
                Some(entry) => entry.value = data.clone(),
                None => log::warn!("update action: entry {} not found", id),
            },
            MergeAction::AddKey { id, data } => match glossary.entry_mut(*id) {
                Some(entry) => {
                    for key in data {
                        if !entry.keys.contains(key) {
                            entry.keys.push(key.clone());
                        }
                    }
                }
                None => log::warn!("add_key action: entry {} not found", id),
            },
            MergeAction::DelKey { id, data } => match glossary.entry_mut(*id) {
                Some(entry) => entry.keys.retain(|k| !data.contains(k)),
                None => log::warn!("del_key action: entry {} not found", id),
            },
        }
    }
}

/// Appends a proposal as a stored entry with the next sequential id.
pub fn append_entry(glossary: &mut Glossary, proposal: &NewEntry, next_id: &mut u32) {
    glossary.entries.push(GlossaryEntry {
        id: *next_id,
        keys: proposal.keys.clone(),
        value: proposal.value.clone(),
    });
    *next_id += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conflict_ids(ids: &[u32]) -> HashSet<u32> {
        ids.iter().copied().collect()
    }

    fn glossary_with(entries: Vec<GlossaryEntry>) -> Glossary {
        Glossary { entries }
    }

    fn entry(id: u32, keys: &[&str], value: &str) -> GlossaryEntry {
        GlossaryEntry {
            id,
            keys: keys.iter().map(|s| s.to_string()).collect(),
            value: value.to_string(),
        }
    }

    #[test]
    fn parses_single_object_and_array() {
        let single = parse_actions(&json!({"action": "none"})).unwrap();
        assert_eq!(single, vec![MergeAction::None]);

        let batch = parse_actions(&json!([
            {"action": "update", "id": 7, "data": "[character] Name: Hanako (花子)"},
            {"action": "add_key", "id": 7, "data": ["はなこ"]},
            {"action": "delete", "id": 9}
        ]))
        .unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(
            batch[2],
            MergeAction::Delete { id: 9 }
        );
    }

    #[test]
    fn rejects_unknown_action_kind() {
        assert!(parse_actions(&json!({"action": "merge_all"})).is_err());
        assert!(parse_actions(&json!("none")).is_err());
    }

    #[test]
    fn rejects_extraneous_fields() {
        assert!(parse_actions(&json!({"action": "add_entry", "id": 3})).is_err());
        assert!(parse_actions(&json!({"action": "delete", "id": 3, "data": "x"})).is_err());
    }

    #[test]
    fn rejects_wrong_data_types() {
        assert!(parse_actions(&json!({"action": "update", "id": 3, "data": ["not", "a", "string"]}))
            .is_err());
        assert!(parse_actions(&json!({"action": "add_key", "id": 3, "data": "not-an-array"})).is_err());
    }

    #[test]
    fn validation_pins_ids_to_the_conflict_set() {
        let actions = parse_actions(&json!([
            {"action": "update", "id": 7, "data": "v"},
            {"action": "delete", "id": 8}
        ]))
        .unwrap();

        assert!(validate_actions(&actions, &conflict_ids(&[7, 8])).is_ok());
        let err = validate_actions(&actions, &conflict_ids(&[7])).unwrap_err();
        assert!(matches!(err, ActionError::IdNotInConflictSet { id: 8, .. }));
    }

    #[test]
    fn apply_runs_the_whole_batch() {
        let mut glossary = glossary_with(vec![
            entry(3, &["東雲", "しののめ"], "[character] Name: Shinonome (東雲)"),
            entry(5, &["氷姫"], "[character] Name: Ice Princess (氷姫)"),
        ]);
        let proposal = NewEntry {
            keys: vec!["東雲".to_string()],
            value: "[character] Name: Shinonome (東雲)".to_string(),
        };
        let actions = parse_actions(&json!([
            {"action": "update", "id": 3, "data": "[character] Name: Shinonome (東雲) | Nickname: Ice Princess (氷姫)"},
            {"action": "add_key", "id": 3, "data": ["氷姫"]},
            {"action": "delete", "id": 5}
        ]))
        .unwrap();

        let mut next_id = 6;
        apply_actions(&mut glossary, &actions, &proposal, &mut next_id);

        assert_eq!(glossary.entries.len(), 1);
        let merged = glossary.entry(3).unwrap();
        assert!(merged.value.contains("Ice Princess"));
        assert_eq!(merged.keys, vec!["東雲", "しののめ", "氷姫"]);
        assert_eq!(next_id, 6);
    }

    #[test]
    fn add_entry_uses_sequential_ids() {
        let mut glossary = glossary_with(vec![entry(17, &["京都"], "[location] Name: Kyoto (京都)")]);
        let proposal = NewEntry {
            keys: vec!["大阪".to_string()],
            value: "[location] Name: Osaka (大阪)".to_string(),
        };
        let actions = parse_actions(&json!([{"action": "add_entry"}])).unwrap();

        let mut next_id = 18;
        apply_actions(&mut glossary, &actions, &proposal, &mut next_id);

        assert_eq!(glossary.entries.len(), 2);
        assert_eq!(glossary.entry(18).unwrap().keys, vec!["大阪"]);
        assert_eq!(next_id, 19);
    }

    #[test]
    fn add_key_dedupes_existing_keys() {
        let mut glossary = glossary_with(vec![entry(1, &["花子"], "v")]);
        let actions =
            parse_actions(&json!({"action": "add_key", "id": 1, "data": ["花子", "はなこ"]}))
                .unwrap();
        let proposal = NewEntry {
            keys: vec![],
            value: String::new(),
        };
        let mut next_id = 2;
        apply_actions(&mut glossary, &actions, &proposal, &mut next_id);
        assert_eq!(glossary.entry(1).unwrap().keys, vec!["花子", "はなこ"]);
    }
}
