//! Stage 1: propose glossary entries from raw chapter text.
//!
//! The generation model never sees the existing glossary; it only mines
//! candidate terms from the text. Reconciling proposals against the stored
//! glossary is stage 2 ([`super::resolver`]).

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;

use super::NewEntry;
use crate::ai::Completion;
use crate::extract::extract_json;
use crate::prompts;
use crate::queue::RequestQueue;
use crate::textutil::chunk_by_chars;

static VALUE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[.*\] .*$").unwrap());

/// Chunks the paragraph texts by character budget, runs one generation
/// prompt per chunk through the queue, and consolidates the valid
/// responses. Invalid or failed responses are dropped.
pub async fn generate_proposals<C: Completion>(
    queue: &RequestQueue<C>,
    texts: &[String],
    max_chunk_chars: usize,
) -> Vec<NewEntry> {
    let chunks = chunk_by_chars(texts.iter().map(String::as_str), max_chunk_chars);
    let prompts = chunks.iter().map(|c| prompts::stage1_prompt(c)).collect();

    let outcomes = queue
        .enqueue_all_with(prompts, |outcome| {
            if !outcome.is_ok() {
                log::error!("Glossary generation task {} failed", outcome.task_id);
            }
        })
        .await;

    let mut proposals = Vec::new();
    for outcome in &outcomes {
        if let Ok(response) = &outcome.result {
            let parsed = extract_json(response);
            match validate_response(&parsed) {
                Some(entries) => proposals.extend(entries),
                None => log::warn!(
                    "Dropping malformed glossary generation response for task {}",
                    outcome.task_id
                ),
            }
        }
    }
    proposals
}

/// Checks the stage-1 response shape: an `entries` array where every entry
/// has non-empty, unique, all-string keys and a `[category] ...` value.
/// Returns `None` if any entry is out of shape; the whole response is then
/// discarded.
pub fn validate_response(value: &Value) -> Option<Vec<NewEntry>> {
    let entries = value.get("entries")?.as_array()?;
    let mut result = Vec::with_capacity(entries.len());

    for entry in entries {
        let keys = entry.get("keys")?.as_array()?;
        if keys.is_empty() {
            return None;
        }
        let mut parsed_keys = Vec::with_capacity(keys.len());
        for key in keys {
            parsed_keys.push(key.as_str()?.to_string());
        }
        let unique: HashSet<&String> = parsed_keys.iter().collect();
        if unique.len() != parsed_keys.len() {
            return None;
        }

        let value_text = entry.get("value")?.as_str()?;
        if !VALUE_PATTERN.is_match(value_text) {
            return None;
        }

        result.push(NewEntry {
            keys: parsed_keys,
            value: value_text.to_string(),
        });
    }
    Some(result)
}
