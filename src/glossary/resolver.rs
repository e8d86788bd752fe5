//! Stage 2: merge stage-1 proposals into the stored glossary.
//!
//! Proposals without key overlap are applied directly. Conflicting
//! proposals go to the model, in parallel, under a key-locking scheme:
//! each scheduled merge locks the union of the proposal's keys and its
//! conflicting entries' keys, and two merges may run concurrently only if
//! their lock sets are disjoint. Completions are multiplexed over a
//! channel; each one unlocks its keys and re-runs scheduling.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;

use super::actions::{self, MergeAction};
use super::{Glossary, NewEntry};
use crate::ai::Completion;
use crate::extract::extract_json;
use crate::prompts;
use crate::queue::RequestQueue;

struct InFlightMerge {
    proposal: NewEntry,
    conflict_ids: HashSet<u32>,
    lock_keys: HashSet<String>,
}

struct ResolverState {
    glossary: Glossary,
    pending: Vec<NewEntry>,
    used_keys: HashSet<String>,
    in_flight: HashMap<u64, InFlightMerge>,
    next_id: u32,
    next_merge_seq: u64,
}

/// One completion message from the queue's settle callback. `response` is
/// `None` when the call exhausted its retries.
struct MergeCompleted {
    seq: u64,
    response: Option<String>,
}

/// Merges `proposals` into `existing` and returns the updated glossary.
///
/// The result never holds the same key in two entries (among entries the
/// merge touched) and ids stay unique: new entries take sequential ids
/// above the existing maximum. Failed or invalid model responses drop the
/// proposal and leave the glossary untouched.
pub async fn resolve_conflicts<C: Completion>(
    queue: &RequestQueue<C>,
    existing: Glossary,
    proposals: Vec<NewEntry>,
) -> Glossary {
    let next_id = existing.max_id() + 1;
    let mut st = ResolverState {
        glossary: existing,
        pending: proposals,
        used_keys: HashSet::new(),
        in_flight: HashMap::new(),
        next_id,
        next_merge_seq: 1,
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<MergeCompleted>();

    loop {
        schedule_available(&mut st, queue, &tx);
        if st.in_flight.is_empty() {
            debug_assert!(st.pending.is_empty());
            break;
        }

        let Some(completed) = rx.recv().await else {
            break;
        };
        apply_completed(&mut st, completed);
    }

    st.glossary
}

/// Greedy in-order scheduling pass: apply conflict-free proposals
/// immediately and dispatch every proposal whose lock set is disjoint
/// from the keys currently in use. Proposals that cannot run yet stay
/// pending in their original order.
fn schedule_available<C: Completion>(
    st: &mut ResolverState,
    queue: &RequestQueue<C>,
    tx: &mpsc::UnboundedSender<MergeCompleted>,
) {
    let mut i = 0;
    while i < st.pending.len() {
        let candidate = &st.pending[i];

        let conflicts = st.glossary.conflicts_with(&candidate.keys);
        if conflicts.is_empty() {
            let proposal = st.pending.remove(i);
            let mut next_id = st.next_id;
            actions::append_entry(&mut st.glossary, &proposal, &mut next_id);
            st.next_id = next_id;
            continue;
        }

        let mut lock_keys: HashSet<String> = candidate.keys.iter().cloned().collect();
        for conflict in &conflicts {
            lock_keys.extend(conflict.keys.iter().cloned());
        }
        if lock_keys.iter().any(|k| st.used_keys.contains(k)) {
            i += 1;
            continue;
        }

        let conflict_ids: HashSet<u32> = conflicts.iter().map(|c| c.id).collect();
        let conflict_entries: Vec<_> = conflicts.into_iter().cloned().collect();
        let proposal = st.pending.remove(i);
        let prompt = prompts::conflict_prompt(&conflict_entries, &proposal);

        st.used_keys.extend(lock_keys.iter().cloned());
        let seq = st.next_merge_seq;
        st.next_merge_seq += 1;
        st.in_flight.insert(
            seq,
            InFlightMerge {
                proposal,
                conflict_ids,
                lock_keys,
            },
        );

        let tx = tx.clone();
        queue.enqueue_detached(prompt, move |outcome| {
            let response = outcome.result.as_ref().ok().cloned();
            let _ = tx.send(MergeCompleted { seq, response });
        });
    }
}

/// Applies one finished merge: parse, validate against the conflict set
/// captured at scheduling time, execute, then unlock the keys. Any failure
/// along the way is a logged no-op for this proposal.
fn apply_completed(st: &mut ResolverState, completed: MergeCompleted) {
    let Some(merge) = st.in_flight.remove(&completed.seq) else {
        log::warn!("Completion for unknown merge {}", completed.seq);
        return;
    };

    match completed.response {
        Some(response) => {
            let parsed = extract_json(&response);
            match parse_and_validate(&parsed, &merge.conflict_ids) {
                Ok(merge_actions) => {
                    let mut next_id = st.next_id;
                    actions::apply_actions(
                        &mut st.glossary,
                        &merge_actions,
                        &merge.proposal,
                        &mut next_id,
                    );
                    st.next_id = next_id;
                }
                Err(e) => log::error!("Rejecting merge action batch: {}", e),
            }
        }
        None => log::warn!("Glossary merge call failed; dropping proposal"),
    }

    for key in &merge.lock_keys {
        st.used_keys.remove(key);
    }
}

fn parse_and_validate(
    parsed: &serde_json::Value,
    conflict_ids: &HashSet<u32>,
) -> Result<Vec<MergeAction>, super::actions::ActionError> {
    let merge_actions = actions::parse_actions(parsed)?;
    actions::validate_actions(&merge_actions, conflict_ids)?;
    Ok(merge_actions)
}
