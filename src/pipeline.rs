//! Session orchestration: glossary maintenance and the three translation
//! strategies.
//!
//! A [`TranslationSession`] owns a completion client and a config; each
//! stage spins up its own [`RequestQueue`] and disposes it when the stage
//! finishes. Results land in a caller-supplied [`TranslationSink`], so the
//! pipeline never touches presentation concerns directly.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::ai::Completion;
use crate::config::{SessionConfig, TranslationMethod};
use crate::extract::{extract_json, extract_tag};
use crate::glossary::{resolver, stage1, Glossary, GlossaryError, GlossaryStore};
use crate::intervals::merge_fuzzy_intervals;
use crate::metrics::{format_readable, ProgressMetrics};
use crate::prompts::PromptBuilder;
use crate::queue::RequestQueue;
use crate::textutil::post_process;

static NEWLINE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n+").unwrap());

/// One source paragraph. Ids are opaque to the pipeline; the sink maps
/// them back to whatever the caller renders into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paragraph {
    pub id: u64,
    pub text: String,
}

impl Paragraph {
    pub fn new(id: u64, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
        }
    }
}

/// Receives translation results as they are applied. Paragraphs that were
/// absorbed into a neighbor's translation get hidden instead of set.
pub trait TranslationSink {
    fn set_paragraph(&mut self, id: u64, text: String);
    fn hide_paragraph(&mut self, id: u64);
}

pub struct TranslationSession<C: Completion> {
    id: Uuid,
    config: SessionConfig,
    client: Arc<C>,
}

impl<C: Completion> TranslationSession<C> {
    pub fn new(config: SessionConfig, client: Arc<C>) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            client,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn new_queue(&self) -> RequestQueue<C> {
        RequestQueue::new(
            Arc::clone(&self.client),
            self.config.queue,
            ProgressMetrics::new(),
        )
    }

    /// Runs the two-stage glossary flow for `scope_id` over the given
    /// paragraphs and persists the result. Returns the updated glossary so
    /// the caller can feed it straight into [`translate`](Self::translate).
    pub async fn update_glossary(
        &self,
        store: &dyn GlossaryStore,
        scope_id: &str,
        paragraphs: &[Paragraph],
    ) -> Result<Glossary, GlossaryError> {
        let existing = store.load(scope_id)?;
        let texts: Vec<String> = paragraphs
            .iter()
            .map(|p| p.text.clone())
            .filter(|t| !t.trim().is_empty())
            .collect();

        let generation = self.new_queue();
        let proposals =
            stage1::generate_proposals(&generation, &texts, self.config.glossary_chunk_chars).await;
        generation.dispose();

        log::info!(
            "Session {}: {} glossary proposals for scope {}",
            self.id,
            proposals.len(),
            scope_id
        );
        if proposals.is_empty() {
            return Ok(existing);
        }

        let merging = self.new_queue();
        let merged = resolver::resolve_conflicts(&merging, existing, proposals).await;
        merging.dispose();

        store.save(scope_id, &merged)?;
        Ok(merged)
    }

    /// Translates the paragraphs with the configured strategy, applying
    /// results to `sink`. Failed requests leave their paragraphs untouched.
    pub async fn translate<S: TranslationSink>(
        &self,
        paragraphs: &[Paragraph],
        glossary: Glossary,
        sink: &mut S,
    ) {
        let builder = PromptBuilder::new(&self.config, glossary);
        let queue = self.new_queue();
        log::info!(
            "Session {}: translating {} paragraphs via {:?}",
            self.id,
            paragraphs.len(),
            self.config.method
        );

        match self.config.method {
            TranslationMethod::Single => {
                self.translate_single(&builder, &queue, paragraphs, sink).await
            }
            TranslationMethod::Chunk => {
                self.translate_chunked(&builder, &queue, paragraphs, sink).await
            }
            TranslationMethod::Entire => {
                self.translate_entire(&builder, &queue, paragraphs, sink).await
            }
        }

        log::info!(
            "Session {}: done, {}/{} tasks ok in {}",
            self.id,
            queue.metrics().completed() - queue.metrics().errors(),
            queue.metrics().total(),
            format_readable(queue.metrics().elapsed())
        );
        queue.dispose();
    }

    /// One request per non-blank paragraph, each with its own context
    /// window of preceding lines.
    async fn translate_single<S: TranslationSink>(
        &self,
        builder: &PromptBuilder,
        queue: &RequestQueue<C>,
        paragraphs: &[Paragraph],
        sink: &mut S,
    ) {
        let mut targets = Vec::new();
        let mut prompts = Vec::new();
        for (index, paragraph) in paragraphs.iter().enumerate() {
            if paragraph.text.trim().is_empty() {
                continue;
            }
            let preceding = context_block(paragraphs, index, self.config.context_lines);
            prompts.push(builder.translation(&paragraph.text, &preceding));
            targets.push(paragraph.id);
        }

        let outcomes = queue.enqueue_all(prompts).await;
        for (id, outcome) in targets.into_iter().zip(&outcomes) {
            match &outcome.result {
                Ok(raw) => sink.set_paragraph(id, process_response(raw).join("\n")),
                Err(err) => log::error!("Paragraph {} translation failed: {}", id, err),
            }
        }
    }

    /// Model-guided segmentation: ask for chunk boundaries per batch, merge
    /// the suggestions into one contiguous partition, then translate each
    /// interval as a unit.
    async fn translate_chunked<S: TranslationSink>(
        &self,
        builder: &PromptBuilder,
        queue: &RequestQueue<C>,
        paragraphs: &[Paragraph],
        sink: &mut S,
    ) {
        let total = paragraphs.len();
        if total == 0 {
            return;
        }

        let batches = segmentation_batches(
            paragraphs,
            self.config.batch_char_limit,
            self.config.overlap_paragraphs,
        );
        let mut prompts = Vec::with_capacity(batches.len());
        let mut bounds = Vec::with_capacity(batches.len());
        for &(start, end) in &batches {
            // Later batches are renumbered to look like early ones; keep a
            // window of 20 real indices so overlap context lines up.
            let offset = if start >= 20 { start - 20 } else { 0 };
            let slice: Vec<(usize, String)> = paragraphs[start..=end]
                .iter()
                .enumerate()
                .map(|(k, p)| (start + k, p.text.clone()))
                .collect();
            prompts.push(builder.chunking(&slice, offset));
            bounds.push((offset, start + 1, end + 1));
        }

        let outcomes = queue.enqueue_all(prompts).await;
        let mut proposals = Vec::with_capacity(outcomes.len());
        for ((offset, lo, hi), outcome) in bounds.into_iter().zip(&outcomes) {
            match &outcome.result {
                Ok(raw) => proposals.push(Value::Array(validated_batch_intervals(
                    &extract_json(raw),
                    offset,
                    lo,
                    hi,
                ))),
                Err(err) => {
                    log::warn!("Segmentation batch failed, continuing without it: {}", err);
                    proposals.push(json!([]));
                }
            }
        }

        let intervals = merge_fuzzy_intervals(total, &Value::Array(proposals), self.config.merge);

        let mut prompts = Vec::with_capacity(intervals.len());
        for &(start, end) in &intervals {
            let text: Vec<&str> = paragraphs[start - 1..end]
                .iter()
                .map(|p| p.text.as_str())
                .collect();
            let preceding = context_block(paragraphs, start - 1, self.config.context_lines);
            prompts.push(builder.translation(&text.join("\n"), &preceding));
        }

        let outcomes = queue.enqueue_all(prompts).await;
        for (&(start, end), outcome) in intervals.iter().zip(&outcomes) {
            let span = &paragraphs[start - 1..end];
            match &outcome.result {
                Ok(raw) => apply_lines(span, process_response(raw), sink),
                Err(err) => log::error!(
                    "Interval {}-{} translation failed: {}",
                    start,
                    end,
                    err
                ),
            }
        }
    }

    /// The whole page in one request. The first paragraph carries the full
    /// result; the rest are hidden.
    async fn translate_entire<S: TranslationSink>(
        &self,
        builder: &PromptBuilder,
        queue: &RequestQueue<C>,
        paragraphs: &[Paragraph],
        sink: &mut S,
    ) {
        let Some(first) = paragraphs.first() else {
            return;
        };
        let text: Vec<&str> = paragraphs.iter().map(|p| p.text.as_str()).collect();
        let outcome = queue.enqueue(builder.translation(&text.join("\n"), "")).await;
        match outcome.result {
            Ok(raw) => {
                sink.set_paragraph(first.id, process_response(&raw).join("\n"));
                for paragraph in &paragraphs[1..] {
                    sink.hide_paragraph(paragraph.id);
                }
            }
            Err(err) => log::error!("Whole-page translation failed: {}", err),
        }
    }
}

/// Pulls the translated text out of a raw model response: the
/// `<translation>` tag contents, blank-line runs collapsed, each line
/// post-processed.
fn process_response(raw: &str) -> Vec<String> {
    let tagged = extract_tag(raw, "translation");
    let compressed = NEWLINE_RUNS.replace_all(&tagged, "\n");
    compressed.lines().map(post_process).collect()
}

/// Up to `lines` paragraph texts immediately before `index`, newline
/// joined with a trailing newline, or empty at the start of the page.
fn context_block(paragraphs: &[Paragraph], index: usize, lines: usize) -> String {
    let start = index.saturating_sub(lines);
    if start == index {
        return String::new();
    }
    let ctx: Vec<&str> = paragraphs[start..index]
        .iter()
        .map(|p| p.text.as_str())
        .collect();
    format!("{}\n", ctx.join("\n"))
}

/// Greedy batching by character budget for the segmentation stage.
/// Returns inclusive 0-based `(start, end)` ranges; consecutive batches
/// overlap by `overlap` paragraphs so boundary votes near the seam get
/// corroborated from both sides.
fn segmentation_batches(
    paragraphs: &[Paragraph],
    char_limit: usize,
    overlap: usize,
) -> Vec<(usize, usize)> {
    let total = paragraphs.len();
    let mut batches = Vec::new();
    let mut start = 0;
    while start < total {
        let mut chars = 0;
        let mut end = start;
        for i in start..total {
            let len = paragraphs[i].text.chars().count();
            // The first paragraph of a batch always fits.
            if i > start && chars + len > char_limit {
                break;
            }
            chars += len;
            end = i;
        }
        batches.push((start, end));
        if end + 1 >= total {
            break;
        }
        start = std::cmp::max(start + 1, (end + 1).saturating_sub(overlap));
    }
    batches
}

/// Checks one segmentation response: a JSON array of `[start, end]` number
/// pairs, mapped back to global 1-based indices via `offset`, each within
/// the batch bounds `[lo, hi]`. Any malformed member voids the whole
/// batch.
fn validated_batch_intervals(parsed: &Value, offset: usize, lo: usize, hi: usize) -> Vec<Value> {
    let Some(items) = parsed.as_array() else {
        log::warn!("Segmentation response is not an array, ignoring batch");
        return Vec::new();
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let pair = match item.as_array() {
            Some(pair) if pair.len() == 2 => pair,
            _ => {
                log::warn!("Malformed segmentation pair, ignoring batch: {}", item);
                return Vec::new();
            }
        };
        let (Some(s), Some(e)) = (pair[0].as_f64(), pair[1].as_f64()) else {
            log::warn!("Non-numeric segmentation pair, ignoring batch: {}", item);
            return Vec::new();
        };
        let s = s.trunc() as i64 + offset as i64;
        let e = e.trunc() as i64 + offset as i64;
        if s > e || s < lo as i64 || e > hi as i64 {
            log::warn!(
                "Segmentation pair [{}, {}] outside batch {}-{}, ignoring batch",
                s,
                e,
                lo,
                hi
            );
            return Vec::new();
        }
        out.push(json!([s, e]));
    }
    out
}

/// Maps translated lines onto the paragraphs of one interval. A surplus of
/// lines folds into the last paragraph; a deficit hides the leftovers.
fn apply_lines<S: TranslationSink>(span: &[Paragraph], mut lines: Vec<String>, sink: &mut S) {
    let count = span.len();
    if lines.len() > count && count > 0 {
        let tail = lines.split_off(count - 1).join("\n");
        lines.push(tail);
    }
    for (i, paragraph) in span.iter().enumerate() {
        match lines.get(i) {
            Some(line) => sink.set_paragraph(paragraph.id, line.clone()),
            None => sink.hide_paragraph(paragraph.id),
        }
    }
}
