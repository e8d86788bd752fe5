//! End-to-end tests for the translation pipeline:
//! 1. Glossary generation and conflict merging against a file store
//! 2. Model-guided segmentation and chunked translation into a sink
//! 3. The single-paragraph and whole-page strategies
//!
//! The completion client is scripted: it recognizes each stage by its
//! system prompt and answers the way a well-behaved model would.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use novel_translator_core::glossary::{FileGlossaryStore, Glossary, GlossaryEntry, GlossaryStore};
use novel_translator_core::pipeline::{Paragraph, TranslationSession, TranslationSink};
use novel_translator_core::{Completion, CompletionError, SessionConfig, TranslationMethod};

/// Plays the model for every pipeline stage. Translation responses map
/// each input line to `[EN] {line}` so assertions stay mechanical.
struct ScriptedModel {
    glossary_json: String,
    merge_json: String,
    segmentation_json: String,
    translation_calls: AtomicU32,
}

impl ScriptedModel {
    fn new(glossary_json: &str, merge_json: &str, segmentation_json: &str) -> Arc<Self> {
        Arc::new(Self {
            glossary_json: glossary_json.to_string(),
            merge_json: merge_json.to_string(),
            segmentation_json: segmentation_json.to_string(),
            translation_calls: AtomicU32::new(0),
        })
    }

    fn respond(&self, system: &str, user: &str) -> String {
        if system.contains("multi-key dictionary") {
            return self.glossary_json.clone();
        }
        if system.contains("existing dictionary subset") {
            return self.merge_json.clone();
        }
        if system.contains("semantically coherent chunks") {
            return self.segmentation_json.clone();
        }

        self.translation_calls.fetch_add(1, Ordering::SeqCst);
        let source = user
            .rsplit("Translate the following Japanese text into English:\n")
            .next()
            .unwrap_or(user);
        let lines: Vec<String> = source.lines().map(|l| format!("[EN] {}", l)).collect();
        format!("<translation>\n{}\n</translation>", lines.join("\n"))
    }
}

impl Completion for ScriptedModel {
    fn complete(
        &self,
        system: &str,
        user: &str,
    ) -> impl std::future::Future<Output = Result<String, CompletionError>> + Send {
        let response = self.respond(system, user);
        async move { Ok(response) }
    }
}

#[derive(Default)]
struct RecordingSink {
    set: Vec<(u64, String)>,
    hidden: Vec<u64>,
}

impl TranslationSink for RecordingSink {
    fn set_paragraph(&mut self, id: u64, text: String) {
        self.set.push((id, text));
    }

    fn hide_paragraph(&mut self, id: u64) {
        self.hidden.push(id);
    }
}

fn page() -> Vec<Paragraph> {
    vec![
        Paragraph::new(1, "花子は京都に向かった。"),
        Paragraph::new(2, "「ただいま戻りました」"),
        Paragraph::new(3, ""),
        Paragraph::new(4, "空は青く、風は涼しかった。"),
        Paragraph::new(5, "彼女は深呼吸をした。"),
        Paragraph::new(6, "旅はまだ始まったばかりだ。"),
    ]
}

fn config(method: TranslationMethod) -> SessionConfig {
    SessionConfig {
        method,
        ..SessionConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn glossary_flow_generates_merges_and_persists() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = FileGlossaryStore::new(dir.path());

    // Seed the store with an entry the proposals will collide with.
    store.save(
        "ncode-n1234ab",
        &Glossary {
            entries: vec![GlossaryEntry {
                id: 3,
                keys: vec!["花子".to_string()],
                value: "[character] Name: Hanako (花子)".to_string(),
            }],
        },
    )?;

    let model = ScriptedModel::new(
        r#"{"entries": [
            {"keys": ["花子"], "value": "[character] Name: Hanako (花子) | A traveler"},
            {"keys": ["京都"], "value": "[location] Name: Kyoto (京都)"}
        ]}"#,
        r#"[{"action": "update", "id": 3, "data": "[character] Name: Hanako (花子) | A traveler"}]"#,
        "[]",
    );
    let session = TranslationSession::new(config(TranslationMethod::Chunk), Arc::clone(&model));

    let merged = session
        .update_glossary(&store, "ncode-n1234ab", &page())
        .await?;

    // 花子 collided and was merged by the model; 京都 was conflict-free and
    // appended with the next sequential id.
    assert_eq!(merged.entries.len(), 2);
    assert!(merged.entry(3).unwrap().value.contains("A traveler"));
    assert_eq!(merged.entry(4).unwrap().keys, vec!["京都"]);

    let reloaded = store.load("ncode-n1234ab")?;
    assert_eq!(reloaded, merged);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn chunked_translation_covers_every_paragraph() {
    // One segmentation batch; the model splits the page into two chunks.
    let model = ScriptedModel::new("{}", "{}", "[[1, 3], [4, 6]]");
    let session = TranslationSession::new(config(TranslationMethod::Chunk), Arc::clone(&model));

    let mut sink = RecordingSink::default();
    session
        .translate(&page(), Glossary::default(), &mut sink)
        .await;

    // Two intervals, one translation request each.
    assert_eq!(model.translation_calls.load(Ordering::SeqCst), 2);

    let texts: std::collections::HashMap<u64, String> = sink.set.into_iter().collect();
    assert_eq!(texts[&1], "[EN] 花子は京都に向かった。");
    assert_eq!(texts[&2], "[EN] 「ただいま戻りました」");
    assert_eq!(texts[&4], "[EN] 空は青く、風は涼しかった。");
    assert_eq!(texts[&6], "[EN] 旅はまだ始まったばかりだ。");
    // The blank paragraph produced no line of its own; the interval had
    // one line fewer than paragraphs, so the tail paragraph was hidden.
    assert_eq!(sink.hidden, vec![3]);
}

#[tokio::test(start_paused = true)]
async fn garbage_segmentation_falls_back_to_fixed_chunks() {
    let model = ScriptedModel::new("{}", "{}", "the model rambled instead of emitting JSON");
    let session = TranslationSession::new(config(TranslationMethod::Chunk), Arc::clone(&model));

    let mut sink = RecordingSink::default();
    session
        .translate(&page(), Glossary::default(), &mut sink)
        .await;

    // Every paragraph still got translated or hidden.
    let touched: std::collections::HashSet<u64> = sink
        .set
        .iter()
        .map(|(id, _)| *id)
        .chain(sink.hidden.iter().copied())
        .collect();
    assert_eq!(touched.len(), 6);
}

#[tokio::test(start_paused = true)]
async fn single_method_translates_each_paragraph_separately() {
    let model = ScriptedModel::new("{}", "{}", "[]");
    let session = TranslationSession::new(config(TranslationMethod::Single), Arc::clone(&model));

    let mut sink = RecordingSink::default();
    session
        .translate(&page(), Glossary::default(), &mut sink)
        .await;

    // The blank paragraph is skipped outright; nothing is hidden.
    assert_eq!(model.translation_calls.load(Ordering::SeqCst), 5);
    assert_eq!(sink.set.len(), 5);
    assert!(sink.hidden.is_empty());
    assert!(sink.set.iter().all(|(id, _)| *id != 3));
    assert_eq!(sink.set[0], (1, "[EN] 花子は京都に向かった。".to_string()));
}

#[tokio::test(start_paused = true)]
async fn entire_method_collapses_the_page() {
    let model = ScriptedModel::new("{}", "{}", "[]");
    let session = TranslationSession::new(config(TranslationMethod::Entire), Arc::clone(&model));

    let mut sink = RecordingSink::default();
    session
        .translate(&page(), Glossary::default(), &mut sink)
        .await;

    assert_eq!(model.translation_calls.load(Ordering::SeqCst), 1);
    assert_eq!(sink.set.len(), 1);
    assert_eq!(sink.set[0].0, 1);
    assert!(sink.set[0].1.contains("[EN] 旅はまだ始まったばかりだ。"));
    assert_eq!(sink.hidden, vec![2, 3, 4, 5, 6]);
}
