pub mod ai;
pub mod config;
pub mod extract;
pub mod glossary;
pub mod intervals;
pub mod metrics;
pub mod pipeline;
pub mod prompts;
pub mod queue;
pub mod textutil;

pub use ai::{Completion, CompletionError, LlmClient, ProviderId, RetryHint};
pub use config::{
    HonorificsMode, MergeOptions, NameOrder, NarrativeVoice, QueueConfig, SessionConfig,
    TranslationMethod,
};
pub use extract::{extract_json, extract_tag};
pub use glossary::{
    FileGlossaryStore, Glossary, GlossaryEntry, GlossaryError, GlossaryStore, NewEntry,
};
pub use intervals::merge_fuzzy_intervals;
pub use metrics::ProgressMetrics;
pub use pipeline::{Paragraph, TranslationSession, TranslationSink};
pub use prompts::PromptBuilder;
pub use queue::{Prompt, QueueError, RequestQueue, TaskOutcome};
