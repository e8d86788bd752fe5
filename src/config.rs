/// Configuration for a translation session.
///
/// The original design kept rate limits and chunk sizes in module-level
/// globals; everything here travels in an explicit value handed to the
/// constructors instead.
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Maximum number of completion calls in flight at once.
    pub max_concurrency: usize,
    /// Calls admitted per one-second window. The window refills wholesale
    /// on a fixed timer, so a burst right after refill is expected.
    pub max_calls_per_sec: u32,
    /// Total attempts per task, counting every failure kind.
    pub max_retries: u32,
    /// Base delay for the exponential backoff: `base * 2^(attempt-1)`.
    pub base_retry_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            max_calls_per_sec: 10,
            max_retries: 3,
            base_retry_delay_ms: 1000,
        }
    }
}

impl QueueConfig {
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOptions {
    /// Radius in paragraphs for clustering nearby boundary proposals.
    pub fuzz_radius: usize,
    /// Fixed chunk size used when no usable proposals survive.
    pub fallback_chunk_size: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            fuzz_radius: 2,
            fallback_chunk_size: 60,
        }
    }
}

/// How to render honorifics in the translated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HonorificsMode {
    Preserve,
    Drop,
}

/// Name ordering for translated Japanese names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameOrder {
    Japanese,
    English,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeVoice {
    Auto,
    FirstPerson,
    ThirdPerson,
}

/// Which translation strategy drives the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationMethod {
    /// One request per paragraph.
    Single,
    /// LLM-proposed segmentation merged into contiguous chunks.
    Chunk,
    /// The whole page in one request.
    Entire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub merge: MergeOptions,
    pub method: TranslationMethod,
    pub honorifics: HonorificsMode,
    pub name_order: NameOrder,
    pub narrative: NarrativeVoice,
    /// Preceding lines included as context with each translation request.
    pub context_lines: usize,
    /// Character budget per stage-1 glossary generation chunk.
    pub glossary_chunk_chars: usize,
    /// Character budget per segmentation batch.
    pub batch_char_limit: usize,
    /// Paragraphs repeated from the end of the previous segmentation batch.
    pub overlap_paragraphs: usize,
    /// Free-form instructions appended to the translation prompt.
    #[serde(default)]
    pub custom_instructions: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            merge: MergeOptions::default(),
            method: TranslationMethod::Chunk,
            honorifics: HonorificsMode::Preserve,
            name_order: NameOrder::Japanese,
            narrative: NarrativeVoice::Auto,
            context_lines: 5,
            glossary_chunk_chars: 4000,
            batch_char_limit: 1500,
            overlap_paragraphs: 5,
            custom_instructions: None,
        }
    }
}

impl SessionConfig {
    /// Load from a JSON string (for UI integration).
    pub fn from_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("Failed to parse session config: {}", e))
    }

    /// Convert to a JSON string (for UI integration).
    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize session config: {}", e))
    }
}
