//! Prompt assembly for every pipeline stage.
//!
//! The static parts of the translation prompt are baked once per session;
//! per-task methods only splice in the glossary metadata and context.

use crate::config::{HonorificsMode, NameOrder, NarrativeVoice, SessionConfig};
use crate::glossary::{Glossary, GlossaryEntry, NewEntry};
use crate::queue::Prompt;

const TRANSLATION_SYSTEM: &str = "\
You are a highly skilled Japanese to English literature translator. Maintain \
the original tone, prose, nuance, and character voices of the source text as \
closely as possible. Do not localize by changing the original meaning or tone.";

const TRANSLATION_RULES: &str = "\
<instructions>
### Guiding Principles
Prioritize the raw text: if the provided <metadata> contradicts the Japanese \
text, the text wins. Use the <metadata> block and the preceding lines to keep \
terminology and characterization consistent, resolve ambiguity, and infer \
omitted subjects.

### Core Directives
Dialogue lines are enclosed in Japanese quotation marks (「 」, 『 』); replace \
them with smart quotation marks (\u{201c}\u{201d}) in the translation. Use correct English \
pronouns, drawing on character information from the metadata. Text in \
parentheses may be furigana; omit it when purely phonetic. Prioritize fluent, \
natural English over literal renderings.

### Output Format
You MUST wrap your translated sentence(s) in <translation> and </translation> \
tags; the extraction step relies strictly on this format. For non-Japanese \
text, repeat it back unchanged inside the tags.
<example>
Input: `「ただいま戻りました」`
Output: <translation>\u{201c}I have returned.\u{201d}</translation>
</example>
</instructions>";

const CHUNKING_SYSTEM: &str = "\
You are an expert text analyst segmenting long-form Japanese text into \
semantically coherent chunks for a downstream translation process.

### Input
<text> contains one paragraph per line, prefixed by an authoritative index \
like: [123] [content]. <metadata> gives the inclusive Start and End indices \
for this run; they may not begin at 1.

### Output
A single JSON array of [start, end] integer pairs that exactly cover every \
index from Start to End with no gaps and no overlaps. Indices must come from \
this input's range. Output only the JSON array; no commentary, no code fences.

### Chunking Goals
Target 100-200 characters of content per chunk (hard cap 300); prefer \
boundaries at scene separators, headings, dialogue/narration switches, and \
self-contained blocks such as status panels or chat logs.";

const STAGE1_SYSTEM: &str = "\
You are generating entries for a multi-key dictionary used as the knowledge \
base of a Japanese to English translation pipeline. When a key appears in \
text being translated, the entry's value is included in the model context.

Rules:
1. Keys must be raw Japanese strings that could appear in source text \
(kanji/kana variants, nicknames). Do not add English or romaji keys.
2. Values follow: \"[category] Name: English (日本語) | Field: ... | ...\" with \
a leading category tag such as [character], [location], [term].
3. Focus on character names, locations, proper nouns, and special terms. \
Skip common nouns and terms lacking context.
4. Keep values concise and directly useful for translation.

Expected JSON structure:
{
  \"entries\": [
    { \"keys\": [\"名無しの権兵衛\", \"ななしのごんべい\"], \"value\": \"[character] Name: John Doe (名無しの権兵衛)\" }
  ]
}

Output only the JSON, without any commentary. The raw text is delimited with \
<text> XML tags.";

const CONFLICT_SYSTEM: &str = "\
You merge proposed glossary entries into an existing dictionary subset for a \
translation system. Prefer existing translations; only update when it \
improves translation quality without breaking consistency.

You will receive:
  <existing_dictionary> { \"entries\": [ { \"id\": number, \"keys\": string[], \"value\": string } ] } </existing_dictionary>
  <new_updates> { \"entries\": [ { \"keys\": string[], \"value\": string } ] } </new_updates>

Respond with ONLY one of:
  - A single JSON object: { \"action\": \"none\" }
  - OR a JSON array of action objects.
Allowed actions:
  - { \"action\": \"none\" }
  - { \"action\": \"add_entry\" }
  - { \"action\": \"delete\", \"id\": number }
  - { \"action\": \"update\", \"id\": number, \"data\": string }
  - { \"action\": \"add_key\", \"id\": number, \"data\": string[] }
  - { \"action\": \"del_key\", \"id\": number, \"data\": string[] }
Constraints:
  - Ids must be taken only from <existing_dictionary>. Never invent ids.
  - add_entry has no id or data; the caller appends the proposal itself.
  - Keys must stay raw Japanese. Keep the existing English name choice over \
new synonyms. When in doubt, choose { \"action\": \"none\" }.
  - Output must be valid JSON with no code fences, comments, or extra keys.";

/// Session-scoped prompt builder; the option-dependent instruction text is
/// assembled once at construction.
pub struct PromptBuilder {
    translation_system: String,
    glossary: Glossary,
    custom_instructions: Option<String>,
}

impl PromptBuilder {
    pub fn new(config: &SessionConfig, glossary: Glossary) -> Self {
        let narrative = match config.narrative {
            NarrativeVoice::Auto => {
                "Determine which narrative voice (first person, third person) the text is best translated as."
            }
            NarrativeVoice::FirstPerson => {
                "For non-dialogue text, default to a first-person narrative voice unless the raw text strongly indicates otherwise."
            }
            NarrativeVoice::ThirdPerson => {
                "For non-dialogue text, default to a third-person narrative voice unless the raw text strongly indicates otherwise."
            }
        };
        let honorifics = match config.honorifics {
            HonorificsMode::Preserve => {
                "Preserve honorifics present in the original text: '花子さん' -> 'Hanako-san'."
            }
            HonorificsMode::Drop => {
                "Drop common honorifics, or replace them with a suitable English equivalent: '花子さん' -> 'Hanako'."
            }
        };
        let name_order = match config.name_order {
            NameOrder::Japanese => {
                "Maintain Japanese name ordering (LastName FirstName): '山田太郎' -> 'Yamada Taro'."
            }
            NameOrder::English => {
                "Use English name ordering (FirstName LastName): '山田太郎' -> 'Taro Yamada'."
            }
        };

        let translation_system = format!(
            "{}\n\n{}\n\n### Narrative Voice\n{}\n\n### Names\n{}\n{}",
            TRANSLATION_SYSTEM, TRANSLATION_RULES, narrative, honorifics, name_order
        );

        Self {
            translation_system,
            glossary,
            custom_instructions: config.custom_instructions.clone(),
        }
    }

    pub fn glossary(&self) -> &Glossary {
        &self.glossary
    }

    /// Prompt for translating `text`, with `preceding` lines as context.
    /// Glossary metadata is matched against context and text combined.
    pub fn translation(&self, text: &str, preceding: &str) -> Prompt {
        let full_context = format!("{}{}", preceding, text);
        let metadata = self.glossary.metadata_for(&full_context);

        let preceding_block = if preceding.is_empty() {
            String::new()
        } else {
            format!(
                "\nHere are the lines immediately preceding the text to be translated, for context:\n{}",
                preceding
            )
        };

        let metadata_block = if metadata.is_empty() && preceding_block.is_empty() {
            String::new()
        } else {
            format!("<metadata>\n{}\n</metadata>\n{}", metadata, preceding_block)
        };

        let mut sections: Vec<String> = Vec::new();
        if let Some(custom) = self.custom_instructions.as_deref() {
            sections.push(format!("### Additional Notes:\n{}", custom));
        }
        if !metadata_block.is_empty() {
            sections.push(metadata_block);
        }
        sections.push(format!(
            "Translate the following Japanese text into English:\n{}",
            text
        ));

        Prompt::new(self.translation_system.clone(), sections.join("\n\n"))
    }

    /// Prompt asking for chunk boundaries over `paragraphs` (0-based global
    /// indices paired with text). Indices are presented shifted down by
    /// `offset` so later batches look like early ones to the model.
    pub fn chunking(&self, paragraphs: &[(usize, String)], offset: usize) -> Prompt {
        let text_block: Vec<String> = paragraphs
            .iter()
            .map(|(index, text)| format!("[{}] {}", index + 1 - offset, text))
            .collect();
        let start = paragraphs.first().map(|(i, _)| i + 1 - offset).unwrap_or(1);
        let end = paragraphs.last().map(|(i, _)| i + 1 - offset).unwrap_or(1);

        let user = format!(
            "<text>\n{}\n</text>\n<metadata>\nStart: {}\nEnd: {}\n</metadata>",
            text_block.join("\n"),
            start,
            end
        );
        Prompt::new(CHUNKING_SYSTEM, user)
    }
}

/// Stage-1 glossary generation prompt for one chunk of raw text.
pub fn stage1_prompt(chunk: &str) -> Prompt {
    Prompt::new(STAGE1_SYSTEM, format!("<text>\n{}\n</text>", chunk))
}

/// Conflict-merge prompt: the conflicting dictionary subset plus the single
/// proposal under consideration.
pub fn conflict_prompt(conflicts: &[GlossaryEntry], proposal: &NewEntry) -> Prompt {
    let existing = serde_json::json!({ "entries": conflicts });
    let updates = serde_json::json!({ "entries": [proposal] });
    let user = format!(
        "<existing_dictionary>\n{}\n</existing_dictionary>\n\n<new_updates>\n{}\n</new_updates>",
        serde_json::to_string_pretty(&existing).unwrap_or_default(),
        serde_json::to_string_pretty(&updates).unwrap_or_default(),
    );
    Prompt::new(CONFLICT_SYSTEM, user)
}
