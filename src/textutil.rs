//! Small text helpers shared by the translation pipeline.

/// Cleans up a translated line: trims whitespace and upgrades straight
/// quotes to smart quotes when the source line opened with a quote near its
/// start (dialogue lines sometimes come back with the quoting style
/// flattened).
pub fn post_process(text: &str) -> String {
    let mut result = text.trim().to_string();

    let prefixes = ["\"", "＂", "“"];
    let max_offset = 3;
    let opens_with_quote = text
        .char_indices()
        .take(max_offset + 1)
        .any(|(i, _)| prefixes.iter().any(|p| text[i..].starts_with(p)));

    if opens_with_quote {
        if result.starts_with('"') {
            result.replace_range(0..1, "“");
        }
        if let Some(idx) = result.rfind('"') {
            result.replace_range(idx..idx + 1, "”");
        }
    }

    result
}

/// Packs ordered paragraph texts into chunks of at most `max_chars`
/// characters, joining paragraphs with newlines. A single paragraph longer
/// than the budget becomes its own chunk.
pub fn chunk_by_chars<'a, I>(texts: I, max_chars: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for text in texts {
        let len = text.chars().count();
        if current_len + len > max_chars && current_len > 0 {
            chunks.push(std::mem::take(&mut current));
            current.push_str(text);
            current_len = len;
        } else {
            if !current.is_empty() {
                current.push('\n');
                current_len += 1;
            }
            current.push_str(text);
            current_len += len;
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
