//! Prompt context rendering for the chat layer.

use crate::search::RetrievedChunk;

/// Default character budget for the bodies in one context block.
pub const DEFAULT_CONTEXT_CHARS: usize = 3000;

/// Longest body taken from a single result, in characters.
const MAX_BODY_CHARS: usize = 1200;

/// Render results as a `<retrieved_knowledge>` block.
///
/// Results are added in rank order until the next body would push the
/// total body length past `max_chars`. Returns an empty string when no
/// result fits.
///
/// # Examples
///
/// ```
/// use memdex::{context::format_context, search::RetrievedChunk};
///
/// let hit = RetrievedChunk {
///     rank: 1,
///     score: 0.9,
///     id: 0,
///     text: "Feed the starter twice a day.".into(),
///     source: "notes.md".into(),
///     title: "Sourdough".into(),
///     category: String::new(),
/// };
/// let block = format_context(&[hit], 3000);
/// assert_eq!(
///     block,
///     "<retrieved_knowledge>\n- Sourdough - notes.md\n\
///      Feed the starter twice a day.\n</retrieved_knowledge>\n"
/// );
/// assert_eq!(format_context(&[], 3000), "");
/// ```
pub fn format_context(results: &[RetrievedChunk], max_chars: usize) -> String {
    let mut entries = Vec::new();
    let mut used = 0;

    for r in results {
        let body = truncate(r.text.trim(), MAX_BODY_CHARS);
        let len = body.chars().count();
        if used + len > max_chars {
            break;
        }
        used += len;

        let title = if r.title.is_empty() { "Untitled" } else { &r.title };
        let heading = if r.source.is_empty() {
            format!("- {title}")
        } else {
            format!("- {title} - {}", r.source)
        };
        entries.push(format!("{heading}\n{body}"));
    }

    if entries.is_empty() {
        return String::new();
    }
    format!(
        "<retrieved_knowledge>\n{}\n</retrieved_knowledge>\n",
        entries.join("\n\n")
    )
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}
