//! Record normalization: heterogeneous JSON records to [`Document`]s.
//!
//! Corpus lines follow no fixed schema. Chat exports, scraped articles and
//! calendar summaries all land in the same file, so text is found by
//! walking the JSON tree and collecting string values stored under a
//! configured list of field names. The walk is bounded in depth.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field names whose string values are treated as document text.
pub const DEFAULT_TEXT_FIELDS: &[&str] = &[
    "text",
    "content",
    "message",
    "body",
    "description",
    "title",
    "question",
    "answer",
];

/// Minimum trimmed length of a single collected field.
pub const DEFAULT_MIN_FIELD_CHARS: usize = 20;

/// A record's text must be longer than this to become a document.
pub const DEFAULT_MIN_DOCUMENT_CHARS: usize = 50;

/// Maximum nesting depth visited while collecting text.
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Category assigned when rules are configured but none match.
pub const FALLBACK_CATEGORY: &str = "General";

/// Longest message kept from a chat export, in characters.
const MAX_MESSAGE_CHARS: usize = 2000;

const TITLE_FIELDS: &[&str] = &["title", "name"];
const SOURCE_FIELDS: &[&str] = &["source", "url"];
const CATEGORY_FIELDS: &[&str] = &["project", "folder", "category"];

/// Assigns `category` to records mentioning any of `keywords`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub category: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizerConfig {
    /// Recognized text-bearing field names, matched case-insensitively.
    pub text_fields: Vec<String>,
    pub min_field_chars: usize,
    pub min_document_chars: usize,
    pub max_depth: usize,
    /// Ordered rules for records that carry no category of their own.
    pub category_rules: Vec<CategoryRule>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            text_fields: DEFAULT_TEXT_FIELDS
                .iter()
                .map(|f| f.to_string())
                .collect(),
            min_field_chars: DEFAULT_MIN_FIELD_CHARS,
            min_document_chars: DEFAULT_MIN_DOCUMENT_CHARS,
            max_depth: DEFAULT_MAX_DEPTH,
            category_rules: Vec::new(),
        }
    }
}

impl NormalizerConfig {
    fn is_text_field(&self, key: &str) -> bool {
        self.text_fields.iter().any(|f| f.eq_ignore_ascii_case(key))
    }
}

/// A normalized, text-bearing unit extracted from one corpus line.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub text: String,
    pub title: String,
    pub source: String,
    pub category: String,
    /// The parsed record, kept for auditing.
    pub raw: Value,
}

/// Parse one corpus line and normalize it.
///
/// Returns `Ok(None)` for well-formed records without enough text, and the
/// decode error for malformed JSON so the caller can log and skip it.
pub fn parse_line(
    line: &str,
    config: &NormalizerConfig,
) -> Result<Option<Document>, serde_json::Error> {
    let value: Value = serde_json::from_str(line)?;
    Ok(normalize_record(value, config))
}

/// Map a parsed record onto a [`Document`].
///
/// Chat exports (records with a `mapping` of message nodes) are rendered as
/// a chronological transcript; everything else goes through
/// [`extract_text`].
///
/// # Examples
///
/// ```
/// use memdex::normalizer::{normalize_record, NormalizerConfig};
/// use serde_json::json;
///
/// let config = NormalizerConfig::default();
///
/// let short = json!({"content": "short"});
/// assert!(normalize_record(short, &config).is_none());
///
/// let record = json!({
///     "title": "Sourdough notes",
///     "content": "Feed the starter twice a day and keep it somewhere warm.",
///     "project": "Kitchen",
/// });
/// let doc = normalize_record(record, &config).unwrap();
/// assert_eq!(doc.category, "Kitchen");
/// assert!(doc.text.contains("Feed the starter"));
/// ```
pub fn normalize_record(
    value: Value,
    config: &NormalizerConfig,
) -> Option<Document> {
    let conversation = value
        .get("mapping")
        .and_then(Value::as_object)
        .map(extract_conversation)
        .filter(|text| !text.trim().is_empty());

    let text = match conversation {
        Some(text) => text,
        None => extract_text(&value, config),
    };
    let text = text.trim().to_string();
    if text.chars().count() <= config.min_document_chars {
        return None;
    }

    let title = first_string(&value, TITLE_FIELDS);
    let source = first_string(&value, SOURCE_FIELDS);
    let mut category = first_string(&value, CATEGORY_FIELDS);
    if category.is_empty() {
        category = classify_category(&title, &text, &config.category_rules)
            .unwrap_or_default();
    }

    Some(Document {
        text,
        title,
        source,
        category,
        raw: value,
    })
}

/// Collect text from every recognized field at any depth.
///
/// Matches are kept in document order and joined with single spaces. A
/// match below the top level is prefixed with its dotted path, e.g.
/// `[messages.[0].content] `. Strings shorter than the field floor are
/// ignored; the result is empty when nothing qualifies.
///
/// # Examples
///
/// ```
/// use memdex::normalizer::{extract_text, NormalizerConfig};
/// use serde_json::json;
///
/// let record = json!({
///     "text": "A top level passage long enough to count.",
///     "meta": {"body": "A nested body that is long enough too."},
/// });
/// let text = extract_text(&record, &NormalizerConfig::default());
/// assert_eq!(
///     text,
///     "A top level passage long enough to count. \
///      [meta.body] A nested body that is long enough too."
/// );
/// ```
pub fn extract_text(value: &Value, config: &NormalizerConfig) -> String {
    let mut found = Vec::new();
    collect_text(value, "", 0, config, &mut found);
    found.join(" ")
}

fn collect_text(
    value: &Value,
    prefix: &str,
    depth: usize,
    config: &NormalizerConfig,
    found: &mut Vec<String>,
) {
    if depth > config.max_depth {
        return;
    }

    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if config.is_text_field(key)
                    && let Some(s) = child.as_str()
                {
                    if let Some(text) = qualifying(s, config) {
                        if prefix.is_empty() {
                            found.push(text.to_string());
                        } else {
                            found.push(format!("[{prefix}{key}] {text}"));
                        }
                    }
                } else if child.is_object() || child.is_array() {
                    let nested = format!("{prefix}{key}.");
                    collect_text(child, &nested, depth + 1, config, found);
                }
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                if item.is_object() || item.is_array() {
                    let nested = format!("{prefix}[{i}].");
                    collect_text(item, &nested, depth + 1, config, found);
                } else if let Some(text) =
                    item.as_str().and_then(|s| qualifying(s, config))
                {
                    found.push(text.to_string());
                }
            }
        }
        _ => {}
    }
}

fn qualifying<'a>(s: &'a str, config: &NormalizerConfig) -> Option<&'a str> {
    let trimmed = s.trim();
    (trimmed.chars().count() >= config.min_field_chars).then_some(trimmed)
}

/// Render a chat export's message nodes as a transcript.
///
/// Nodes are ordered by `create_time` (missing times sort first) and each
/// message becomes a `Role: text` paragraph.
pub fn extract_conversation(mapping: &Map<String, Value>) -> String {
    let mut messages: Vec<(f64, &Value)> = mapping
        .values()
        .filter_map(|node| node.get("message"))
        .filter(|message| message.is_object())
        .map(|message| {
            let time = message
                .get("create_time")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            (time, message)
        })
        .collect();
    messages.sort_by(|a, b| a.0.total_cmp(&b.0));

    messages
        .into_iter()
        .filter_map(|(_, message)| {
            let text = message_text(message.get("content")?)?;
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            let role = message
                .pointer("/author/role")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            Some(format!("{}: {}", title_case(role), truncate(text)))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn message_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => {
            if let Some(parts) = obj.get("parts").and_then(Value::as_array)
                && !parts.is_empty()
            {
                let joined: Vec<&str> = parts
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|p| !p.is_empty())
                    .collect();
                Some(joined.join(" "))
            } else {
                obj.get("text").and_then(Value::as_str).map(str::to_string)
            }
        }
        _ => None,
    }
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

fn first_string(value: &Value, fields: &[&str]) -> String {
    fields
        .iter()
        .filter_map(|f| value.get(*f).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Pick a category from keyword rules.
///
/// Returns `None` when no rules are configured, the first category whose
/// keyword occurs in the title or text otherwise, and
/// [`FALLBACK_CATEGORY`] when nothing matches.
pub fn classify_category(
    title: &str,
    text: &str,
    rules: &[CategoryRule],
) -> Option<String> {
    if rules.is_empty() {
        return None;
    }

    let title = title.to_lowercase();
    let text = text.to_lowercase();
    let matched = rules.iter().find(|rule| {
        rule.keywords.iter().any(|k| {
            let k = k.to_lowercase();
            !k.is_empty() && (title.contains(&k) || text.contains(&k))
        })
    });

    Some(
        matched
            .map(|rule| rule.category.clone())
            .unwrap_or_else(|| FALLBACK_CATEGORY.to_string()),
    )
}
