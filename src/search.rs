use rayon::prelude::*;
use serde::Serialize;

use crate::{index::AssembledIndex, tfidf::SparseVector};

/// A query projected into an index's vector space.
#[derive(Debug, Clone)]
pub enum QueryVector {
    Dense(Vec<f32>),
    Sparse(SparseVector),
}

/// One ranked retrieval hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub rank: usize,
    pub score: f32,
    pub id: u64,
    pub text: String,
    pub source: String,
    pub title: String,
    pub category: String,
}

/// Cosine similarity of two vectors. Zero when either vector is zero or
/// the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Whether a chunk category passes an optional filter.
///
/// The filter matches as a case-insensitive substring. An empty or
/// whitespace-only filter matches everything.
pub fn category_matches(category: &str, filter: Option<&str>) -> bool {
    match filter.map(str::trim) {
        None | Some("") => true,
        Some(f) => category.to_lowercase().contains(&f.to_lowercase()),
    }
}

/// Score every indexed chunk against `query`, in index order.
///
/// A query from the other variant's space scores nothing.
pub fn score_all(index: &AssembledIndex, query: &QueryVector) -> Vec<f32> {
    match (index, query) {
        (AssembledIndex::Dense { vectors, .. }, QueryVector::Dense(q)) => {
            (0..vectors.rows())
                .into_par_iter()
                .map(|i| cosine_similarity(q, vectors.row(i)))
                .collect()
        }
        (AssembledIndex::Sparse { rows, .. }, QueryVector::Sparse(q)) => {
            rows.par_iter().map(|row| q.dot(row)).collect()
        }
        _ => Vec::new(),
    }
}

/// Rank chunks by score and return at most `k` that pass `category`.
///
/// Ties keep index order. NaN scores sort last.
pub fn top_k(
    index: &AssembledIndex,
    scores: &[f32],
    k: usize,
    category: Option<&str>,
) -> Vec<RetrievedChunk> {
    let chunks = index.chunks();
    let mut order: Vec<usize> = (0..scores.len().min(chunks.len())).collect();
    order.sort_by(|&a, &b| descending(scores[a], scores[b]));

    order
        .into_iter()
        .filter(|&i| category_matches(&chunks[i].category, category))
        .take(k)
        .enumerate()
        .map(|(rank, i)| {
            let chunk = &chunks[i];
            RetrievedChunk {
                rank: rank + 1,
                score: scores[i],
                id: chunk.id,
                text: chunk.text.clone(),
                source: chunk.source.clone(),
                title: chunk.title.clone(),
                category: chunk.category.clone(),
            }
        })
        .collect()
}

fn descending(a: f32, b: f32) -> std::cmp::Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => std::cmp::Ordering::Equal,
        (true, false) => std::cmp::Ordering::Greater,
        (false, true) => std::cmp::Ordering::Less,
        (false, false) => b.total_cmp(&a),
    }
}

/// Format results for terminal output.
pub fn format_human(results: &[RetrievedChunk]) {
    if results.is_empty() {
        println!("No results.");
        return;
    }

    for r in results {
        let title = if r.title.is_empty() { &r.source } else { &r.title };
        println!("{:>3}. [{:.4}] {}", r.rank, r.score, title);
        if !r.category.is_empty() {
            println!("     category: {}", r.category);
        }
        if !r.title.is_empty() {
            println!("     source: {}", r.source);
        }
        println!("     {}", preview(&r.text, 160));
    }
    println!("\n{} result(s)", results.len());
}

/// Format results as a JSON document.
pub fn format_json(
    results: &[RetrievedChunk],
    query: &str,
) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&serde_json::json!({
        "query": query,
        "result_count": results.len(),
        "results": results,
    }))
}

fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
