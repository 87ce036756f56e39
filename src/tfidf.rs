//! Statistical index variant: TF-IDF vectors over word n-grams.
//!
//! The vectorizer is fitted on the whole chunk set at once. Text is
//! tokenized with a tantivy analyzer (split on non-alphanumerics,
//! lowercase), tokens shorter than two characters are dropped, and n-grams
//! up to `ngram_max` are formed from the remaining tokens. Rows are L2
//! normalized, so a dot product between two rows is their cosine.

use std::collections::HashMap;

use rayon::prelude::*;
use tantivy::tokenizer::{
    LowerCaser,
    RemoveLongFilter,
    SimpleTokenizer,
    TextAnalyzer,
    TokenStream,
};

pub const DEFAULT_MAX_FEATURES: usize = 100_000;
pub const DEFAULT_NGRAM_MAX: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TfidfParams {
    /// Vocabulary cap; the most frequent terms across the corpus are kept.
    pub max_features: usize,
    /// Longest n-gram, in tokens. `1` means unigrams only.
    pub ngram_max: usize,
}

impl Default for TfidfParams {
    fn default() -> Self {
        Self {
            max_features: DEFAULT_MAX_FEATURES,
            ngram_max: DEFAULT_NGRAM_MAX,
        }
    }
}

/// A sparse row with strictly increasing column indices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Inner product with another row.
    pub fn dot(&self, other: &SparseVector) -> f32 {
        let (mut i, mut j) = (0, 0);
        let mut sum = 0.0;
        while i < self.indices.len() && j < other.indices.len() {
            match self.indices[i].cmp(&other.indices[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    sum += self.values[i] * other.values[j];
                    i += 1;
                    j += 1;
                }
            }
        }
        sum
    }

    fn from_weights(mut weights: Vec<(u32, f32)>) -> Self {
        weights.sort_unstable_by_key(|(idx, _)| *idx);
        let norm = weights.iter().map(|(_, w)| w * w).sum::<f32>().sqrt();
        let scale = if norm > 0.0 { 1.0 / norm } else { 0.0 };
        let (indices, values) =
            weights.into_iter().map(|(i, w)| (i, w * scale)).unzip();
        Self { indices, values }
    }
}

/// Fitted vocabulary and inverse document frequencies.
#[derive(Debug, Clone)]
pub struct TfidfVectorizer {
    vocabulary: HashMap<String, u32>,
    idf: Vec<f32>,
    params: TfidfParams,
}

impl TfidfVectorizer {
    /// Fit on `texts` and return the vectorizer with one row per text.
    ///
    /// # Examples
    ///
    /// ```
    /// use memdex::tfidf::{TfidfParams, TfidfVectorizer};
    ///
    /// let texts = ["rust borrow checker", "sourdough bread recipe"];
    /// let (vectorizer, rows) =
    ///     TfidfVectorizer::fit_transform(&texts, TfidfParams::default());
    ///
    /// let query = vectorizer.transform("bread");
    /// assert!(query.dot(&rows[1]) > query.dot(&rows[0]));
    /// ```
    pub fn fit_transform(
        texts: &[&str],
        params: TfidfParams,
    ) -> (Self, Vec<SparseVector>) {
        let counts: Vec<HashMap<String, u32>> = texts
            .par_iter()
            .map_init(analyzer, |a, text| term_counts(a, text, params.ngram_max))
            .collect();

        // term -> (document frequency, corpus frequency)
        let mut stats: HashMap<&str, (u32, u64)> = HashMap::new();
        for doc in &counts {
            for (term, count) in doc {
                let entry = stats.entry(term.as_str()).or_default();
                entry.0 += 1;
                entry.1 += u64::from(*count);
            }
        }

        let mut terms: Vec<(&str, u32, u64)> =
            stats.into_iter().map(|(t, (df, cf))| (t, df, cf)).collect();
        if terms.len() > params.max_features {
            terms.sort_unstable_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(b.0)));
            terms.truncate(params.max_features);
        }
        terms.sort_unstable_by(|a, b| a.0.cmp(b.0));

        let n_docs = texts.len() as f32;
        let mut vocabulary = HashMap::with_capacity(terms.len());
        let mut idf = Vec::with_capacity(terms.len());
        for (i, (term, df, _)) in terms.iter().enumerate() {
            vocabulary.insert(term.to_string(), i as u32);
            idf.push(((1.0 + n_docs) / (1.0 + *df as f32)).ln() + 1.0);
        }

        let vectorizer = Self {
            vocabulary,
            idf,
            params,
        };
        let rows = counts
            .par_iter()
            .map(|doc| vectorizer.weigh(doc))
            .collect();
        (vectorizer, rows)
    }

    /// Project `text` into the fitted space. Unknown terms are ignored.
    pub fn transform(&self, text: &str) -> SparseVector {
        let counts = term_counts(&mut analyzer(), text, self.params.ngram_max);
        self.weigh(&counts)
    }

    pub fn vocabulary_len(&self) -> usize {
        self.vocabulary.len()
    }

    fn weigh(&self, counts: &HashMap<String, u32>) -> SparseVector {
        let weights = counts
            .iter()
            .filter_map(|(term, count)| {
                let idx = *self.vocabulary.get(term)?;
                Some((idx, *count as f32 * self.idf[idx as usize]))
            })
            .collect();
        SparseVector::from_weights(weights)
    }
}

fn analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .build()
}

fn tokenize(analyzer: &mut TextAnalyzer, text: &str) -> Vec<String> {
    let mut stream = analyzer.token_stream(text);
    let mut tokens = Vec::new();
    while stream.advance() {
        let token = &stream.token().text;
        if token.chars().count() >= 2 {
            tokens.push(token.clone());
        }
    }
    tokens
}

fn term_counts(
    analyzer: &mut TextAnalyzer,
    text: &str,
    ngram_max: usize,
) -> HashMap<String, u32> {
    let tokens = tokenize(analyzer, text);
    let mut counts = HashMap::new();
    for n in 1..=ngram_max.max(1) {
        for gram in tokens.windows(n) {
            *counts.entry(gram.join(" ")).or_insert(0) += 1;
        }
    }
    counts
}
