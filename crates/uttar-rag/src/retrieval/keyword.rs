//! In-process BM25 scoring over a tenant's chunk set.
//!
//! The index is built per request from the chunks visible to the caller and
//! thrown away afterwards; corpora here are per-user document sets, not web
//! scale, so a scan-and-score pass beats maintaining a persistent inverted
//! index.

use std::collections::HashMap;

use crate::types::DocumentChunk;

pub const DEFAULT_K1: f32 = 1.2;
pub const DEFAULT_B: f32 = 0.75;

pub struct Bm25Index {
    k1: f32,
    b: f32,
    avg_doc_length: f32,
    term_frequencies: Vec<HashMap<String, u32>>,
    doc_lengths: Vec<u32>,
    doc_frequencies: HashMap<String, u32>,
    chunks: Vec<DocumentChunk>,
}

impl Bm25Index {
    pub fn build(chunks: Vec<DocumentChunk>, k1: f32, b: f32) -> Self {
        let mut term_frequencies = Vec::with_capacity(chunks.len());
        let mut doc_lengths = Vec::with_capacity(chunks.len());
        let mut doc_frequencies: HashMap<String, u32> = HashMap::new();

        for chunk in &chunks {
            let tokens = tokenize(&chunk.content);
            doc_lengths.push(tokens.len() as u32);

            let mut frequencies: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *frequencies.entry(token).or_insert(0) += 1;
            }
            for term in frequencies.keys() {
                *doc_frequencies.entry(term.clone()).or_insert(0) += 1;
            }
            term_frequencies.push(frequencies);
        }

        let total: u32 = doc_lengths.iter().sum();
        let avg_doc_length = if doc_lengths.is_empty() {
            0.0
        } else {
            total as f32 / doc_lengths.len() as f32
        };

        Self {
            k1: k1.max(0.0),
            b: b.clamp(0.0, 1.0),
            avg_doc_length,
            term_frequencies,
            doc_lengths,
            doc_frequencies,
            chunks,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk(&self, index: usize) -> &DocumentChunk {
        &self.chunks[index]
    }

    fn idf(&self, term: &str) -> f32 {
        let doc_count = self.chunks.len() as f32;
        let df = self.doc_frequencies.get(term).copied().unwrap_or(0) as f32;
        ((doc_count - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    fn score_document(&self, index: usize, query_terms: &[String]) -> f32 {
        let frequencies = &self.term_frequencies[index];
        let doc_length = self.doc_lengths[index] as f32;
        let length_norm = if self.avg_doc_length > 0.0 {
            1.0 - self.b + self.b * doc_length / self.avg_doc_length
        } else {
            1.0
        };

        let mut score = 0.0;
        for term in query_terms {
            let tf = frequencies.get(term).copied().unwrap_or(0) as f32;
            if tf == 0.0 {
                continue;
            }
            score += self.idf(term) * (tf * (self.k1 + 1.0)) / (tf + self.k1 * length_norm);
        }
        score
    }

    /// Top `top_k` chunk indices with positive BM25 scores, best first.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(usize, f32)> {
        if self.chunks.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = (0..self.chunks.len())
            .filter_map(|index| {
                let score = self.score_document(index, &query_terms);
                (score > 0.0).then_some((index, score))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() > 1)
        .map(|token| token.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, content: &str) -> DocumentChunk {
        DocumentChunk {
            id: id.to_string(),
            document_id: format!("doc-{}", id),
            chunk_index: 0,
            content: content.to_string(),
            start_char: 0,
            end_char: content.len(),
            token_count: content.split_whitespace().count(),
            embedding_id: None,
        }
    }

    #[test]
    fn test_matching_terms_rank_first() {
        let index = Bm25Index::build(
            vec![
                chunk("a", "the billing service charges subscriptions monthly"),
                chunk("b", "vector embeddings power semantic retrieval"),
                chunk("c", "retrieval quality depends on embeddings and ranking"),
            ],
            DEFAULT_K1,
            DEFAULT_B,
        );

        let results = index.search("semantic embeddings retrieval", 3);
        assert!(!results.is_empty());
        assert_eq!(index.chunk(results[0].0).id, "b");
        // The billing chunk shares no query terms and must not appear.
        assert!(results.iter().all(|(idx, _)| index.chunk(*idx).id != "a"));
    }

    #[test]
    fn test_rare_terms_outweigh_common_ones() {
        let index = Bm25Index::build(
            vec![
                chunk("a", "system overview and system design and system goals"),
                chunk("b", "system deployment checklist"),
                chunk("c", "kubernetes deployment guide"),
            ],
            DEFAULT_K1,
            DEFAULT_B,
        );

        // "kubernetes" appears in a single chunk and should dominate the
        // ubiquitous "system".
        let results = index.search("system kubernetes", 3);
        assert_eq!(index.chunk(results[0].0).id, "c");
    }

    #[test]
    fn test_empty_index_and_empty_query() {
        let index = Bm25Index::build(Vec::new(), DEFAULT_K1, DEFAULT_B);
        assert!(index.is_empty());
        assert!(index.search("anything", 5).is_empty());

        let index = Bm25Index::build(vec![chunk("a", "some content here")], DEFAULT_K1, DEFAULT_B);
        assert!(index.search("", 5).is_empty());
        assert!(index.search("?!", 5).is_empty());
    }

    #[test]
    fn test_top_k_truncation() {
        let chunks: Vec<DocumentChunk> = (0..10)
            .map(|i| chunk(&i.to_string(), "shared retrieval language content"))
            .collect();
        let index = Bm25Index::build(chunks, DEFAULT_K1, DEFAULT_B);
        assert_eq!(index.search("retrieval", 4).len(), 4);
    }
}
