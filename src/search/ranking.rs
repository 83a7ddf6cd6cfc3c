//! Candidate ranking over stored chunk embeddings.
//!
//! Scores are plain dot products: vectors are unit length when stored, so
//! the product approximates cosine similarity.

use std::collections::HashMap;

use crate::store::Embedding;

/// Sum of element-wise products over the common prefix of `a` and `b`.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub trait Scored {
    fn score(&self) -> f32;
}

/// Bounded list kept sorted by descending score.
///
/// Equal scores keep insertion order: a newcomer lands after every item it
/// ties with. Once full, an item scoring at or below the current minimum is
/// dropped.
#[derive(Debug, Clone)]
pub struct TopK<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T: Scored> TopK<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Returns whether `item` was kept.
    pub fn push(&mut self, item: T) -> bool {
        if self.capacity == 0 {
            return false;
        }

        if self.items.len() >= self.capacity {
            match self.items.last() {
                Some(min) if item.score() <= min.score() => return false,
                _ => {}
            }
        }

        let score = item.score();
        let mut low = 0;
        let mut high = self.items.len();
        while low < high {
            let mid = (low + high) / 2;
            if self.items[mid].score() < score {
                high = mid;
            } else {
                low = mid + 1;
            }
        }

        self.items.insert(low, item);
        self.items.truncate(self.capacity);
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub note_id: String,
    pub chunk_id: String,
    pub score: f32,
}

impl Scored for Candidate {
    fn score(&self) -> f32 {
        self.score
    }
}

/// Streams embeddings against a query vector, keeping the best
/// `top_k * oversampling_factor` chunks.
pub struct Ranker<'q> {
    query: &'q [f32],
    candidates: TopK<Candidate>,
}

impl<'q> Ranker<'q> {
    pub fn new(query: &'q [f32], top_k: usize, oversampling_factor: usize) -> Self {
        Self {
            query,
            candidates: TopK::new(top_k.saturating_mul(oversampling_factor.max(1))),
        }
    }

    pub fn offer(&mut self, embedding: &Embedding) {
        let vector = &embedding.vector;
        if vector.is_empty() || self.query.is_empty() || vector.len() != self.query.len() {
            return;
        }

        let score = dot_product(self.query, vector);
        if !score.is_finite() {
            return;
        }

        self.candidates.push(Candidate {
            note_id: embedding.note_id.clone(),
            chunk_id: embedding.chunk_id.clone(),
            score,
        });
    }

    /// Best chunk per note, highest score first, at most `top_k`.
    pub fn finish(self, top_k: usize) -> Vec<Candidate> {
        best_per_note(self.candidates.into_vec(), top_k)
    }
}

/// Keep each note's highest-scoring candidate (the first one seen on ties),
/// then sort descending and truncate to `top_k`.
pub fn best_per_note(candidates: Vec<Candidate>, top_k: usize) -> Vec<Candidate> {
    let mut order: Vec<String> = Vec::new();
    let mut best: HashMap<String, Candidate> = HashMap::new();

    for candidate in candidates {
        match best.get(&candidate.note_id) {
            Some(prev) if candidate.score <= prev.score => {}
            Some(_) => {
                best.insert(candidate.note_id.clone(), candidate);
            }
            None => {
                order.push(candidate.note_id.clone());
                best.insert(candidate.note_id.clone(), candidate);
            }
        }
    }

    let mut collapsed: Vec<Candidate> = order.iter().filter_map(|id| best.remove(id)).collect();
    collapsed.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    collapsed.truncate(top_k);
    collapsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: &'static str,
        score: f32,
    }

    impl Scored for Item {
        fn score(&self) -> f32 {
            self.score
        }
    }

    fn item(id: &'static str, score: f32) -> Item {
        Item { id, score }
    }

    fn ids(top: &TopK<Item>) -> Vec<&'static str> {
        top.items().iter().map(|i| i.id).collect()
    }

    #[test]
    fn test_dot_product() {
        assert_eq!(dot_product(&[1.0, 0.0, 0.0], &[0.0, 2.0, 0.0]), 0.0);
        assert_eq!(dot_product(&[2.0, -3.0, 5.0], &[-4.0, 6.0, 1.0]), -21.0);
        assert_eq!(dot_product(&[1.0, 2.0, 3.0, 4.0, 5.0], &[5.0, 4.0, 3.0, 2.0, 1.0]), 35.0);
    }

    #[test]
    fn test_dot_product_symmetric_and_bilinear() {
        let a = [0.5, -1.5, 2.0];
        let b = [3.0, 0.25, -1.0];
        let c = [1.0, 1.0, 1.0];
        assert_eq!(dot_product(&a, &b), dot_product(&b, &a));

        let a_plus_c: Vec<f32> = a.iter().zip(c.iter()).map(|(x, y)| x + y).collect();
        assert!((dot_product(&a_plus_c, &b) - (dot_product(&a, &b) + dot_product(&c, &b))).abs() < 1e-6);

        let scaled: Vec<f32> = a.iter().map(|x| x * 3.0).collect();
        assert!((dot_product(&scaled, &b) - 3.0 * dot_product(&a, &b)).abs() < 1e-6);
    }

    #[test]
    fn test_top_k_sorted_while_filling() {
        let mut top = TopK::new(3);
        top.push(item("a", 0.4));
        top.push(item("b", 0.9));
        top.push(item("c", 0.5));
        assert_eq!(ids(&top), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_top_k_ignores_low_scores_when_full() {
        let mut top = TopK::new(3);
        for (id, score) in [("a", 0.8), ("b", 0.7), ("c", 0.6)] {
            top.push(item(id, score));
        }
        assert!(!top.push(item("d", 0.5)));
        assert!(!top.push(item("e", 0.6)));
        assert_eq!(ids(&top), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_top_k_replaces_lowest() {
        let mut top = TopK::new(3);
        for (id, score) in [("a", 0.9), ("b", 0.6), ("c", 0.4)] {
            top.push(item(id, score));
        }
        assert!(top.push(item("d", 0.7)));
        assert_eq!(ids(&top), vec!["a", "d", "b"]);
    }

    #[test]
    fn test_top_k_ties_keep_insertion_order() {
        let mut top = TopK::new(4);
        top.push(item("first", 0.5));
        top.push(item("high", 0.9));
        top.push(item("second", 0.5));
        top.push(item("third", 0.5));
        assert_eq!(ids(&top), vec!["high", "first", "second", "third"]);
    }

    #[test]
    fn test_top_k_invariants_over_sequences() {
        let scores = [0.3, 0.9, -0.2, 0.9, 0.5, 0.1, 0.7, 0.7, 1.0, -1.0, 0.0, 0.45];
        for k in 0..6 {
            let mut top = TopK::<Item>::new(k);
            for (i, score) in scores.iter().enumerate() {
                let before = top.items().to_vec();
                let full = top.len() == k;
                let min = top.items().last().map(|i| i.score);
                let kept = top.push(item("x", *score));

                if full && min.is_some_and(|m| *score <= m) {
                    assert!(!kept, "step {i}");
                    assert_eq!(top.items(), before.as_slice());
                }
                assert!(top.len() <= k);
                assert!(top.items().windows(2).all(|w| w[0].score >= w[1].score));
            }
        }
    }

    fn embedding(note: &str, chunk: &str, vector: Vec<f32>) -> Embedding {
        Embedding {
            chunk_id: chunk.to_string(),
            note_id: note.to_string(),
            model_id: "m".to_string(),
            vector,
        }
    }

    #[test]
    fn test_ranker_skips_mismatched_and_non_finite() {
        let query = [1.0, 0.0];
        let mut ranker = Ranker::new(&query, 5, 2);
        ranker.offer(&embedding("a", "a:0", vec![0.5, 0.5]));
        ranker.offer(&embedding("b", "b:0", vec![1.0, 0.0, 0.0]));
        ranker.offer(&embedding("c", "c:0", vec![]));
        ranker.offer(&embedding("d", "d:0", vec![f32::NAN, 0.0]));

        let ranked = ranker.finish(5);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].chunk_id, "a:0");
    }

    #[test]
    fn test_ranker_collapses_to_best_chunk_per_note() {
        let query = [1.0, 0.0];
        let mut ranker = Ranker::new(&query, 2, 2);
        ranker.offer(&embedding("a", "a:0", vec![0.2, 0.0]));
        ranker.offer(&embedding("a", "a:1", vec![0.9, 0.0]));
        ranker.offer(&embedding("b", "b:0", vec![0.5, 0.0]));
        ranker.offer(&embedding("c", "c:0", vec![0.4, 0.0]));

        let ranked = ranker.finish(2);
        let chunks: Vec<&str> = ranked.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(chunks, vec!["a:1", "b:0"]);
    }

    #[test]
    fn test_best_per_note_keeps_first_on_equal_scores() {
        let candidates = vec![
            Candidate {
                note_id: "n".into(),
                chunk_id: "n:first".into(),
                score: 0.5,
            },
            Candidate {
                note_id: "n".into(),
                chunk_id: "n:second".into(),
                score: 0.5,
            },
        ];
        let best = best_per_note(candidates, 10);
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].chunk_id, "n:first");
    }
}
