//! Text to vector.
//!
//! [`EmbeddingProvider`] is the seam between the store and whatever model produces
//! vectors. Providers are pure: equal normalized text gives an equal vector for a fixed
//! model. Over-budget input is an error, never silently truncated, and there is no
//! fallback vector on failure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{KairosError, Result};

pub trait EmbeddingProvider: Send + Sync {
    fn model_id(&self) -> &str;

    /// Output length of every vector this provider returns.
    fn dimension(&self) -> usize;

    fn max_tokens(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Collapses line breaks and whitespace runs into single spaces and trims the ends.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Embeds and checks the provider honored its own dimension.
pub fn embed_checked(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let started = Instant::now();
    let vector = provider.embed(text)?;
    debug!(
        model = provider.model_id(),
        dims = vector.len(),
        elapsed_us = started.elapsed().as_micros() as u64,
        "embedded"
    );
    if vector.len() != provider.dimension() {
        return Err(KairosError::Embedding(format!(
            "model '{}' returned {} components, expected {}",
            provider.model_id(),
            vector.len(),
            provider.dimension()
        )));
    }
    Ok(vector)
}

/// Runs the provider on the blocking pool, giving up after `timeout`. The computation
/// is not retried; the caller decides what to do with a `Timeout`.
pub async fn embed_with_timeout(provider: Arc<dyn EmbeddingProvider>, text: String, timeout: Duration) -> Result<Vec<f32>> {
    let task = tokio::task::spawn_blocking(move || embed_checked(provider.as_ref(), &text));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(res)) => res,
        Ok(Err(e)) => Err(KairosError::Embedding(format!("embedding task failed: {}", e))),
        Err(_) => Err(KairosError::Timeout { operation: "embed", after: timeout }),
    }
}

const BIGRAM_WEIGHT: f32 = 0.5;

/// Deterministic bag-of-words model: signed feature hashing of lowercase word unigrams
/// and bigrams, L2-normalized.
///
/// No weights to download, so it doubles as the default model for the server binary.
/// Texts that share words land close under cosine distance.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    max_tokens: usize,
    model_id: String,
    seed: u64,
}

impl HashingEmbedder {
    pub fn new(dimension: usize, max_tokens: usize) -> Self {
        Self::with_seed(dimension, max_tokens, 0x6b61_6972_6f73)
    }

    /// A different seed is a different model: vectors are not comparable across seeds.
    pub fn with_seed(dimension: usize, max_tokens: usize, seed: u64) -> Self {
        Self {
            dimension,
            max_tokens,
            model_id: format!("hashing-bow-{}d-{:x}", dimension, seed),
            seed,
        }
    }

    fn tokenize(text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect()
    }

    fn accumulate(&self, feature: &str, weight: f32, out: &mut [f32]) {
        let h = seahash::hash_seeded(feature.as_bytes(), self.seed, 1, 2, 3);
        let slot = (h % self.dimension as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        out[slot] += sign * weight;
    }
}

impl EmbeddingProvider for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = normalize_text(text);
        let tokens = Self::tokenize(&text);
        if tokens.is_empty() {
            return Err(KairosError::Embedding("input has no tokens to embed".into()));
        }
        if tokens.len() > self.max_tokens {
            return Err(KairosError::Embedding(format!(
                "input has {} tokens, model budget is {}",
                tokens.len(),
                self.max_tokens
            )));
        }

        let mut out = vec![0.0f32; self.dimension];
        for t in &tokens {
            self.accumulate(t, 1.0, &mut out);
        }
        for pair in tokens.windows(2) {
            self.accumulate(&format!("{} {}", pair[0], pair[1]), BIGRAM_WEIGHT, &mut out);
        }

        let norm = out.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            return Err(KairosError::Embedding("features cancelled to a zero vector".into()));
        }
        out.iter_mut().for_each(|x| *x /= norm);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::Metric;

    #[test]
    fn whitespace_variants_embed_identically() {
        let e = HashingEmbedder::new(64, 32);
        let a = e.embed("Question: shipping?\nAnswer: 3-5 days").unwrap();
        let b = e.embed("  Question: shipping?   Answer:\t3-5 days\r\n").unwrap();
        assert_eq!(a, b);
        assert_eq!(normalize_text("a\n\nb   c "), "a b c");
    }

    #[test]
    fn output_is_unit_length() {
        let v = HashingEmbedder::new(128, 64).embed("what are your shipping options").unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_words_are_closer() {
        let e = HashingEmbedder::new(256, 64);
        let q = e.embed("shipping options").unwrap();
        let shipping = e.embed("Q: shipping? A: 3-5 days").unwrap();
        let returns = e.embed("Q: returns? A: 30 days").unwrap();
        assert!(Metric::Cosine.distance(&q, &shipping) < Metric::Cosine.distance(&q, &returns));
    }

    #[test]
    fn over_budget_and_empty_inputs_fail() {
        let e = HashingEmbedder::new(16, 3);
        assert!(matches!(e.embed("one two three four"), Err(KairosError::Embedding(_))));
        assert!(matches!(e.embed(" \n "), Err(KairosError::Embedding(_))));
        assert!(e.embed("one two three").is_ok());
    }

    struct Slow;

    impl EmbeddingProvider for Slow {
        fn model_id(&self) -> &str {
            "slow"
        }
        fn dimension(&self) -> usize {
            2
        }
        fn max_tokens(&self) -> usize {
            8
        }
        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(vec![1.0, 0.0])
        }
    }

    #[tokio::test]
    async fn timeout_surfaces_as_timeout() {
        let err = embed_with_timeout(Arc::new(Slow), "x".into(), Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, KairosError::Timeout { operation: "embed", .. }));
    }

    #[test]
    fn checked_embedding_passes_provider_output_through() {
        let e = HashingEmbedder::new(32, 16);
        assert_eq!(embed_checked(&e, "card payments").unwrap(), e.embed("card payments").unwrap());
        assert!(embed_checked(&e, "").is_err());
    }

    #[tokio::test]
    async fn wrong_length_is_an_embedding_failure() {
        struct Short;
        impl EmbeddingProvider for Short {
            fn model_id(&self) -> &str {
                "short"
            }
            fn dimension(&self) -> usize {
                3
            }
            fn max_tokens(&self) -> usize {
                8
            }
            fn embed(&self, _text: &str) -> Result<Vec<f32>> {
                Ok(vec![1.0])
            }
        }
        let err = embed_with_timeout(Arc::new(Short), "x".into(), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, KairosError::Embedding(_)));
    }
}
