//! Text-to-vector seam shared by storage (`search_text`) and retrieval.

use async_trait::async_trait;

use crate::error::Result;

/// Anything that can turn text into a fixed-length embedding.
#[async_trait]
pub trait EmbedText: Send + Sync {
    /// Embed one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Vector length produced by [`EmbedText::embed`].
    fn dimension(&self) -> usize;
}

/// Cosine similarity of two vectors; `0.0` on length mismatch or zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
