//! Embedding contract

use async_trait::async_trait;

use crate::error::Result;

/// Any function mapping text to a fixed-width vector whose cosine similarity
/// tracks semantic relatedness. Identical input must give identical output.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimensions(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}
