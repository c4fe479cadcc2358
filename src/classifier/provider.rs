//! Capability seam for the external text-classification service.

use async_trait::async_trait;

use crate::error::Result;

/// A text-classification capability.
///
/// Submit content plus a bounded system instruction and token budget, and
/// receive the provider's raw textual judgement or a call failure. Any
/// text-classification provider can satisfy this; the pipeline never depends
/// on a specific vendor or model identity.
#[async_trait]
pub trait ClassifierProvider: Send + Sync {
    /// Submit one classification request and return the raw response text.
    async fn complete(
        &self,
        system_instruction: &str,
        content: &str,
        max_tokens: u32,
    ) -> Result<String>;

    /// Provider name, for logging only.
    fn name(&self) -> &str;
}
