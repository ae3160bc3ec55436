use async_trait::async_trait;

use crate::error::Result;

/// Narrow seam around the external generative model. Exactly one call is made
/// per decision; any failure (transport, non-2xx, empty reply) surfaces as an
/// error and triggers the rule fallback upstream. No retries, no timeout here:
/// a caller-imposed timeout is the HTTP collaborator's concern.
#[async_trait]
pub trait DecisionModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}
