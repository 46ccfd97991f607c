use async_trait::async_trait;
use db::models::image_generation::ImageGeneration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EligibilityError {
    #[error("Processing not allowed: {0}")]
    Denied(String),
}

/// Pre-flight check asked before a transformation is scheduled. Billing and
/// quota systems plug in here; the pipeline itself stays payment-agnostic.
#[async_trait]
pub trait ProcessingGate: Send + Sync {
    async fn check(&self, generation: &ImageGeneration) -> Result<(), EligibilityError>;
}

/// Approves everything, for installs without a billing integration.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl ProcessingGate for AllowAll {
    async fn check(&self, _generation: &ImageGeneration) -> Result<(), EligibilityError> {
        Ok(())
    }
}
