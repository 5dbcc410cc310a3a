use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::provider::{encode_image, VisionProvider, VisionRequest, MAX_UPLOAD_DIMENSION};
use crate::error::{Error, Result};

/// Sole owner of the inference engine.
///
/// One permit guards the engine. The permit travels into the blocking call
/// and is released only when that call returns, so a call abandoned on
/// timeout still holds the engine until it actually finishes.
#[derive(Clone)]
pub struct InferenceGateway {
    provider: Arc<dyn VisionProvider>,
    slot: Arc<Semaphore>,
    max_tokens: u32,
}

impl InferenceGateway {
    pub fn new(provider: Arc<dyn VisionProvider>, max_tokens: u32) -> Self {
        Self {
            provider,
            slot: Arc::new(Semaphore::new(1)),
            max_tokens,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.provider_name()
    }

    /// True while a call (possibly an orphaned one) holds the engine.
    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }

    /// Run one vision call. Waits for the engine without a deadline; `timeout`
    /// starts once the engine is acquired and bounds only this call.
    pub async fn analyze(
        &self,
        image: &[u8],
        prompt: String,
        model_override: Option<String>,
        timeout: Duration,
    ) -> Result<String> {
        let (image_base64, mime_type) = encode_image(image, MAX_UPLOAD_DIMENSION)?;
        let request = VisionRequest {
            image_base64,
            mime_type,
            prompt,
            model_override,
            max_tokens: self.max_tokens,
        };

        if self.is_busy() {
            debug!("Inference engine held by an earlier call; waiting");
        }
        let permit = self
            .slot
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("inference slot closed".to_string()))?;

        let provider = Arc::clone(&self.provider);
        let call = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            provider.analyze(&request, timeout)
        });

        debug!(provider = self.provider.provider_name(), ?timeout, "Inference call started");

        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(Error::Internal(format!(
                "inference task panicked: {}",
                join_err
            ))),
            Err(_) => {
                warn!(?timeout, "Inference call timed out; engine stays held until it returns");
                Err(Error::Timeout(timeout))
            }
        }
    }
}
