mod gateway;
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
mod provider;

pub use gateway::InferenceGateway;
pub use provider::{
    create_provider, encode_image, extract_json, OllamaProvider, OpenAICompatibleProvider,
    VisionProvider, VisionRequest, MAX_UPLOAD_DIMENSION,
};
