use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::GenericImageView;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;

use crate::config::{InferenceConfig, ProviderType};
use crate::error::{Error, Result};

/// Longest edge sent to the model.
pub const MAX_UPLOAD_DIMENSION: u32 = 1024;

/// One vision call: an encoded image plus the full prompt.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub image_base64: String,
    pub mime_type: &'static str,
    pub prompt: String,
    /// Served model name to use instead of the configured one (adapter modes).
    pub model_override: Option<String>,
    pub max_tokens: u32,
}

/// A blocking client for a vision-capable inference engine.
pub trait VisionProvider: Send + Sync {
    /// Run the model and return its raw text answer.
    fn analyze(&self, request: &VisionRequest, timeout: Duration) -> Result<String>;

    /// Get the provider name for display
    fn provider_name(&self) -> &'static str;

    fn text_embedding(&self, _text: &str) -> Result<Vec<f32>> {
        Err(Error::Embedding(format!(
            "{} has no embedding model configured",
            self.provider_name()
        )))
    }

    fn supports_embeddings(&self) -> bool {
        false
    }
}

/// Map a ureq failure onto the retry taxonomy: transport problems are
/// transient, an answer with an error status is not.
fn classify(err: ureq::Error) -> Error {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            let body = body.trim();
            if body.is_empty() {
                Error::InferenceFailed(format!("HTTP {}", code))
            } else {
                Error::InferenceFailed(format!("HTTP {}: {}", code, body))
            }
        }
        ureq::Error::Transport(transport) => Error::Unreachable(transport.to_string()),
    }
}

fn agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}

// ============================================================================
// OpenAI-compatible provider (LM Studio, vLLM, OpenAI)
// ============================================================================

pub struct OpenAICompatibleProvider {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    embedding_model: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: Vec<OpenAIContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum OpenAIContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl OpenAICompatibleProvider {
    pub fn new(endpoint: &str, model: &str, api_key: Option<&str>) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.map(|s| s.to_string()),
            embedding_model: None,
        }
    }

    pub fn with_embedding_model(mut self, model: Option<String>) -> Self {
        self.embedding_model = model;
        self
    }

    fn post(&self, path: &str, timeout: Duration) -> ureq::Request {
        let url = format!("{}/{}", self.endpoint, path);
        let mut req = agent(timeout)
            .post(&url)
            .set("Content-Type", "application/json");
        if let Some(ref api_key) = self.api_key {
            req = req.set("Authorization", &format!("Bearer {}", api_key));
        }
        req
    }
}

impl VisionProvider for OpenAICompatibleProvider {
    fn analyze(&self, request: &VisionRequest, timeout: Duration) -> Result<String> {
        let data_url = format!("data:{};base64,{}", request.mime_type, request.image_base64);
        let body = OpenAIChatRequest {
            model: request
                .model_override
                .clone()
                .unwrap_or_else(|| self.model.clone()),
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content: vec![
                    OpenAIContentPart::Text {
                        text: request.prompt.clone(),
                    },
                    OpenAIContentPart::ImageUrl {
                        image_url: ImageUrl { url: data_url },
                    },
                ],
            }],
            max_tokens: request.max_tokens,
            temperature: 0.3,
        };

        let response = self
            .post("chat/completions", timeout)
            .send_json(&body)
            .map_err(classify)?;

        let chat_response: OpenAIChatResponse = response
            .into_json()
            .map_err(|e| Error::InferenceFailed(format!("unreadable chat response: {}", e)))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::InferenceFailed("response had no choices".to_string()))
    }

    fn provider_name(&self) -> &'static str {
        "OpenAI-compatible"
    }

    fn text_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let Some(model) = self.embedding_model.clone() else {
            return Err(Error::Embedding("no embedding model configured".to_string()));
        };
        let request = EmbeddingRequest {
            model,
            input: text.to_string(),
        };

        let response = self
            .post("embeddings", Duration::from_secs(60))
            .send_json(&request)
            .map_err(classify)?;

        let embedding_response: EmbeddingResponse = response
            .into_json()
            .map_err(|e| Error::Embedding(format!("unreadable embedding response: {}", e)))?;

        embedding_response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::Embedding("no embedding in response".to_string()))
    }

    fn supports_embeddings(&self) -> bool {
        self.embedding_model.is_some()
    }
}

// ============================================================================
// Ollama provider
// ============================================================================

pub struct OllamaProvider {
    endpoint: String,
    model: String,
    embedding_model: Option<String>,
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    images: Vec<String>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaProvider {
    pub fn new(endpoint: Option<&str>, model: &str) -> Self {
        Self {
            endpoint: endpoint
                .unwrap_or("http://localhost:11434")
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            embedding_model: None,
        }
    }

    pub fn with_embedding_model(mut self, model: Option<String>) -> Self {
        self.embedding_model = model;
        self
    }
}

impl VisionProvider for OllamaProvider {
    fn analyze(&self, request: &VisionRequest, timeout: Duration) -> Result<String> {
        let body = OllamaRequest {
            model: request
                .model_override
                .clone()
                .unwrap_or_else(|| self.model.clone()),
            prompt: request.prompt.clone(),
            images: vec![request.image_base64.clone()],
            stream: false,
            options: OllamaOptions {
                num_predict: request.max_tokens,
                temperature: 0.3,
            },
        };

        let url = format!("{}/api/generate", self.endpoint);
        let response = agent(timeout)
            .post(&url)
            .set("Content-Type", "application/json")
            .send_json(&body)
            .map_err(classify)?;

        let ollama_response: OllamaResponse = response
            .into_json()
            .map_err(|e| Error::InferenceFailed(format!("unreadable Ollama response: {}", e)))?;

        Ok(ollama_response.response)
    }

    fn provider_name(&self) -> &'static str {
        "Ollama"
    }

    fn text_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let request = OllamaEmbeddingRequest {
            model: self
                .embedding_model
                .clone()
                .unwrap_or_else(|| "nomic-embed-text".to_string()),
            prompt: text.to_string(),
        };

        let url = format!("{}/api/embeddings", self.endpoint);
        let response = agent(Duration::from_secs(60))
            .post(&url)
            .set("Content-Type", "application/json")
            .send_json(&request)
            .map_err(classify)?;

        let embedding_response: OllamaEmbeddingResponse = response
            .into_json()
            .map_err(|e| Error::Embedding(format!("unreadable Ollama embedding: {}", e)))?;

        Ok(embedding_response.embedding)
    }

    fn supports_embeddings(&self) -> bool {
        true
    }
}

/// Create a vision provider based on configuration
pub fn create_provider(config: &InferenceConfig) -> Box<dyn VisionProvider> {
    match config.provider {
        ProviderType::OpenAI => Box::new(
            OpenAICompatibleProvider::new(
                &config.endpoint,
                &config.model,
                config.api_key.as_deref(),
            )
            .with_embedding_model(config.embedding_model.clone()),
        ),
        ProviderType::Ollama => Box::new(
            OllamaProvider::new(Some(&config.endpoint), &config.model)
                .with_embedding_model(config.embedding_model.clone()),
        ),
    }
}

/// Decode image bytes, shrink so neither edge exceeds `max_dimension`,
/// re-encode as JPEG and return it base64-encoded with its MIME type.
pub fn encode_image(bytes: &[u8], max_dimension: u32) -> Result<(String, &'static str)> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| Error::Validation(format!("unreadable image: {}", e)))?;

    let (width, height) = img.dimensions();
    let img = if width > max_dimension || height > max_dimension {
        img.resize(
            max_dimension,
            max_dimension,
            image::imageops::FilterType::Triangle,
        )
    } else {
        img
    };

    // JPEG has no alpha channel.
    let img = image::DynamicImage::ImageRgb8(img.to_rgb8());

    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, 85);
    img.write_with_encoder(encoder)
        .map_err(|e| Error::Internal(format!("failed to encode image as JPEG: {}", e)))?;

    Ok((BASE64.encode(buf.into_inner()), "image/jpeg"))
}

/// Extract JSON from a string that might contain markdown code blocks
pub fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();

    if trimmed.starts_with("```") {
        if let Some(start) = trimmed.find('\n') {
            let after_first_line = &trimmed[start + 1..];
            if let Some(end) = after_first_line.rfind("```") {
                return after_first_line[..end].trim();
            }
        }
    }

    // Prose around a bare object: take the outermost braces.
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start > 0 && end > start => &trimmed[start..=end],
        _ => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbaImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, image::Rgba([200, 100, 50, 128]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_encode_image_downscales_and_converts() {
        let (encoded, mime) = encode_image(&png(2048, 512), MAX_UPLOAD_DIMENSION).unwrap();
        assert_eq!(mime, "image/jpeg");

        let decoded = image::load_from_memory(&BASE64.decode(encoded).unwrap()).unwrap();
        assert_eq!(decoded.dimensions(), (1024, 256));
    }

    #[test]
    fn test_encode_image_rejects_garbage() {
        let err = encode_image(b"not an image", MAX_UPLOAD_DIMENSION).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_extract_json_from_fence() {
        let content = "```json\n{\"a\": 1}\n```";
        assert_eq!(extract_json(content), "{\"a\": 1}");
    }

    #[test]
    fn test_extract_json_from_prose() {
        let content = "Here is my critique:\n{\"a\": {\"b\": 2}}\nHope it helps.";
        assert_eq!(extract_json(content), "{\"a\": {\"b\": 2}}");
        assert_eq!(extract_json("  {\"a\": 1}  "), "{\"a\": 1}");
        assert_eq!(extract_json("no json here"), "no json here");
    }

    #[test]
    fn test_unreachable_endpoint_is_transient() {
        let provider = OpenAICompatibleProvider::new("http://127.0.0.1:9", "m", None);
        let request = VisionRequest {
            image_base64: String::new(),
            mime_type: "image/jpeg",
            prompt: "p".into(),
            model_override: None,
            max_tokens: 16,
        };
        let err = provider
            .analyze(&request, Duration::from_millis(500))
            .unwrap_err();
        assert!(err.is_transient(), "{:?}", err);
    }
}
