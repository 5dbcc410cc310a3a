//! Scripted provider for tests. Built with the `test-support` feature.

use image::{ImageFormat, Rgb, RgbImage};
use serde_json::json;
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::Mutex;
use std::time::Duration;

use super::provider::{VisionProvider, VisionRequest};
use crate::dimensions::Dimension;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub enum MockResponse {
    Reply(String),
    /// Connection-level failure; transient.
    Unreachable,
    /// The engine answered with an error status; not retried.
    Failed(String),
    /// Block the calling thread, then fail as the engine's own timeout would.
    Hang(Duration),
    /// Block, then answer with the default critique.
    Slow(Duration),
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub prompt: String,
    pub model_override: Option<String>,
}

/// Pops one scripted response per call; falls back to a valid critique
/// scoring every dimension 7.
pub struct MockProvider {
    script: Mutex<VecDeque<MockResponse>>,
    calls: Mutex<Vec<RecordedCall>>,
    default_reply: String,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        let scores: Vec<(Dimension, f32)> = Dimension::ALL.iter().map(|d| (*d, 7.0)).collect();
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            default_reply: reply_with_scores(&scores),
        }
    }

    pub fn push(&self, response: MockResponse) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl VisionProvider for MockProvider {
    fn analyze(&self, request: &VisionRequest, _timeout: Duration) -> Result<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedCall {
                prompt: request.prompt.clone(),
                model_override: request.model_override.clone(),
            });

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        match next {
            None => Ok(self.default_reply.clone()),
            Some(MockResponse::Reply(text)) => Ok(text),
            Some(MockResponse::Unreachable) => {
                Err(Error::Unreachable("connection refused".to_string()))
            }
            Some(MockResponse::Failed(body)) => Err(Error::InferenceFailed(body)),
            Some(MockResponse::Hang(duration)) => {
                std::thread::sleep(duration);
                Err(Error::Timeout(duration))
            }
            Some(MockResponse::Slow(duration)) => {
                std::thread::sleep(duration);
                Ok(self.default_reply.clone())
            }
        }
    }

    fn provider_name(&self) -> &'static str {
        "Mock"
    }
}

/// A well-formed model answer. Dimensions not listed score 7.
pub fn reply_with_scores(scores: &[(Dimension, f32)]) -> String {
    let dimensions: serde_json::Map<String, serde_json::Value> = Dimension::ALL
        .iter()
        .map(|dim| {
            let score = scores
                .iter()
                .find(|(d, _)| d == dim)
                .map(|(_, s)| *s)
                .unwrap_or(7.0);
            (
                dim.as_str().to_string(),
                json!({
                    "score": score,
                    "comment": format!("{} reads at {}", dim.display_name(), score),
                    "recommendation": format!("work on {}", dim.display_name().to_lowercase()),
                }),
            )
        })
        .collect();

    json!({
        "image_description": "A test frame.",
        "dimensions": dimensions,
        "recommendations": ["shoot again at golden hour"],
    })
    .to_string()
}

/// A tiny PNG the image decoder accepts.
pub fn test_image() -> Vec<u8> {
    let img = RgbImage::from_fn(8, 8, |x, y| Rgb([(x * 32) as u8, (y * 32) as u8, 128]));
    let mut buf = Cursor::new(Vec::new());
    // Encoding an in-memory 8x8 buffer cannot fail.
    let _ = img.write_to(&mut buf, ImageFormat::Png);
    buf.into_inner()
}
