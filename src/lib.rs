//! Advisor-persona photo critique service.
//!
//! Jobs are admitted through [`jobs::JobManager`], run one at a time against a
//! vision model through [`inference::InferenceGateway`], and, in retrieval
//! modes, cite reference images and passages chosen by [`retrieval`].

pub mod analysis;
pub mod api;
pub mod config;
pub mod db;
pub mod dimensions;
pub mod error;
pub mod indexing;
pub mod inference;
pub mod jobs;
pub mod logging;
pub mod retrieval;

pub use error::{Error, Result};
