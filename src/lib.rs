//! Video augmentation pipeline.
//!
//! Four stages hand work to each other through the filesystem: the frame
//! extractor pulls the first and last frame of every clip, the augmenter
//! renders each pair once per prompt, the matcher joins the augmented
//! halves back together by filename, and the synthesizer turns every
//! matched pair into a new clip. Provenance (asset, role, prompt) lives
//! entirely in the file names; see [`naming`].

pub mod augment;
pub mod cancel;
pub mod capture;
pub mod config;
pub mod error;
pub mod fs_utils;
pub mod layout;
pub mod matcher;
pub mod models;
pub mod naming;
pub mod pipeline;
pub mod prompts;
pub mod report;
pub mod retry;
pub mod service;
pub mod synthesize;

pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult, ServiceError};
pub use pipeline::Pipeline;
