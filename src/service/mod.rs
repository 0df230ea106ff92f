//! Remote generation services.
//!
//! Stages only see the [`ImageGenerator`] and [`VideoGenerator`] traits.
//! A client is built once and passed in explicitly, which lets tests swap
//! in a fake. [`Gated`] wraps any client with the per-endpoint concurrency
//! limit and the mandatory per-call timeout.

pub mod http;
pub mod openai;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use image::DynamicImage;
use tokio::sync::Semaphore;

use crate::cancel::CancelFlag;
use crate::error::{ServiceError, ServiceResult};
use crate::models::Dimensions;

/// One image-edit call.
///
/// `size` is a request. The service may return something else, so callers
/// read the real size off the returned image.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub source: PathBuf,
    pub prompt: String,
    pub size: Dimensions,
}

/// One start/end conditioned video call.
#[derive(Debug, Clone)]
pub struct VideoRequest {
    pub start_image: PathBuf,
    pub end_image: PathBuf,
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: u64,
    pub steps: u32,
    pub fps: u32,
    pub frame_count: u32,
    pub size: Dimensions,
}

/// What the video service handed back.
///
/// The service writes the clip to a temporary location of its own; `path`
/// is `None` when the reply named no file at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoOutput {
    pub path: Option<PathBuf>,
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, request: ImageRequest) -> ServiceResult<DynamicImage>;
}

#[async_trait]
pub trait VideoGenerator: Send + Sync {
    async fn generate(&self, request: VideoRequest) -> ServiceResult<VideoOutput>;
}

/// Concurrency slots and a timeout in front of one endpoint.
pub struct Gated<S: ?Sized> {
    inner: Arc<S>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    cancel: CancelFlag,
}

impl<S: ?Sized> Gated<S> {
    pub fn new(inner: Arc<S>, max_in_flight: usize, timeout: Duration, cancel: CancelFlag) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            timeout,
            cancel,
        }
    }

    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    async fn call<T, F>(&self, call: F) -> ServiceResult<T>
    where
        F: Future<Output = ServiceResult<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ServiceError::Cancelled)?;
        // Waiting for a slot can take a while; re-check before going remote.
        if self.cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| ServiceError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl<S: ImageGenerator + ?Sized> ImageGenerator for Gated<S> {
    async fn generate(&self, request: ImageRequest) -> ServiceResult<DynamicImage> {
        self.call(self.inner.generate(request)).await
    }
}

#[async_trait]
impl<S: VideoGenerator + ?Sized> VideoGenerator for Gated<S> {
    async fn generate(&self, request: VideoRequest) -> ServiceResult<VideoOutput> {
        self.call(self.inner.generate(request)).await
    }
}

/// Reads a local image into a `data:` URL.
pub(crate) async fn image_data_url(path: &Path) -> ServiceResult<String> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ServiceError::SourceMissing(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    let mime = match image::ImageFormat::from_path(path) {
        Ok(format) => format.to_mime_type(),
        Err(_) => "image/jpeg",
    };
    Ok(format!("data:{mime};base64,{}", BASE64_STANDARD.encode(bytes)))
}

/// Decodes a base64 image payload, with or without a `data:` prefix.
pub(crate) fn decode_image_payload(payload: &str) -> ServiceResult<DynamicImage> {
    let encoded = match payload.split_once(";base64,") {
        Some((_, rest)) => rest,
        None => payload,
    };
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|e| ServiceError::malformed(format!("invalid base64 image: {e}")))?;
    Ok(image::load_from_memory(&bytes)?)
}

pub(crate) fn ensure_source(path: &Path) -> ServiceResult<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ServiceError::SourceMissing(path.to_path_buf()))
    }
}
