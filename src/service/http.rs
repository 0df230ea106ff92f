//! JSON-over-HTTP clients for self-hosted generation endpoints.
//!
//! Images travel as base64 `data:` URLs. The image endpoint answers with
//! either an inline base64 image or a path on storage shared with this
//! process. The video endpoint always answers with a path.

use std::path::PathBuf;

use async_trait::async_trait;
use image::DynamicImage;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    decode_image_payload, image_data_url, ImageGenerator, ImageRequest, VideoGenerator,
    VideoOutput, VideoRequest,
};
use crate::error::{ServiceError, ServiceResult};

/// Fixed sampling parameters sent with every image call.
#[derive(Debug, Clone)]
pub struct ImageSampling {
    pub seed: u64,
    pub randomize_seed: bool,
    pub true_guidance_scale: f32,
    pub num_inference_steps: u32,
    pub rewrite_prompt: bool,
}

impl Default for ImageSampling {
    fn default() -> Self {
        Self {
            seed: 0,
            randomize_seed: true,
            true_guidance_scale: 1.0,
            num_inference_steps: 4,
            rewrite_prompt: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct InferRequest<'a> {
    image: String,
    prompt: &'a str,
    width: u32,
    height: u32,
    seed: u64,
    randomize_seed: bool,
    true_guidance_scale: f32,
    num_inference_steps: u32,
    rewrite_prompt: bool,
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct GenerateVideoRequest<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    seed: u64,
    steps: u32,
    input_image: String,
    end_image: String,
    fps: u32,
    frame_num: u32,
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateVideoResponse {
    #[serde(default)]
    video: Option<PathBuf>,
}

async fn post_json<B, R>(client: &Client, url: &str, body: &B) -> ServiceResult<R>
where
    B: Serialize + ?Sized,
    R: for<'de> Deserialize<'de>,
{
    let response = client.post(url).json(body).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ServiceError::Status {
            status: status.as_u16(),
            body,
        });
    }
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|e| ServiceError::malformed(format!("{e}: {text}")))
}

pub struct HttpImageGenerator {
    client: Client,
    url: String,
    sampling: ImageSampling,
}

impl HttpImageGenerator {
    pub fn new(endpoint: &str, sampling: ImageSampling) -> Self {
        Self {
            client: Client::new(),
            url: format!("{}/infer", endpoint.trim_end_matches('/')),
            sampling,
        }
    }
}

#[async_trait]
impl ImageGenerator for HttpImageGenerator {
    async fn generate(&self, request: ImageRequest) -> ServiceResult<DynamicImage> {
        let body = InferRequest {
            image: image_data_url(&request.source).await?,
            prompt: &request.prompt,
            width: request.size.width,
            height: request.size.height,
            seed: self.sampling.seed,
            randomize_seed: self.sampling.randomize_seed,
            true_guidance_scale: self.sampling.true_guidance_scale,
            num_inference_steps: self.sampling.num_inference_steps,
            rewrite_prompt: self.sampling.rewrite_prompt,
        };
        debug!(url = %self.url, requested = %request.size, "Submitting image edit");

        let response: InferResponse = post_json(&self.client, &self.url, &body).await?;
        match (response.image, response.path) {
            (Some(payload), _) => decode_image_payload(&payload),
            (None, Some(path)) => {
                if !path.is_file() {
                    return Err(ServiceError::NoOutput(format!(
                        "image path does not exist: {}",
                        path.display()
                    )));
                }
                let image = tokio::task::spawn_blocking(move || image::open(path))
                    .await
                    .map_err(std::io::Error::other)??;
                Ok(image)
            }
            (None, None) => Err(ServiceError::malformed("response has neither image nor path")),
        }
    }
}

pub struct HttpVideoGenerator {
    client: Client,
    url: String,
}

impl HttpVideoGenerator {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: Client::new(),
            url: format!("{}/generate_video", endpoint.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl VideoGenerator for HttpVideoGenerator {
    async fn generate(&self, request: VideoRequest) -> ServiceResult<VideoOutput> {
        let body = GenerateVideoRequest {
            prompt: &request.prompt,
            negative_prompt: &request.negative_prompt,
            seed: request.seed,
            steps: request.steps,
            input_image: image_data_url(&request.start_image).await?,
            end_image: image_data_url(&request.end_image).await?,
            fps: request.fps,
            frame_num: request.frame_count,
            width: request.size.width,
            height: request.size.height,
        };
        debug!(url = %self.url, "Submitting video generation");

        let response: GenerateVideoResponse = post_json(&self.client, &self.url, &body).await?;
        Ok(VideoOutput {
            path: response.video,
        })
    }
}
