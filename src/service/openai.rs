use async_openai::config::OpenAIConfig;
use async_openai::types::{CreateImageEditRequestArgs, DallE2ImageSize, Image, ImageResponseFormat};
use async_openai::Client;
use async_trait::async_trait;
use image::DynamicImage;
use tracing::debug;

use super::{decode_image_payload, ensure_source, ImageGenerator, ImageRequest};
use crate::error::{ServiceError, ServiceResult};
use crate::models::Dimensions;

/// Image edits through the OpenAI images endpoint.
///
/// The endpoint only renders a few square sizes, so the requested size is
/// snapped to the nearest one and the returned image is usually not the
/// size that was asked for.
pub struct OpenAiImageEditor {
    client: Client<OpenAIConfig>,
    http: reqwest::Client,
}

impl OpenAiImageEditor {
    /// Reads `OPENAI_API_KEY` from the environment like [`Client::new`].
    pub fn new(api_base: Option<&str>) -> Self {
        let mut config = OpenAIConfig::new();
        if let Some(base) = api_base {
            config = config.with_api_base(base);
        }
        Self {
            client: Client::with_config(config),
            http: reqwest::Client::new(),
        }
    }
}

pub(crate) fn snap_size(size: Dimensions) -> DallE2ImageSize {
    match size.width.max(size.height) {
        0..=256 => DallE2ImageSize::S256x256,
        257..=512 => DallE2ImageSize::S512x512,
        _ => DallE2ImageSize::S1024x1024,
    }
}

#[async_trait]
impl ImageGenerator for OpenAiImageEditor {
    async fn generate(&self, request: ImageRequest) -> ServiceResult<DynamicImage> {
        ensure_source(&request.source)?;

        let size = snap_size(request.size);
        debug!(
            source = %request.source.display(),
            requested = %request.size,
            snapped = ?size,
            "Submitting image edit"
        );
        let edit = CreateImageEditRequestArgs::default()
            .image(request.source.as_path())
            .prompt(request.prompt)
            .n(1)
            .size(size)
            .response_format(ImageResponseFormat::B64Json)
            .build()?;

        let response = self.client.images().create_edit(edit).await?;
        let image = response
            .data
            .first()
            .ok_or_else(|| ServiceError::malformed("No image in response from OpenAI"))?;

        match &**image {
            Image::B64Json { b64_json, .. } => decode_image_payload(b64_json),
            Image::Url { url, .. } => {
                let bytes = self
                    .http
                    .get(url)
                    .send()
                    .await?
                    .error_for_status()?
                    .bytes()
                    .await?;
                Ok(image::load_from_memory(&bytes)?)
            }
        }
    }
}
