use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::{fmt, str::FromStr};
use thiserror::Error;

use crate::form::ImageUpload;
use crate::providers::{GenerationRequest, ImageGenerator, InlineImage, Part, ProviderError};

pub const LOGO_INSTRUCTION: &str = "\n\nInstructions for AI: The first image is the main product. The second image is the brand's logo. Please seamlessly integrate the logo into the generated advertisement scene.";

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("API key is not configured. Please set the {0} environment variable.")]
    MissingCredential(String),
    #[error("API Error: {0}")]
    Provider(ProviderError),
    #[error("API Error: Image generation blocked: {0}. Please adjust your prompt.")]
    Blocked(String),
    #[error("API Error: Model returned text instead of an image: \"{0}\"")]
    TextOnly(String),
    #[error("API Error: No image data found in the API response.")]
    NoImage,
}

impl From<ProviderError> for GenerationError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::MissingCredential(env) => GenerationError::MissingCredential(env),
            other => GenerationError::Provider(other),
        }
    }
}

/// `data:<mime>;base64,<payload>`
#[derive(Debug, Clone, PartialEq)]
pub struct ImageDataUri {
    pub mime_type: String,
    pub data: String,
}

impl ImageDataUri {
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data)
    }
}

impl fmt::Display for ImageDataUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data:{};base64,{}", self.mime_type, self.data)
    }
}

impl FromStr for ImageDataUri {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("data:").ok_or("not a data URI")?;
        let (mime_type, data) = rest.split_once(";base64,").ok_or("data URI is not base64")?;
        Ok(Self { mime_type: mime_type.to_string(), data: data.to_string() })
    }
}

fn inline(upload: &ImageUpload) -> Part {
    Part::Image(InlineImage { mime_type: upload.mime_type.clone(), data: upload.to_base64() })
}

/// Sends prompt, product photo and optional logo to the generator and returns
/// the first inline image of the reply.
pub async fn generate_ad_image(
    generator: &dyn ImageGenerator,
    prompt: &str,
    product: &ImageUpload,
    logo: Option<&ImageUpload>,
) -> Result<ImageDataUri, GenerationError> {
    let mut final_prompt = prompt.to_string();
    let mut images = vec![inline(product)];
    if let Some(logo) = logo {
        images.push(inline(logo));
        final_prompt.push_str(LOGO_INSTRUCTION);
    }
    let mut parts = Vec::with_capacity(images.len() + 1);
    parts.push(Part::Text(final_prompt));
    parts.extend(images);

    let resp = generator
        .generate(&GenerationRequest { parts })
        .await
        .inspect_err(|e| tracing::error!(provider = generator.name(), error = %e, "image generation call failed"))?;

    let image = resp.parts.iter().find_map(|p| match p {
        Part::Image(img) => Some(img),
        Part::Text(_) => None,
    });
    if let Some(img) = image.filter(|img| !img.data.is_empty()) {
        return Ok(ImageDataUri { mime_type: img.mime_type.clone(), data: img.data.clone() });
    }

    if let Some(reason) = resp.block_reason {
        return Err(GenerationError::Blocked(reason));
    }

    let text = resp.parts.into_iter().find_map(|p| match p {
        Part::Text(t) if !t.is_empty() => Some(t),
        _ => None,
    });
    match text {
        Some(t) => Err(GenerationError::TextOnly(t)),
        None => Err(GenerationError::NoImage),
    }
}
