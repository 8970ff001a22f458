use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{ImageBuffer, Rgba};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ProviderCfg;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("credential not configured ({0})")]
    MissingCredential(String),
    #[error("{0}")]
    Http(String),
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unreadable response: {0}")]
    Decode(String),
    #[error("{0}")]
    Fatal(String),
}

/// Base64 payload plus MIME type, as exchanged with the model.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    Image(InlineImage),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub parts: Vec<Part>,
}

/// Parts of the first candidate, plus the prompt-level block reason if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationResponse {
    pub parts: Vec<Part>,
    pub block_reason: Option<String>,
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, req: &GenerationRequest) -> Result<GenerationResponse, ProviderError>;
    fn name(&self) -> &'static str;
    fn model(&self) -> &str;
}

pub struct GeminiGenerator {
    client: reqwest::Client,
    api_key: Option<String>,
    api_key_env: String,
    model: String,
    base_url: String,
}

impl GeminiGenerator {
    pub fn new(cfg: &ProviderCfg, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            api_key_env: cfg.api_key_env.clone(),
            model: cfg.model.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn has_credential(&self) -> bool {
        self.api_key.is_some()
    }

    fn endpoint(&self) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateReq<'a> {
    contents: Vec<ReqContent<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct ReqContent<'a> {
    parts: Vec<ReqPart<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ReqPart<'a> {
    Text { text: &'a str },
    #[serde(rename_all = "camelCase")]
    Inline { inline_data: Blob<'a> },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: [&'static str; 2],
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResp {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<RespContent>,
}

#[derive(Debug, Deserialize)]
struct RespContent {
    #[serde(default)]
    parts: Vec<RespPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RespPart {
    text: Option<String>,
    inline_data: Option<RespBlob>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RespBlob {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Non-2xx reply: the envelope's message when the body is a Google error
/// object, the raw body otherwise.
fn status_error(status: u16, body: String) -> ProviderError {
    let message = serde_json::from_str::<ErrorEnvelope>(&body)
        .map(|env| env.error.message)
        .unwrap_or(body);
    ProviderError::Status { status, message }
}

impl From<GenerateResp> for GenerationResponse {
    fn from(resp: GenerateResp) -> Self {
        let parts = resp
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| match (p.inline_data, p.text) {
                (Some(blob), _) => Some(Part::Image(InlineImage { mime_type: blob.mime_type, data: blob.data })),
                (None, Some(text)) => Some(Part::Text(text)),
                (None, None) => None,
            })
            .collect();
        Self {
            parts,
            block_reason: resp.prompt_feedback.and_then(|f| f.block_reason),
        }
    }
}

#[async_trait]
impl ImageGenerator for GeminiGenerator {
    fn name(&self) -> &'static str { "gemini" }

    fn model(&self) -> &str { &self.model }

    async fn generate(&self, req: &GenerationRequest) -> Result<GenerationResponse, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::MissingCredential(self.api_key_env.clone()))?;

        let parts = req
            .parts
            .iter()
            .map(|p| match p {
                Part::Text(text) => ReqPart::Text { text },
                Part::Image(img) => ReqPart::Inline {
                    inline_data: Blob { mime_type: &img.mime_type, data: &img.data },
                },
            })
            .collect();
        let body = GenerateReq {
            contents: vec![ReqContent { parts }],
            generation_config: GenerationConfig { response_modalities: ["IMAGE", "TEXT"] },
        };

        tracing::debug!(model = %self.model, "calling generateContent");
        let resp = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), text));
        }

        let parsed = resp
            .json::<GenerateResp>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(parsed.into())
    }
}

/// Offline generator: paints a deterministic pattern tinted by the inputs.
pub struct MockGenerator;

#[async_trait]
impl ImageGenerator for MockGenerator {
    fn name(&self) -> &'static str { "mock" }

    fn model(&self) -> &str { "mock" }

    async fn generate(&self, req: &GenerationRequest) -> Result<GenerationResponse, ProviderError> {
        // CPU-bound image synthesis. Small and fast enough to do inline for now.
        let prompt_len = req
            .parts
            .iter()
            .map(|p| match p {
                Part::Text(t) => t.len(),
                Part::Image(_) => 0,
            })
            .sum::<usize>();
        let images = req.parts.iter().filter(|p| matches!(p, Part::Image(_))).count();

        let w = 256u32;
        let h = 256u32;
        let mut img = ImageBuffer::<Rgba<u8>, Vec<u8>>::new(w, h);
        for (x, y, p) in img.enumerate_pixels_mut() {
            let v = ((x ^ y) & 0xFF) as u8;
            *p = Rgba([v, 255 - v, (prompt_len % 255) as u8, if images > 1 { 200 } else { 255 }]);
        }
        let mut png_bytes: Vec<u8> = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut png_bytes), image::ImageFormat::Png)
            .map_err(|e| ProviderError::Fatal(format!("encode error: {e}")))?;

        Ok(GenerationResponse {
            parts: vec![Part::Image(InlineImage {
                mime_type: "image/png".into(),
                data: STANDARD.encode(&png_bytes),
            })],
            block_reason: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> GenerationResponse {
        serde_json::from_str::<GenerateResp>(json).unwrap().into()
    }

    #[test]
    fn error_status_unwraps_google_envelope() {
        let err = status_error(403, r#"{"error":{"code":403,"message":"quota","status":"PERMISSION_DENIED"}}"#.into());
        assert!(matches!(&err, ProviderError::Status { status: 403, message } if message == "quota"));
        assert_eq!(err.to_string(), "HTTP 403: quota");
    }

    #[test]
    fn error_status_falls_back_to_raw_body() {
        let err = status_error(502, "Bad Gateway".into());
        assert!(matches!(&err, ProviderError::Status { status: 502, message } if message == "Bad Gateway"));

        let err = status_error(500, r#"{"detail":"nope"}"#.into());
        assert!(matches!(&err, ProviderError::Status { message, .. } if message == r#"{"detail":"nope"}"#));
    }

    #[test]
    fn parses_inline_image_and_text() {
        let resp = parse(
            r#"{"candidates":[{"content":{"parts":[
                {"text":"Here you go"},
                {"inlineData":{"mimeType":"image/png","data":"abc123"}}
            ]}}]}"#,
        );
        assert_eq!(
            resp.parts,
            vec![
                Part::Text("Here you go".into()),
                Part::Image(InlineImage { mime_type: "image/png".into(), data: "abc123".into() }),
            ]
        );
        assert!(resp.block_reason.is_none());
    }

    #[test]
    fn parses_block_reason_without_candidates() {
        let resp = parse(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#);
        assert!(resp.parts.is_empty());
        assert_eq!(resp.block_reason.as_deref(), Some("SAFETY"));
    }

    #[test]
    fn only_first_candidate_counts() {
        let resp = parse(
            r#"{"candidates":[
                {"content":{"parts":[{"text":"first"}]}},
                {"content":{"parts":[{"inlineData":{"mimeType":"image/png","data":"zz"}}]}}
            ]}"#,
        );
        assert_eq!(resp.parts, vec![Part::Text("first".into())]);
    }

    #[test]
    fn serializes_request_in_wire_shape() {
        let body = GenerateReq {
            contents: vec![ReqContent {
                parts: vec![
                    ReqPart::Text { text: "hello" },
                    ReqPart::Inline { inline_data: Blob { mime_type: "image/jpeg", data: "AAA" } },
                ],
            }],
            generation_config: GenerationConfig { response_modalities: ["IMAGE", "TEXT"] },
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "contents": [{"parts": [
                    {"text": "hello"},
                    {"inlineData": {"mimeType": "image/jpeg", "data": "AAA"}}
                ]}],
                "generationConfig": {"responseModalities": ["IMAGE", "TEXT"]}
            })
        );
    }

    #[tokio::test]
    async fn missing_credential_fails_before_any_request() {
        let cfg = ProviderCfg { base_url: "http://127.0.0.1:9".into(), ..ProviderCfg::default() };
        let gen = GeminiGenerator::new(&cfg, Some("  ".into()));
        assert!(!gen.has_credential());
        let err = gen.generate(&GenerationRequest { parts: vec![Part::Text("x".into())] }).await.unwrap_err();
        assert!(matches!(err, ProviderError::MissingCredential(env) if env == "API_KEY"));
    }

    #[tokio::test]
    async fn mock_returns_png() {
        let resp = MockGenerator
            .generate(&GenerationRequest { parts: vec![Part::Text("ad".into())] })
            .await
            .unwrap();
        let Part::Image(img) = &resp.parts[0] else { panic!("expected image") };
        assert_eq!(img.mime_type, "image/png");
        let bytes = STANDARD.decode(&img.data).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), image::ImageFormat::Png);
    }
}
