//! HTTP client for the attribute inference service
//!
//! POSTs `{"image": "<base64 JPEG>"}` and expects
//! `{"gender": "Man"|"Woman"|..., "age": 31 | "?", "emotion": "happy"}`.

use crate::domain::types::{Attributes, Gender};
use crate::infra::config::Config;
use crate::services::attributes::AttributeInference;
use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;
use tracing::info;

#[derive(Serialize)]
struct InferenceRequest<'a> {
    image: &'a str,
}

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    gender: Option<String>,
    /// Integer age, or a string such as "?" when unknown
    #[serde(default)]
    age: Option<serde_json::Value>,
    #[serde(default)]
    emotion: Option<String>,
}

/// Encode a crop as base64 JPEG
pub fn encode_crop(crop: &RgbImage) -> anyhow::Result<String> {
    let mut bytes = Vec::new();
    crop.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .context("encoding crop as JPEG")?;
    Ok(STANDARD.encode(bytes))
}

/// Parse the service's response body into attributes
pub fn parse_response(body: &[u8]) -> anyhow::Result<Attributes> {
    let response: InferenceResponse =
        serde_json::from_slice(body).context("parsing inference response")?;

    let gender = response
        .gender
        .as_deref()
        .map_or(Gender::Unknown, |g| g.parse().unwrap_or_default());
    let age = match response.age {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|a| u32::try_from(a).ok()),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    let emotion = response.emotion.map(|e| e.trim().to_lowercase()).filter(|e| !e.is_empty());

    Ok(Attributes { gender, age, emotion })
}

pub struct HttpInference {
    client: reqwest::Client,
    url: String,
}

impl HttpInference {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building inference HTTP client")?;
        info!(url = %url, timeout_ms = %timeout.as_millis(), "inference_client_initialized");
        Ok(Self { client, url: url.to_string() })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(config.attributes_url(), Duration::from_millis(config.attributes_timeout_ms()))
    }
}

#[async_trait]
impl AttributeInference for HttpInference {
    async fn analyze(&self, crop: &RgbImage) -> anyhow::Result<Attributes> {
        let image = encode_crop(crop)?;
        let body = serde_json::to_vec(&InferenceRequest { image: &image })?;

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .with_context(|| format!("POST {}", self.url))?
            .error_for_status()?;

        let bytes = response.bytes().await.context("reading inference response")?;
        parse_response(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_parse_full_response() {
        let attrs = parse_response(br#"{"gender": "Woman", "age": 29, "emotion": "Happy"}"#).unwrap();
        assert_eq!(attrs.gender, Gender::Woman);
        assert_eq!(attrs.age, Some(29));
        assert_eq!(attrs.emotion.as_deref(), Some("happy"));
    }

    #[test]
    fn test_parse_unknown_age_and_gender() {
        let attrs = parse_response(br#"{"gender": "N/A", "age": "?", "emotion": ""}"#).unwrap();
        assert_eq!(attrs.gender, Gender::Unknown);
        assert_eq!(attrs.age, None);
        assert_eq!(attrs.emotion, None);
    }

    #[test]
    fn test_parse_partial_response() {
        let attrs = parse_response(br#"{"age": "41"}"#).unwrap();
        assert_eq!(attrs.gender, Gender::Unknown);
        assert_eq!(attrs.age, Some(41));
    }

    #[test]
    fn test_parse_invalid_body() {
        assert!(parse_response(b"<html>502</html>").is_err());
    }

    #[test]
    fn test_encode_crop_is_jpeg() {
        let crop = RgbImage::from_pixel(8, 8, Rgb([200, 10, 10]));
        let encoded = encode_crop(&crop).unwrap();
        let bytes = STANDARD.decode(encoded).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Jpeg);
    }
}
