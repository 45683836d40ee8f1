use std::time::Duration;

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::{CONFIG, TEXT_SYSTEM_PROMPT};
use crate::utils::http::get_http_client;
use crate::utils::timing::log_llm_timing;

#[derive(Debug, thiserror::Error)]
#[error("Image generation failed: {0}")]
pub struct ImageGenerationError(pub String);

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

const GEMINI_MAX_RETRY_ATTEMPTS: usize = 2;
const GEMINI_RETRY_BASE_DELAY_MS: u64 = 900;

// 1x1 transparent PNG served when mock mode is active
const MOCK_PNG: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR\x00\x00\x00\x01\x00\x00\x00\x01\x08\x06\x00\x00\x00\x1f\x15\xc4\x89\x00\x00\x00\nIDATx\x9cc`\x00\x00\x00\x02\x00\x01\xe2!\xbc3\x00\x00\x00\x00IEND\xaeB`\x82";

/// Mock mode short-circuits the network entirely. Active by default and
/// whenever no API key is configured.
fn mock_enabled() -> bool {
    CONFIG.enable_gemini_mock || CONFIG.gemini_api_key.trim().is_empty()
}

fn redact_gemini_api_key(text: &str) -> String {
    let key = CONFIG.gemini_api_key.trim();
    if key.is_empty() {
        return text.to_string();
    }
    text.replace(key, "[redacted]")
}

fn gemini_should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn gemini_should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn gemini_retry_delay(attempt: usize) -> Duration {
    let attempt = attempt.max(1) as u64;
    Duration::from_millis(GEMINI_RETRY_BASE_DELAY_MS.saturating_mul(attempt))
}

fn build_safety_settings() -> Vec<Value> {
    let threshold = match CONFIG.gemini_safety_settings.as_str() {
        "standard" => "BLOCK_MEDIUM_AND_ABOVE",
        _ => "OFF",
    };

    vec![
        json!({ "category": "HARM_CATEGORY_HARASSMENT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_CIVIC_INTEGRITY", "threshold": threshold }),
    ]
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn summarize_error_body(body: &str) -> (Option<String>, String) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return (None, "empty response body".to_string());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let message = value
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .or_else(|| {
                value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(|v| v.to_string())
            });
        return (message, truncate_for_log(&value.to_string(), 2000));
    }

    (None, truncate_for_log(trimmed, 2000))
}

fn extract_text_from_response(response: GeminiResponse) -> String {
    let mut text = String::new();
    for candidate in response.candidates.unwrap_or_default() {
        if let Some(content) = candidate.content {
            for part in content.parts.unwrap_or_default() {
                if let GeminiPart::Text { text: part_text } = part {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&part_text);
                }
            }
        }
    }
    text
}

fn extract_images_from_response(response: GeminiResponse) -> Vec<Vec<u8>> {
    let mut images = Vec::new();
    for candidate in response.candidates.unwrap_or_default() {
        if let Some(content) = candidate.content {
            for part in content.parts.unwrap_or_default() {
                if let GeminiPart::InlineData { inline_data } = part {
                    if inline_data.mime_type.starts_with("image/") {
                        if let Ok(bytes) = general_purpose::STANDARD.decode(inline_data.data) {
                            images.push(bytes);
                        }
                    }
                }
            }
        }
    }
    images
}

async fn call_gemini_api(model: &str, payload: Value) -> Result<GeminiResponse> {
    let client = get_http_client();
    let url = format!(
        "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
        model, CONFIG.gemini_api_key
    );

    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let response = match client
            .post(&url)
            .timeout(Duration::from_secs(90))
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let err_text = redact_gemini_api_key(&err.to_string());
                let should_retry =
                    gemini_should_retry_error(&err) && attempt < GEMINI_MAX_RETRY_ATTEMPTS;
                warn!(
                    "Gemini request failed to send: {} (timeout={}, connect={}, retrying={})",
                    err_text,
                    err.is_timeout(),
                    err.is_connect(),
                    should_retry
                );
                if should_retry {
                    tokio::time::sleep(gemini_retry_delay(attempt)).await;
                    continue;
                }
                return Err(anyhow!("Gemini request failed: {}", err_text));
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let (message, body_summary) = summarize_error_body(&body);
            let should_retry =
                gemini_should_retry_status(status) && attempt < GEMINI_MAX_RETRY_ATTEMPTS;
            warn!(
                "Gemini API error: status={}, body={}, retrying={}",
                status, body_summary, should_retry
            );
            if should_retry {
                tokio::time::sleep(gemini_retry_delay(attempt)).await;
                continue;
            }
            let detail = message.unwrap_or(body_summary);
            return Err(anyhow!(
                "Gemini request failed with status {}: {}",
                status,
                detail
            ));
        }

        return Ok(response.json::<GeminiResponse>().await?);
    }
}

pub async fn generate_text(prompt: &str) -> Result<String> {
    if mock_enabled() {
        return Ok(format!("[mock] {prompt}"));
    }

    let payload = json!({
        "systemInstruction": { "parts": [{ "text": TEXT_SYSTEM_PROMPT }] },
        "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        "generationConfig": {
            "temperature": CONFIG.gemini_temperature,
            "topK": CONFIG.gemini_top_k,
            "topP": CONFIG.gemini_top_p,
            "maxOutputTokens": CONFIG.gemini_max_output_tokens,
        },
        "safetySettings": build_safety_settings(),
    });

    let model = &CONFIG.gemini_model;
    log_llm_timing("gemini", model, "generate_text", None, || async {
        let response = call_gemini_api(model, payload).await?;
        let text = extract_text_from_response(response);
        if text.trim().is_empty() {
            return Err(anyhow!("Gemini returned no text (model: {model})"));
        }
        Ok(text)
    })
    .await
}

pub async fn generate_image(prompt: &str) -> Result<Vec<Vec<u8>>, ImageGenerationError> {
    if mock_enabled() {
        return Ok(vec![MOCK_PNG.to_vec()]);
    }

    let payload = json!({
        "systemInstruction": {
            "parts": [{ "text": "Generate an image based on the prompt. CRITICAL: response must be an image, NOT TEXT." }]
        },
        "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        "generationConfig": { "responseModalities": ["TEXT", "IMAGE"] },
        "safetySettings": build_safety_settings(),
    });

    let model = &CONFIG.gemini_image_model;
    let response = call_gemini_api(model, payload)
        .await
        .map_err(|err| ImageGenerationError(err.to_string()))?;

    let images = extract_images_from_response(response);
    if images.is_empty() {
        return Err(ImageGenerationError(format!(
            "No images returned by Gemini (model: {model})"
        )));
    }

    Ok(images)
}

pub async fn generate_video(prompt: &str) -> Result<Option<Vec<u8>>> {
    warn!("Video generation is a stub; no provider is wired up yet.");
    let _ = prompt;
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_png_is_a_valid_png_header() {
        assert_eq!(&MOCK_PNG[..8], b"\x89PNG\r\n\x1a\n");
        assert_eq!(infer::get(MOCK_PNG).map(|kind| kind.mime_type()), Some("image/png"));
    }

    #[test]
    fn error_body_summary_prefers_the_api_message() {
        let (message, _summary) =
            summarize_error_body(r#"{"error": {"message": "quota exhausted"}}"#);
        assert_eq!(message.as_deref(), Some("quota exhausted"));

        let (message, summary) = summarize_error_body("plain failure");
        assert!(message.is_none());
        assert_eq!(summary, "plain failure");
    }

    #[test]
    fn text_extraction_joins_candidate_parts() {
        let response = GeminiResponse {
            candidates: Some(vec![GeminiCandidate {
                content: Some(GeminiContent {
                    parts: Some(vec![
                        GeminiPart::Text {
                            text: "first".to_string(),
                        },
                        GeminiPart::Text {
                            text: "second".to_string(),
                        },
                    ]),
                }),
            }]),
        };
        assert_eq!(extract_text_from_response(response), "first\nsecond");
    }
}
