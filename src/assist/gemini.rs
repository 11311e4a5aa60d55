//! Google Gemini `generateContent` client

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::AnalysisClient;
use crate::error::AssistError;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiClient {
    api_key: Option<String>,
    model: String,
    base_url: String,
    client: Client,
}

impl GeminiClient {
    pub fn new(api_key: Option<String>, model: String, base_url: String) -> Self {
        Self {
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

/// Join the text parts of the first candidate
fn extract_text(body: &str) -> Result<String, AssistError> {
    let response: GenerateResponse =
        serde_json::from_str(body).map_err(|e| AssistError::Malformed(e.to_string()))?;

    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(AssistError::Malformed("response has no text".to_string()));
    }
    Ok(text)
}

#[async_trait]
impl AnalysisClient for GeminiClient {
    async fn analyze(&self, prompt: &str) -> Result<String, AssistError> {
        let api_key = self.api_key.as_deref().ok_or(AssistError::MissingApiKey)?;
        let payload = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![RequestPart { text: prompt }],
            }],
        };

        tracing::debug!(model = %self.model, "Sending analysis request");
        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", api_key)])
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AssistError::Status {
                status: status.as_u16(),
                body,
            });
        }

        extract_text(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_joins_parts() {
        let body = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Run "}, {"text": "`ls -a`."}]},
                "finishReason": "STOP"
            }]
        }"#;
        assert_eq!(extract_text(body).unwrap(), "Run `ls -a`.");
    }

    #[test]
    fn test_extract_text_rejects_empty_and_garbage() {
        assert!(matches!(
            extract_text(r#"{"candidates": []}"#),
            Err(AssistError::Malformed(_))
        ));
        assert!(matches!(
            extract_text("<html>bad gateway</html>"),
            Err(AssistError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_without_network() {
        let client = GeminiClient::new(None, "gemini-1.5-flash".into(), DEFAULT_BASE_URL.into());
        assert!(matches!(
            client.analyze("hi").await,
            Err(AssistError::MissingApiKey)
        ));
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let client = GeminiClient::new(None, "m".into(), "http://localhost:9/v1/".into());
        assert_eq!(client.endpoint(), "http://localhost:9/v1/models/m:generateContent");
    }
}
