use std::path::Path;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use super::{
    Capabilities, CandidateExtraction, ErrorKind, ExtractionOptions, Extractor, Precision, Speed,
};

const REMOTE_CONFIDENCE: f32 = 0.80;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Adapter for a hosted OCR service. The document travels as a base64 data
/// URL; the service answers with per-page Markdown.
#[derive(Debug)]
pub struct RemoteOcrExtractor {
    endpoint: Url,
    model: String,
    api_key_env: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    pages: Vec<OcrPage>,
}

#[derive(Debug, Deserialize)]
struct OcrPage {
    index: u32,
    markdown: String,
}

impl RemoteOcrExtractor {
    pub fn new(endpoint: Url, model: impl Into<String>, api_key_env: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            endpoint,
            model: model.into(),
            api_key_env: api_key_env.into(),
            client,
        }
    }

    fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }

    fn join_pages(mut pages: Vec<OcrPage>) -> String {
        pages.sort_by_key(|page| page.index);
        let mut out = String::new();
        for page in pages {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(page.markdown.trim_end());
        }
        out
    }
}

#[async_trait::async_trait]
impl Extractor for RemoteOcrExtractor {
    fn name(&self) -> &str {
        "remote-ocr"
    }

    fn version(&self) -> &str {
        &self.model
    }

    fn priority(&self) -> u8 {
        3
    }

    fn is_local(&self) -> bool {
        false
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_tables: true,
            supports_formulas: false,
            supports_images: false,
            supports_ocr: true,
            precision: Precision::Medium,
            speed: Speed::Fast,
        }
    }

    fn is_available(&self) -> bool {
        self.api_key().is_some()
    }

    async fn extract(&self, file_path: &Path, options: &ExtractionOptions) -> CandidateExtraction {
        let started = Instant::now();

        let Some(api_key) = self.api_key() else {
            return CandidateExtraction::failure(
                self.name(),
                self.version(),
                ErrorKind::ExtractorUnavailable,
                format!("environment variable {} is not set", self.api_key_env),
            );
        };

        let bytes = match tokio::fs::read(file_path).await {
            Ok(bytes) => bytes,
            Err(source) => {
                return CandidateExtraction::failure(
                    self.name(),
                    self.version(),
                    ErrorKind::ExtractorError,
                    format!("failed to read {}: {source}", file_path.display()),
                );
            }
        };

        let body = json!({
            "model": self.model,
            "document": {
                "type": "document_url",
                "document_url": format!(
                    "data:application/pdf;base64,{}",
                    BASE64_STANDARD.encode(&bytes)
                ),
            },
            "include_tables": options.extract_tables,
            "languages": options.ocr_languages,
        });

        let response = match self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(source) => {
                return CandidateExtraction::failure(
                    self.name(),
                    self.version(),
                    ErrorKind::ExtractorError,
                    format!("OCR request failed: {source}"),
                );
            }
        };

        if !response.status().is_success() {
            return CandidateExtraction::failure(
                self.name(),
                self.version(),
                ErrorKind::ExtractorError,
                format!("OCR service answered {}", response.status()),
            );
        }

        let parsed: OcrResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(source) => {
                return CandidateExtraction::failure(
                    self.name(),
                    self.version(),
                    ErrorKind::ExtractorError,
                    format!("malformed OCR response: {source}"),
                );
            }
        };

        let page_count = parsed.pages.len() as u32;
        CandidateExtraction {
            extractor_name: self.name().to_string(),
            extractor_version: self.version().to_string(),
            markdown: Self::join_pages(parsed.pages),
            blocks: Vec::new(),
            tables: Vec::new(),
            images: Vec::new(),
            confidence: REMOTE_CONFIDENCE,
            elapsed_ms: started.elapsed().as_millis() as u64,
            page_count,
            success: true,
            error_kind: None,
            error_message: None,
        }
    }
}
