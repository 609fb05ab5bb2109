
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::config::OcrConfig;
use crate::document::ParsedDocument;
use crate::net;
use crate::{RagError, Result};

/// Turns raw document bytes into a structured [`ParsedDocument`].
///
/// The seam between the ingestion flow and the OCR collaborator; tests
/// substitute a deterministic implementation.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, document_name: &str, content: &[u8]) -> Result<ParsedDocument>;
}

/// Client for a Mistral-compatible OCR endpoint.
#[derive(Debug, Clone)]
pub struct OcrClient {
    base_url: Url,
    api_key: String,
    model: String,
    agent: ureq::Agent,
    retry_attempts: u32,
}

#[derive(Debug, Serialize)]
struct OcrRequest {
    model: String,
    document: OcrDocumentRef,
    include_image_base64: bool,
}

#[derive(Debug, Serialize)]
struct OcrDocumentRef {
    #[serde(rename = "type")]
    kind: String,
    document_url: String,
}

/// OCR response: one entry per page, in document order.
#[derive(Debug, Clone, Deserialize)]
pub struct OcrResponse {
    pub pages: Vec<OcrPage>,
    pub model: String,
    #[serde(default)]
    pub usage_info: Option<OcrUsageInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OcrPage {
    /// 0-based page number
    pub index: u32,
    /// Extracted markdown content
    pub markdown: String,
    #[serde(default)]
    pub dimensions: Option<PageDimensions>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageDimensions {
    pub dpi: Option<u32>,
    pub height: Option<u32>,
    pub width: Option<u32>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct OcrUsageInfo {
    pub pages_processed: u32,
    #[serde(default)]
    pub doc_size_bytes: Option<u64>,
}

impl OcrClient {
    #[inline]
    pub fn new(config: &OcrConfig) -> Result<Self> {
        let base_url = config
            .url()
            .map_err(|e| RagError::Config(e.to_string()))?;

        debug!("Initialized OCR client with model: {}", config.model);

        Ok(Self {
            base_url,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            agent: net::agent(),
            retry_attempts: net::DEFAULT_RETRY_ATTEMPTS,
        })
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = net::agent_with_timeout(timeout);
        self
    }

    #[inline]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Run OCR over a PDF byte stream and return the per-page output.
    #[inline]
    pub fn process_pdf(&self, content: &[u8]) -> Result<OcrResponse> {
        let url = self
            .base_url
            .join("/v1/ocr")
            .map_err(|e| RagError::Parsing(format!("Failed to build OCR URL: {}", e)))?;

        let request = OcrRequest {
            model: self.model.clone(),
            document: OcrDocumentRef {
                kind: "document_url".to_string(),
                document_url: format!(
                    "data:application/pdf;base64,{}",
                    BASE64.encode(content)
                ),
            },
            include_image_base64: false,
        };

        let request_json = serde_json::to_string(&request)
            .map_err(|e| RagError::Parsing(format!("Failed to serialize OCR request: {}", e)))?;

        debug!("Calling OCR API (model: {})", self.model);

        let response_text = net::request_with_retry(url.as_str(), self.retry_attempts, || {
            self.agent
                .post(url.as_str())
                .header("Authorization", &format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .send(&request_json)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })
        .map_err(|e| RagError::Parsing(format!("OCR API call failed: {}", e)))?;

        let response: OcrResponse = serde_json::from_str(&response_text)
            .map_err(|e| RagError::Parsing(format!("Invalid OCR response format: {}", e)))?;

        Ok(response)
    }
}

impl DocumentParser for OcrClient {
    #[inline]
    fn parse(&self, document_name: &str, content: &[u8]) -> Result<ParsedDocument> {
        if content.is_empty() {
            return Err(RagError::Parsing("Empty document content".to_string()));
        }

        if !content.starts_with(b"%PDF") {
            return Err(RagError::Parsing(format!(
                "Not a PDF document: {}",
                document_name
            )));
        }

        info!("Parsing PDF: {}", document_name);

        let response = self.process_pdf(content)?;

        // Page order in the response is trusted as document order.
        let page_texts: Vec<String> = response.pages.iter().map(|p| p.markdown.clone()).collect();
        let doc = ParsedDocument::from_page_texts(document_name, &page_texts);

        info!(
            "Parsed {}: {} sections, {} characters, {} pages",
            document_name,
            doc.sections.len(),
            doc.text.len(),
            doc.page_boundaries.len()
        );

        Ok(doc)
    }
}
