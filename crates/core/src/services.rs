use crate::error::PipelineError;
use crate::language::Language;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// One page handed to the OCR engine.
#[derive(Debug, Clone, Copy)]
pub struct OcrRequest<'a> {
    pub source: &'a str,
    pub pdf: &'a [u8],
    /// Page to read inside `pdf`.
    pub pdf_page: u32,
    /// Page of the source document, for logs.
    pub page_number: u32,
    pub language: &'a str,
}

pub trait OcrEngine: Send + Sync {
    fn recognize(&self, request: OcrRequest<'_>) -> Result<String, PipelineError>;
}

pub trait Translator: Send + Sync {
    fn translate(
        &self,
        text: &str,
        source: &Language,
        target: &Language,
    ) -> Result<String, PipelineError>;
}

pub trait Summarizer: Send + Sync {
    fn summarize(&self, text: &str, max_words: usize) -> Result<String, PipelineError>;
}

pub trait Answerer: Send + Sync {
    fn answer(&self, model: &str, prompt: &str) -> Result<String, PipelineError>;
}

/// Used when no OCR endpoint is configured; image-only pages stay empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOcr;

impl OcrEngine for NoOcr {
    fn recognize(&self, _request: OcrRequest<'_>) -> Result<String, PipelineError> {
        Ok(String::new())
    }
}

/// Used when no translation endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughTranslator;

impl Translator for PassthroughTranslator {
    fn translate(
        &self,
        text: &str,
        _source: &Language,
        _target: &Language,
    ) -> Result<String, PipelineError> {
        Ok(text.to_string())
    }
}

/// Extractive fallback: the leading words of the text.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeadSummarizer;

impl Summarizer for LeadSummarizer {
    fn summarize(&self, text: &str, max_words: usize) -> Result<String, PipelineError> {
        Ok(truncate_words(text, max_words))
    }
}

pub fn truncate_words(text: &str, max_words: usize) -> String {
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) struct LazyClient {
    timeout: Duration,
    cell: OnceLock<Client>,
}

impl LazyClient {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cell: OnceLock::new(),
        }
    }

    fn get(&self) -> Result<&Client, PipelineError> {
        if let Some(client) = self.cell.get() {
            return Ok(client);
        }

        let client = Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("polyrag/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let _ = self.cell.set(client);
        self.cell
            .get()
            .ok_or_else(|| PipelineError::Task("http client initialization raced".to_string()))
    }
}

pub(crate) fn post_json<T: Serialize, R: for<'de> Deserialize<'de>>(
    client: &LazyClient,
    service: &str,
    endpoint: &Url,
    api_key: Option<&str>,
    payload: &T,
) -> Result<R, PipelineError> {
    let mut request = client.get()?.post(endpoint.clone()).json(payload);
    if let Some(api_key) = api_key {
        request = request.bearer_auth(api_key);
    }

    let response = request
        .send()
        .map_err(|error| PipelineError::external(service, error))?;

    if !response.status().is_success() {
        return Err(PipelineError::external(
            service,
            format!("request to {endpoint} returned {}", response.status()),
        ));
    }

    response
        .json()
        .map_err(|error| PipelineError::external(service, format!("malformed response: {error}")))
}

#[derive(Debug, Clone, Serialize)]
struct OcrPayload<'a> {
    pdf_base64: String,
    source_path: &'a str,
    page: u32,
    language: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrResponse {
    pages: Option<Vec<OcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

/// OCR engine behind an HTTP endpoint that accepts a base64 PDF plus the page to read.
pub struct HttpOcrEngine {
    endpoint: Url,
    api_key: Option<String>,
    client: LazyClient,
}

impl HttpOcrEngine {
    pub fn new(endpoint: &str, api_key: Option<String>) -> Result<Self, PipelineError> {
        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            api_key,
            client: LazyClient::new(DEFAULT_REQUEST_TIMEOUT),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = LazyClient::new(timeout);
        self
    }
}

impl OcrEngine for HttpOcrEngine {
    fn recognize(&self, request: OcrRequest<'_>) -> Result<String, PipelineError> {
        let payload = OcrPayload {
            pdf_base64: STANDARD.encode(request.pdf),
            source_path: request.source,
            page: request.pdf_page,
            language: request.language,
        };

        let response: OcrResponse = post_json(
            &self.client,
            "ocr",
            &self.endpoint,
            self.api_key.as_deref(),
            &payload,
        )?;

        Ok(page_text_from_response(&response, request.pdf_page))
    }
}

fn page_text_from_response(response: &OcrResponse, page_number: u32) -> String {
    if let Some(pages) = &response.pages {
        let listed = pages
            .iter()
            .find(|page| page.page.unwrap_or(1) == page_number)
            .or_else(|| if pages.len() == 1 { pages.first() } else { None })
            .and_then(|page| page.text.as_deref());
        if let Some(text) = listed {
            return text.trim().to_string();
        }
    }

    response
        .text
        .as_deref()
        .map(|text| {
            let sections: Vec<&str> = text.split('\u{000c}').collect();
            if sections.len() > 1 {
                sections
                    .get(page_number.saturating_sub(1) as usize)
                    .copied()
                    .unwrap_or_default()
            } else {
                text
            }
        })
        .unwrap_or_default()
        .trim()
        .to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct TextResponse {
    text: String,
}

/// Translation model behind an HTTP endpoint (`{text, source_lang, target_lang}` -> `{text}`).
pub struct HttpTranslator {
    endpoint: Url,
    api_key: Option<String>,
    client: LazyClient,
}

impl HttpTranslator {
    pub fn new(endpoint: &str, api_key: Option<String>) -> Result<Self, PipelineError> {
        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            api_key,
            client: LazyClient::new(DEFAULT_REQUEST_TIMEOUT),
        })
    }
}

impl Translator for HttpTranslator {
    fn translate(
        &self,
        text: &str,
        source: &Language,
        target: &Language,
    ) -> Result<String, PipelineError> {
        let payload = json!({
            "text": text,
            "source_lang": source.translation_code,
            "target_lang": target.translation_code,
        });
        let response: TextResponse = post_json(
            &self.client,
            "translation",
            &self.endpoint,
            self.api_key.as_deref(),
            &payload,
        )?;
        Ok(response.text.trim().to_string())
    }
}

/// Summarization model behind an HTTP endpoint (`{text, max_words}` -> `{text}`).
pub struct HttpSummarizer {
    endpoint: Url,
    api_key: Option<String>,
    client: LazyClient,
}

impl HttpSummarizer {
    pub fn new(endpoint: &str, api_key: Option<String>) -> Result<Self, PipelineError> {
        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            api_key,
            client: LazyClient::new(DEFAULT_REQUEST_TIMEOUT),
        })
    }
}

impl Summarizer for HttpSummarizer {
    fn summarize(&self, text: &str, max_words: usize) -> Result<String, PipelineError> {
        let payload = json!({ "text": text, "max_words": max_words });
        let response: TextResponse = post_json(
            &self.client,
            "summarization",
            &self.endpoint,
            self.api_key.as_deref(),
            &payload,
        )?;
        Ok(truncate_words(&response.text, max_words))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Answering model served by Ollama's chat endpoint.
pub struct OllamaAnswerer {
    endpoint: Url,
    client: LazyClient,
}

impl OllamaAnswerer {
    pub fn new(base_url: &str) -> Result<Self, PipelineError> {
        let base = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))?;
        Ok(Self {
            endpoint: base.join("api/chat")?,
            client: LazyClient::new(DEFAULT_REQUEST_TIMEOUT),
        })
    }
}

impl Answerer for OllamaAnswerer {
    fn answer(&self, model: &str, prompt: &str) -> Result<String, PipelineError> {
        let payload = json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": false,
        });
        let response: ChatResponse = post_json(&self.client, "answering", &self.endpoint, None, &payload)?;
        Ok(response.message.content.trim().to_string())
    }
}

/// Prompt sent to the answering model for a question and its retrieved context.
pub fn answer_prompt(context: &[String], question: &str) -> String {
    format!(
        "Answer the question based on the context below:\n\n{}\n\nQuestion: {question}",
        context.join(" ")
    )
}
