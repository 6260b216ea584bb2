//! Boundary adapters: portal crawler, chat transport, enrichment and render clients.

use std::collections::HashSet;

use async_trait::async_trait;
use bidwatch_core::{AlarmRecord, ArtifactKind, ChatId, MessageId, Notice};
use bidwatch_storage::{FetchError, HttpFetcher};
use chrono::{NaiveDate, NaiveDateTime};
use reqwest::multipart::{Form, Part};
use scraper::Html;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "bidwatch-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{method} rejected: {description}")]
    Api { method: String, description: String },
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Fetch(err) if err.is_transient())
    }
}

/// Crawler boundary. An empty result means nothing new this cycle.
#[async_trait]
pub trait NoticeSource: Send + Sync {
    async fn fetch_notices(&self, since_days: u32) -> Result<Vec<Notice>, AdapterError>;

    async fn fetch_alarms(
        &self,
        keywords: &[String],
        chat_id: ChatId,
    ) -> Result<Vec<AlarmRecord>, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Messaging transport boundary.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageId, AdapterError>;

    async fn send_document(
        &self,
        chat_id: ChatId,
        file: OutboundFile,
        caption: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, AdapterError>;

    async fn send_photo(
        &self,
        chat_id: ChatId,
        file: OutboundFile,
        caption: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, AdapterError>;

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), AdapterError>;
}

/// Quota-constrained content rewrite. Only call after the rate gate admits.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, content: &str) -> Result<String, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderRequest {
    pub request_id: String,
    pub source_url: String,
    pub kind: ArtifactKind,
    /// Where the render service POSTs the finished artifact.
    pub webhook_url: String,
}

/// Out-of-process document renderer; completion arrives later on the webhook.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn request_render(&self, request: &RenderRequest) -> Result<(), AdapterError>;
}

/// Plain text from a notice HTML fragment, one trimmed text run per line.
pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    fragment
        .root_element()
        .text()
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Portal dates use empty strings, `0` or zeroed dates for "no end date".
pub fn parse_optional_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() || value == "0" || value == "-" || value.starts_with("0000") {
        return None;
    }
    parse_date(value)
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    let head = value.trim().get(..10).unwrap_or(value.trim());
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(head, "%Y/%m/%d"))
        .ok()
}

fn parse_notice_time(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M"))
        .ok()
        .or_else(|| parse_date(value).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

#[derive(Debug, Clone, Deserialize)]
struct PortalEnvelope<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalNotice {
    pub publish_time: String,
    #[serde(default)]
    pub code: String,
    pub title: String,
    #[serde(default)]
    pub short_title: String,
    #[serde(default)]
    pub content: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalAlarm {
    pub credit_name: String,
    pub credit_code: String,
    #[serde(default)]
    pub business_id: String,
    pub start_date: String,
    #[serde(default)]
    pub end_date: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub penalty_notice_id: String,
    #[serde(default)]
    pub detail_notice_id: String,
}

pub fn notice_from_portal(raw: PortalNotice) -> Option<Notice> {
    let Some(notice_time) = parse_notice_time(&raw.publish_time) else {
        warn!(url = %raw.url, publish_time = %raw.publish_time, "skipping notice with unparseable time");
        return None;
    };
    let short_title = if raw.short_title.trim().is_empty() {
        raw.title.clone()
    } else {
        raw.short_title
    };
    Some(Notice {
        notice_time,
        tender_code: raw.code.trim().to_string(),
        title: raw.title.trim().to_string(),
        short_title: short_title.trim().to_string(),
        content: html_to_text(&raw.content),
        url: raw.url,
        matched_by: None,
    })
}

pub fn alarm_from_portal(raw: PortalAlarm, chat_id: ChatId) -> Option<AlarmRecord> {
    let Some(start_date) = parse_date(&raw.start_date) else {
        warn!(credit_code = %raw.credit_code, start = %raw.start_date, "skipping alarm with unparseable start date");
        return None;
    };
    Some(AlarmRecord {
        chat_id,
        credit_name: raw.credit_name.trim().to_string(),
        credit_code: raw.credit_code.trim().to_string(),
        business_id: raw.business_id,
        start_date,
        end_date: parse_optional_date(&raw.end_date),
        reason: raw.reason,
        department: raw.department,
        result: raw.result,
        penalty_notice_id: raw.penalty_notice_id,
        detail_notice_id: raw.detail_notice_id,
    })
}

/// JSON listing client for the procurement portal.
#[derive(Debug, Clone)]
pub struct PortalCrawler {
    http: HttpFetcher,
    base_url: String,
}

impl PortalCrawler {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Deep link to a portal notice by id, used in alarm messages.
    pub fn notice_link(base_url: &str, notice_id: &str) -> String {
        format!("{}/notice/{}", base_url.trim_end_matches('/'), notice_id)
    }
}

#[async_trait]
impl NoticeSource for PortalCrawler {
    async fn fetch_notices(&self, since_days: u32) -> Result<Vec<Notice>, AdapterError> {
        let url = format!("{}/api/notices", self.base_url);
        let envelope: PortalEnvelope<PortalNotice> = self
            .http
            .get_json("portal_notices", &url, &[("days", since_days.to_string())])
            .await?;
        Ok(envelope
            .data
            .into_iter()
            .filter_map(notice_from_portal)
            .collect())
    }

    async fn fetch_alarms(
        &self,
        keywords: &[String],
        chat_id: ChatId,
    ) -> Result<Vec<AlarmRecord>, AdapterError> {
        let url = format!("{}/api/alarms", self.base_url);
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for keyword in keywords {
            let envelope: PortalEnvelope<PortalAlarm> = match self
                .http
                .get_json("portal_alarms", &url, &[("keyword", keyword.clone())])
                .await
            {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(chat_id, keyword = %keyword, error = %err, "alarm fetch failed");
                    continue;
                }
            };
            for alarm in envelope
                .data
                .into_iter()
                .filter_map(|raw| alarm_from_portal(raw, chat_id))
            {
                if seen.insert(alarm.credit_code.clone()) {
                    out.push(alarm);
                }
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

impl<T> TelegramResponse<T> {
    fn into_result(self, method: &str) -> Result<T, AdapterError> {
        match (self.ok, self.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(AdapterError::Api {
                method: method.to_string(),
                description: self.description.unwrap_or_else(|| "no result".to_string()),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: MessageId,
}

/// Telegram Bot API transport.
#[derive(Debug, Clone)]
pub struct TelegramMessenger {
    http: HttpFetcher,
    api_base: String,
    token: String,
}

impl TelegramMessenger {
    /// Telegram rejects text messages longer than this.
    pub const MAX_MESSAGE_BYTES: usize = 4096;

    pub fn new(http: HttpFetcher, api_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, AdapterError> {
        let request = self.http.client().post(self.method_url(method)).json(body);
        let response: TelegramResponse<T> = self.http.send(method, request).await?.json()?;
        response.into_result(method)
    }

    async fn send_file(
        &self,
        method: &str,
        field: &'static str,
        chat_id: ChatId,
        file: OutboundFile,
        caption: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, AdapterError> {
        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part(field, Part::bytes(file.bytes).file_name(file.file_name));
        if let Some(reply_to) = reply_to {
            form = form.text("reply_to_message_id", reply_to.to_string());
        }
        let request = self.http.client().post(self.method_url(method)).multipart(form);
        let response: TelegramResponse<TelegramMessage> = self.http.send(method, request).await?.json()?;
        Ok(response.into_result(method)?.message_id)
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageId, AdapterError> {
        let message: TelegramMessage = self
            .call_json(
                "sendMessage",
                &serde_json::json!({
                    "chat_id": chat_id,
                    "text": text,
                    "disable_web_page_preview": true,
                }),
            )
            .await?;
        Ok(message.message_id)
    }

    async fn send_document(
        &self,
        chat_id: ChatId,
        file: OutboundFile,
        caption: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, AdapterError> {
        self.send_file("sendDocument", "document", chat_id, file, caption, reply_to)
            .await
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        file: OutboundFile,
        caption: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, AdapterError> {
        self.send_file("sendPhoto", "photo", chat_id, file, caption, reply_to)
            .await
    }

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), AdapterError> {
        let _deleted: bool = self
            .call_json(
                "deleteMessage",
                &serde_json::json!({ "chat_id": chat_id, "message_id": message_id }),
            )
            .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct EnrichResponse {
    content: String,
}

/// HTTP client for the content rewrite service.
#[derive(Debug, Clone)]
pub struct HttpEnricher {
    http: HttpFetcher,
    url: String,
    api_key: Option<String>,
}

impl HttpEnricher {
    pub fn new(http: HttpFetcher, url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            url: url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl Enricher for HttpEnricher {
    async fn enrich(&self, content: &str) -> Result<String, AdapterError> {
        let mut request = self
            .http
            .client()
            .post(&self.url)
            .json(&serde_json::json!({ "content": content }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response: EnrichResponse = self.http.send("enrich", request).await?.json()?;
        let rewritten = response.content.trim();
        if rewritten.is_empty() {
            return Err(AdapterError::Message("enrichment returned empty content".into()));
        }
        Ok(rewritten.to_string())
    }
}

/// HTTP client for the asynchronous document renderer.
#[derive(Debug, Clone)]
pub struct HttpRenderer {
    http: HttpFetcher,
    url: String,
}

impl HttpRenderer {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn request_render(&self, request: &RenderRequest) -> Result<(), AdapterError> {
        let format = match request.kind {
            ArtifactKind::Document => "pdf",
            ArtifactKind::Image => "png",
        };
        let body = serde_json::json!({
            "request_id": request.request_id,
            "url": request.source_url,
            "format": format,
            "webhook": request.webhook_url,
        });
        self.http
            .send("render", self.http.client().post(&self.url).json(&body))
            .await?;
        Ok(())
    }
}
