//! In-process collaborators for unit tests.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bidwatch_adapters::{
    AdapterError, Enricher, Messenger, NoticeSource, OutboundFile, RenderRequest, Renderer,
};
use bidwatch_core::{AlarmRecord, ChatId, MessageId, Notice};
use chrono::{NaiveDate, NaiveDateTime};

pub fn notice(url: &str, title: &str) -> Notice {
    Notice {
        notice_time: NaiveDateTime::parse_from_str("2026-03-01 09:30:00", "%Y-%m-%d %H:%M:%S")
            .unwrap(),
        tender_code: format!("ZB-{url}"),
        title: title.to_string(),
        short_title: String::new(),
        content: format!("{title} 正文"),
        url: url.to_string(),
        matched_by: None,
    }
}

pub fn alarm(chat_id: ChatId, code: &str) -> AlarmRecord {
    AlarmRecord {
        chat_id,
        credit_name: format!("主体 {code}"),
        credit_code: code.to_string(),
        business_id: format!("biz-{code}"),
        start_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        end_date: None,
        reason: "违约".into(),
        department: "某局".into(),
        result: "限制投标".into(),
        penalty_notice_id: format!("pen-{code}"),
        detail_notice_id: format!("det-{code}"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text { chat_id: ChatId, text: String },
    Document { chat_id: ChatId, file_name: String, caption: String, reply_to: Option<MessageId> },
    Photo { chat_id: ChatId, file_name: String, caption: String, reply_to: Option<MessageId> },
    Deleted { chat_id: ChatId, message_id: MessageId },
}

/// Records every call. Text sends containing `fail_marker` fail.
#[derive(Debug, Default)]
pub struct RecordingMessenger {
    log: Mutex<Vec<Sent>>,
    next_id: AtomicI64,
    fail_marker: Option<String>,
}

impl RecordingMessenger {
    pub fn failing_on(marker: &str) -> Self {
        Self {
            fail_marker: Some(marker.to_string()),
            ..Self::default()
        }
    }

    pub fn log(&self) -> Vec<Sent> {
        self.log.lock().unwrap().clone()
    }

    pub fn texts_for(&self, chat_id: ChatId) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text { chat_id: c, text } if c == chat_id => Some(text),
                _ => None,
            })
            .collect()
    }

    fn push(&self, sent: Sent) -> MessageId {
        self.log.lock().unwrap().push(sent);
        self.next_id.fetch_add(1, Ordering::SeqCst) + 100
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageId, AdapterError> {
        if self.fail_marker.as_deref().is_some_and(|m| text.contains(m)) {
            return Err(AdapterError::Api {
                method: "sendMessage".into(),
                description: "scripted failure".into(),
            });
        }
        Ok(self.push(Sent::Text {
            chat_id,
            text: text.to_string(),
        }))
    }

    async fn send_document(
        &self,
        chat_id: ChatId,
        file: OutboundFile,
        caption: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, AdapterError> {
        Ok(self.push(Sent::Document {
            chat_id,
            file_name: file.file_name,
            caption: caption.to_string(),
            reply_to,
        }))
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        file: OutboundFile,
        caption: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, AdapterError> {
        Ok(self.push(Sent::Photo {
            chat_id,
            file_name: file.file_name,
            caption: caption.to_string(),
            reply_to,
        }))
    }

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), AdapterError> {
        self.push(Sent::Deleted { chat_id, message_id });
        Ok(())
    }
}

#[derive(Debug)]
pub struct ScriptedEnricher {
    reply: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedEnricher {
    pub fn ok(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Enricher for ScriptedEnricher {
    async fn enrich(&self, _content: &str) -> Result<String, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply
            .clone()
            .ok_or_else(|| AdapterError::Message("scripted enrichment failure".into()))
    }
}

#[derive(Debug, Default)]
pub struct StaticSource {
    pub notices: Vec<Notice>,
    pub alarms: Vec<AlarmRecord>,
    /// Every alarm crawl waits here before answering.
    pub alarm_barrier: Option<Arc<tokio::sync::Barrier>>,
}

#[async_trait]
impl NoticeSource for StaticSource {
    async fn fetch_notices(&self, _since_days: u32) -> Result<Vec<Notice>, AdapterError> {
        Ok(self.notices.clone())
    }

    async fn fetch_alarms(
        &self,
        _keywords: &[String],
        chat_id: ChatId,
    ) -> Result<Vec<AlarmRecord>, AdapterError> {
        if let Some(barrier) = &self.alarm_barrier {
            barrier.wait().await;
        }
        Ok(self
            .alarms
            .iter()
            .cloned()
            .map(|mut a| {
                a.chat_id = chat_id;
                a
            })
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct RecordingRenderer {
    pub requests: Mutex<Vec<RenderRequest>>,
    pub fail: bool,
}

#[async_trait]
impl Renderer for RecordingRenderer {
    async fn request_render(&self, request: &RenderRequest) -> Result<(), AdapterError> {
        if self.fail {
            return Err(AdapterError::Message("render service down".into()));
        }
        self.requests.lock().unwrap().push(request.clone());
        Ok(())
    }
}
