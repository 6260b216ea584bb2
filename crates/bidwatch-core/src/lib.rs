//! Core domain model and keyword rule engine for bidwatch.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidwatch-core";

/// Chat identifier of a subscriber on the messaging transport.
pub type ChatId = i64;

/// Message identifier assigned by the messaging transport.
pub type MessageId = i64;

/// Compiled include/exclude keyword expression.
///
/// Terms are lower-cased at compile time and kept sorted, so [`Rule::describe`]
/// renders identically on every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    include: BTreeSet<String>,
    exclude: BTreeSet<String>,
}

impl Rule {
    /// Compile a space-separated expression. `-term` excludes, `term` or `+term` includes.
    pub fn compile(id: i64, expression: &str) -> Self {
        let mut include = BTreeSet::new();
        let mut exclude = BTreeSet::new();
        for token in expression.split_whitespace() {
            if let Some(term) = token.strip_prefix('-') {
                if !term.is_empty() {
                    exclude.insert(term.to_lowercase());
                }
            } else {
                let term = token.strip_prefix('+').unwrap_or(token);
                if !term.is_empty() {
                    include.insert(term.to_lowercase());
                }
            }
        }
        Self {
            id,
            include,
            exclude,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn include_terms(&self) -> impl Iterator<Item = &str> {
        self.include.iter().map(String::as_str)
    }

    pub fn exclude_terms(&self) -> impl Iterator<Item = &str> {
        self.exclude.iter().map(String::as_str)
    }

    /// Case-insensitive substring match. An empty rule matches everything.
    pub fn matches(&self, text: &str) -> bool {
        if self.is_empty() {
            return true;
        }
        let text = text.to_lowercase();
        if self.exclude.iter().any(|term| text.contains(term.as_str())) {
            return false;
        }
        self.include.iter().all(|term| text.contains(term.as_str()))
    }

    /// Render as `+a +b -c`, includes first, each group sorted.
    pub fn describe(&self) -> String {
        self.include
            .iter()
            .map(|t| format!("+{t}"))
            .chain(self.exclude.iter().map(|t| format!("-{t}")))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// One crawled procurement listing. Lives for a single crawl cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub notice_time: NaiveDateTime,
    pub tender_code: String,
    pub title: String,
    pub short_title: String,
    pub content: String,
    pub url: String,
    #[serde(default)]
    pub matched_by: Option<String>,
}

impl Notice {
    /// Text the rule engine is evaluated against.
    pub fn match_text(&self) -> String {
        format!("{}\n{}\n{}", self.title, self.short_title, self.tender_code)
    }
}

/// Credit-blacklist entry matched against a subscriber's alarm keywords.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmRecord {
    pub chat_id: ChatId,
    pub credit_name: String,
    pub credit_code: String,
    pub business_id: String,
    pub start_date: NaiveDate,
    /// `None` means the record never lapses.
    pub end_date: Option<NaiveDate>,
    pub reason: String,
    pub department: String,
    pub result: String,
    pub penalty_notice_id: String,
    pub detail_notice_id: String,
}

impl AlarmRecord {
    pub fn is_expired_on(&self, today: NaiveDate) -> bool {
        matches!(self.end_date, Some(end) if end < today)
    }

    pub fn validity_label(&self) -> String {
        match self.end_date {
            Some(end) => format!("{} ~ {}", self.start_date, end),
            None => format!("{} ~ 长期", self.start_date),
        }
    }
}

/// Dedup marker: `(chat_id, url)` was already delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub chat_id: ChatId,
    pub url: String,
    pub title: String,
    pub seen_at: DateTime<Utc>,
}

/// Per-subscriber configuration snapshot for one crawl cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubscriberConfig {
    pub chat_id: ChatId,
    pub rules: Vec<Rule>,
    pub alarm_keywords: Vec<String>,
}

impl SubscriberConfig {
    pub fn has_work(&self) -> bool {
        !self.rules.is_empty() || !self.alarm_keywords.is_empty()
    }
}

/// One unit of fan-out work: everything a single subscriber's delivery needs.
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub chat_id: ChatId,
    pub rules: Vec<Rule>,
    pub notices: Arc<Vec<Notice>>,
    pub alarm_keywords: Vec<String>,
    pub alarms: Vec<AlarmRecord>,
    /// Bypass the history dedup check.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Document,
    Image,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Image => "image",
        }
    }

    pub fn file_name(&self, request_id: &str) -> String {
        match self {
            Self::Document => format!("{request_id}.pdf"),
            Self::Image => format!("{request_id}.png"),
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "document" | "pdf" => Ok(Self::Document),
            "image" | "png" | "photo" => Ok(Self::Image),
            other => Err(format!("unknown artifact kind: {other}")),
        }
    }
}

/// State parked in the correlation store until the render webhook fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCallback {
    pub chat_id: ChatId,
    /// "processing" placeholder to delete once the artifact arrives.
    pub placeholder_message_id: Option<MessageId>,
    pub reply_to: Option<MessageId>,
    pub kind: ArtifactKind,
    pub caption: String,
}

pub fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}
