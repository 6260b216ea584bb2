//! Per-subscriber delivery: filter, send, alarm check, persist.

use std::collections::BTreeMap;
use std::sync::Arc;

use askama::Template;
use async_trait::async_trait;
use bidwatch_adapters::{Enricher, Messenger, PortalCrawler};
use bidwatch_core::{AlarmRecord, ChatId, DeliveryJob, HistoryRecord, Notice, Rule};
use bidwatch_storage::{Admission, DeliveryStore, RateGate};
use chrono::{Local, Utc};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::dispatcher::JobHandler;

/// Characters kept by [`fallback_summary`].
pub const FALLBACK_SUMMARY_CHARS: usize = 300;

/// Smallest usable chunk size: one char of any width fits.
pub const MIN_MESSAGE_BYTES: usize = 4;

/// Split `text` into chunks of at most `max_bytes` bytes.
///
/// Cuts at the last newline inside the window when there is one (the newline
/// stays with the earlier chunk), otherwise at the last char boundary. The
/// chunks concatenate back to `text`.
///
/// `max_bytes` below [`MIN_MESSAGE_BYTES`] is treated as that floor.
pub fn split_message(text: &str, max_bytes: usize) -> Vec<&str> {
    let max_bytes = max_bytes.max(MIN_MESSAGE_BYTES);
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > max_bytes {
        let mut cut = max_bytes;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if let Some(newline) = rest[..cut].rfind('\n') {
            if newline > 0 {
                cut = newline + 1;
            }
        }
        let (head, tail) = rest.split_at(cut);
        chunks.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }
    chunks
}

/// Local stand-in for enrichment: whitespace collapsed, truncated.
pub fn fallback_summary(content: &str, max_chars: usize) -> String {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut out = collapsed.chars().take(max_chars).collect::<String>();
    out.push('…');
    out
}

/// Notices matched by at least one rule, annotated with the matching rule
/// descriptions, plus per-rule hit counts for this batch.
pub fn filter_notices(rules: &[Rule], notices: &[Notice]) -> (Vec<Notice>, BTreeMap<i64, i64>) {
    let mut matched = Vec::new();
    let mut hits = BTreeMap::new();
    for notice in notices {
        let text = notice.match_text();
        let matching = rules.iter().filter(|r| r.matches(&text)).collect::<Vec<_>>();
        if matching.is_empty() {
            continue;
        }
        for rule in &matching {
            *hits.entry(rule.id).or_insert(0) += 1;
        }
        let mut annotated = notice.clone();
        annotated.matched_by = Some(
            matching
                .iter()
                .map(|r| r.describe())
                .collect::<Vec<_>>()
                .join(" | "),
        );
        matched.push(annotated);
    }
    (matched, hits)
}

/// Rule hit deltas shared by all jobs of a process, flushed to the store in
/// one batched increment.
#[derive(Debug, Default)]
pub struct RuleHitLedger {
    pending: Mutex<BTreeMap<i64, i64>>,
}

impl RuleHitLedger {
    pub async fn record(&self, hits: &BTreeMap<i64, i64>) {
        let mut pending = self.pending.lock().await;
        for (id, delta) in hits {
            *pending.entry(*id).or_insert(0) += delta;
        }
    }

    pub async fn pending(&self) -> BTreeMap<i64, i64> {
        self.pending.lock().await.clone()
    }

    /// Write pending deltas. On failure they are merged back for the next flush.
    pub async fn flush(&self, store: &dyn DeliveryStore) -> anyhow::Result<usize> {
        let batch = std::mem::take(&mut *self.pending.lock().await);
        if batch.is_empty() {
            return Ok(0);
        }
        if let Err(err) = store.increment_rule_hits(&batch).await {
            self.record(&batch).await;
            return Err(err);
        }
        Ok(batch.len())
    }
}

#[derive(Template)]
#[template(
    source = "【{{ title }}】\n发布时间：{{ notice_time }}\n{% if !tender_code.is_empty() %}项目编号：{{ tender_code }}\n{% endif %}匹配规则：{{ matched_by }}\n\n{{ summary }}\n\n{{ url }}",
    ext = "txt"
)]
struct NoticeMessage<'a> {
    title: &'a str,
    notice_time: String,
    tender_code: &'a str,
    matched_by: &'a str,
    summary: &'a str,
    url: &'a str,
}

#[derive(Template)]
#[template(
    source = "⚠️ 失信预警：{{ credit_name }}\n统一社会信用代码：{{ credit_code }}\n有效期：{{ validity }}\n处罚事由：{{ reason }}\n处罚部门：{{ department }}\n处罚结果：{{ result }}\n处罚公告：{{ penalty_link }}\n详情：{{ detail_link }}",
    ext = "txt"
)]
struct AlarmMessage<'a> {
    credit_name: &'a str,
    credit_code: &'a str,
    validity: String,
    reason: &'a str,
    department: &'a str,
    result: &'a str,
    penalty_link: String,
    detail_link: String,
}

pub fn render_notice(notice: &Notice, summary: &str) -> String {
    let message = NoticeMessage {
        title: &notice.title,
        notice_time: notice.notice_time.format("%Y-%m-%d %H:%M").to_string(),
        tender_code: &notice.tender_code,
        matched_by: notice.matched_by.as_deref().unwrap_or_default(),
        summary,
        url: &notice.url,
    };
    message.render().unwrap_or_else(|err| {
        warn!(error = %err, "notice template failed; sending plain text");
        format!("{}\n\n{}\n\n{}", notice.title, summary, notice.url)
    })
}

pub fn render_alarm(alarm: &AlarmRecord, portal_url: &str) -> String {
    let message = AlarmMessage {
        credit_name: &alarm.credit_name,
        credit_code: &alarm.credit_code,
        validity: alarm.validity_label(),
        reason: &alarm.reason,
        department: &alarm.department,
        result: &alarm.result,
        penalty_link: PortalCrawler::notice_link(portal_url, &alarm.penalty_notice_id),
        detail_link: PortalCrawler::notice_link(portal_url, &alarm.detail_notice_id),
    };
    message.render().unwrap_or_else(|err| {
        warn!(error = %err, "alarm template failed; sending plain text");
        format!("{} ({})", alarm.credit_name, alarm.credit_code)
    })
}

fn failure_summary(failed: &[Notice]) -> String {
    let mut text = String::from("以下公告推送失败：");
    for notice in failed {
        text.push_str("\n- ");
        text.push_str(&notice.title);
    }
    text
}

/// What one delivery job did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutcome {
    pub chat_id: ChatId,
    pub matched: usize,
    pub skipped_seen: usize,
    pub delivered: usize,
    pub failed: usize,
    pub messages_sent: usize,
    pub enriched: usize,
    pub fallback: usize,
    pub alarms_sent: usize,
}

enum Stage {
    Filter,
    Deliver(Vec<Notice>),
    AlarmCheck,
    Done,
}

/// Runs one subscriber's [`DeliveryJob`] end to end. Collaborator failures
/// are logged and folded into the [`JobOutcome`]; nothing propagates.
pub struct DeliveryPipeline {
    messenger: Arc<dyn Messenger>,
    store: Arc<dyn DeliveryStore>,
    gate: Arc<RateGate>,
    enricher: Option<Arc<dyn Enricher>>,
    hits: Arc<RuleHitLedger>,
    portal_url: String,
    max_message_bytes: usize,
    shutdown: watch::Receiver<bool>,
}

impl DeliveryPipeline {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        store: Arc<dyn DeliveryStore>,
        gate: Arc<RateGate>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            messenger,
            store,
            gate,
            enricher: None,
            hits: Arc::new(RuleHitLedger::default()),
            portal_url: String::new(),
            max_message_bytes: bidwatch_adapters::TelegramMessenger::MAX_MESSAGE_BYTES,
            shutdown,
        }
    }

    pub fn with_enricher(mut self, enricher: Option<Arc<dyn Enricher>>) -> Self {
        self.enricher = enricher;
        self
    }

    pub fn with_portal_url(mut self, portal_url: impl Into<String>) -> Self {
        self.portal_url = portal_url.into();
        self
    }

    /// Limits below [`MIN_MESSAGE_BYTES`] are raised to it.
    pub fn with_max_message_bytes(mut self, max_message_bytes: usize) -> Self {
        if max_message_bytes < MIN_MESSAGE_BYTES {
            warn!(
                requested = max_message_bytes,
                used = MIN_MESSAGE_BYTES,
                "message size limit below floor; raised"
            );
        }
        self.max_message_bytes = max_message_bytes.max(MIN_MESSAGE_BYTES);
        self
    }

    pub fn ledger(&self) -> Arc<RuleHitLedger> {
        self.hits.clone()
    }

    pub async fn run(&self, job: DeliveryJob) -> JobOutcome {
        let span = info_span!("delivery_job", chat_id = job.chat_id, force = job.force);
        self.run_stages(job).instrument(span).await
    }

    async fn run_stages(&self, job: DeliveryJob) -> JobOutcome {
        let mut outcome = JobOutcome {
            chat_id: job.chat_id,
            ..JobOutcome::default()
        };
        let mut history = Vec::new();
        let mut sent_alarms = Vec::new();

        let mut stage = Stage::Filter;
        loop {
            stage = match stage {
                Stage::Filter => {
                    let (matched, hits) = filter_notices(&job.rules, &job.notices);
                    self.hits.record(&hits).await;
                    outcome.matched = matched.len();
                    debug!(matched = matched.len(), "filter stage done");
                    if matched.is_empty() {
                        Stage::AlarmCheck
                    } else {
                        Stage::Deliver(matched)
                    }
                }
                Stage::Deliver(matched) => {
                    history = self.deliver(&job, matched, &mut outcome).await;
                    Stage::AlarmCheck
                }
                Stage::AlarmCheck => {
                    if !job.alarms.is_empty() {
                        sent_alarms = self.check_alarms(&job, &mut outcome).await;
                    }
                    Stage::Done
                }
                Stage::Done => {
                    self.persist(&history, &sent_alarms).await;
                    break;
                }
            };
        }

        info!(
            matched = outcome.matched,
            delivered = outcome.delivered,
            failed = outcome.failed,
            skipped_seen = outcome.skipped_seen,
            alarms_sent = outcome.alarms_sent,
            "delivery job finished"
        );
        outcome
    }

    async fn deliver(
        &self,
        job: &DeliveryJob,
        matched: Vec<Notice>,
        outcome: &mut JobOutcome,
    ) -> Vec<HistoryRecord> {
        let mut history = Vec::new();
        let mut failed = Vec::new();

        for notice in matched {
            if !job.force {
                match self.store.history_exists(job.chat_id, &notice.url).await {
                    Ok(true) => {
                        outcome.skipped_seen += 1;
                        continue;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(url = %notice.url, error = %err, "history lookup failed; delivering anyway");
                    }
                }
            }

            let summary = self.summarize(&notice.content, outcome).await;
            let text = render_notice(&notice, &summary);
            let sent = self.send_chunked(job.chat_id, &text).await;
            outcome.messages_sent += sent.messages;
            if sent.complete {
                outcome.delivered += 1;
                history.push(history_record(job.chat_id, &notice));
            } else {
                failed.push(notice);
            }
        }

        outcome.failed = failed.len();
        if !failed.is_empty() {
            let sent = self
                .send_chunked(job.chat_id, &failure_summary(&failed))
                .await;
            outcome.messages_sent += sent.messages;
            if sent.complete {
                // The subscriber now knows about them; don't retry next cycle.
                history.extend(failed.iter().map(|n| history_record(job.chat_id, n)));
            } else {
                warn!(failed = failed.len(), "failure summary not delivered; notices will be retried");
            }
        }
        history
    }

    async fn summarize(&self, content: &str, outcome: &mut JobOutcome) -> String {
        let Some(enricher) = &self.enricher else {
            outcome.fallback += 1;
            return fallback_summary(content, FALLBACK_SUMMARY_CHARS);
        };
        if content.trim().is_empty() {
            outcome.fallback += 1;
            return String::new();
        }

        let mut shutdown = self.shutdown.clone();
        match self.gate.admit(&mut shutdown).await {
            Ok(Admission::Granted(permit)) => match enricher.enrich(content).await {
                Ok(text) => {
                    permit.commit();
                    outcome.enriched += 1;
                    return text;
                }
                Err(err) => warn!(
                    transient = err.is_transient(),
                    error = %err,
                    "enrichment failed; using local fallback"
                ),
            },
            Ok(Admission::QuotaExhausted) => {}
            Err(_) => debug!("rate gate wait cancelled by shutdown"),
        }
        outcome.fallback += 1;
        fallback_summary(content, FALLBACK_SUMMARY_CHARS)
    }

    async fn send_chunked(&self, chat_id: ChatId, text: &str) -> ChunkedSend {
        let mut sent = ChunkedSend {
            messages: 0,
            complete: true,
        };
        for chunk in split_message(text, self.max_message_bytes) {
            match self.messenger.send_text(chat_id, chunk).await {
                Ok(_) => sent.messages += 1,
                Err(err) => {
                    warn!(
                        chat_id,
                        transient = err.is_transient(),
                        error = %err,
                        "send failed; remaining chunks dropped"
                    );
                    sent.complete = false;
                    break;
                }
            }
        }
        sent
    }

    async fn check_alarms(&self, job: &DeliveryJob, outcome: &mut JobOutcome) -> Vec<AlarmRecord> {
        let today = Local::now().date_naive();
        let cached = match self.store.cached_alarm_codes(job.chat_id, today).await {
            Ok(codes) => codes,
            Err(err) => {
                warn!(error = %err, "alarm cache unavailable; skipping alarm check");
                return Vec::new();
            }
        };

        let mut sent = Vec::new();
        for alarm in &job.alarms {
            if cached.contains(&alarm.credit_code) || alarm.is_expired_on(today) {
                continue;
            }
            let text = render_alarm(alarm, &self.portal_url);
            let result = self.send_chunked(job.chat_id, &text).await;
            outcome.messages_sent += result.messages;
            if result.complete {
                sent.push(alarm.clone());
            }
        }
        outcome.alarms_sent = sent.len();
        sent
    }

    async fn persist(&self, history: &[HistoryRecord], alarms: &[AlarmRecord]) {
        if !history.is_empty() {
            if let Err(err) = self.store.upsert_history(history).await {
                warn!(records = history.len(), error = %err, "history upsert failed");
            }
        }
        if !alarms.is_empty() {
            if let Err(err) = self.store.upsert_alarms(alarms).await {
                warn!(records = alarms.len(), error = %err, "alarm cache upsert failed");
            }
        }
        if let Err(err) = self.hits.flush(self.store.as_ref()).await {
            warn!(error = %err, "rule hit flush failed; kept for next flush");
        }
    }
}

struct ChunkedSend {
    messages: usize,
    complete: bool,
}

fn history_record(chat_id: ChatId, notice: &Notice) -> HistoryRecord {
    HistoryRecord {
        chat_id,
        url: notice.url.clone(),
        title: notice.title.clone(),
        seen_at: Utc::now(),
    }
}

#[async_trait]
impl JobHandler<DeliveryJob> for DeliveryPipeline {
    type Output = JobOutcome;

    async fn handle(&self, job: DeliveryJob) -> JobOutcome {
        self.run(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{alarm, notice, RecordingMessenger, ScriptedEnricher};
    use bidwatch_storage::{MemoryStore, RateGateConfig};
    use chrono::NaiveDate;

    #[test]
    fn short_text_is_a_single_chunk() {
        assert_eq!(split_message("hello", 4096), vec!["hello"]);
        assert!(split_message("", 4096).is_empty());
    }

    #[test]
    fn chunks_prefer_newline_breaks_and_rejoin() {
        let text = "line one\nline two\nline three";
        let chunks = split_message(text, 12);
        assert_eq!(chunks, vec!["line one\n", "line two\n", "line three"]);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn long_line_is_hard_cut_on_char_boundaries() {
        let text = "某".repeat(2000);
        let chunks = split_message(&text, 4096);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() <= 4096));
        assert_eq!(chunks.concat(), text);
        assert_eq!(split_message(chunks[0], 4096), vec![chunks[0]]);
    }

    #[test]
    fn every_chunk_fits_the_limit() {
        let text = (0..500)
            .map(|i| format!("row {i} {}", "x".repeat(i % 37)))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = split_message(&text, 256);
        assert!(chunks.len() >= text.len().div_ceil(256));
        assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= 256));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn tiny_limits_use_the_floor() {
        let text = "某部 ab\ncd";
        let chunks = split_message(text, 1);
        assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= MIN_MESSAGE_BYTES));
        assert_eq!(chunks.concat(), text);

        let (tx, rx) = watch::channel(false);
        let pipeline = DeliveryPipeline::new(
            Arc::new(RecordingMessenger::default()),
            Arc::new(MemoryStore::new()),
            Arc::new(RateGate::new(RateGateConfig::default())),
            rx,
        )
        .with_max_message_bytes(2);
        assert_eq!(pipeline.max_message_bytes, MIN_MESSAGE_BYTES);
        drop(tx);
    }

    #[test]
    fn fallback_summary_collapses_and_truncates() {
        assert_eq!(fallback_summary("  a \n\n b  ", 10), "a b");
        assert_eq!(fallback_summary("abcdef", 3), "abc…");
    }

    #[test]
    fn filter_annotates_matches_and_counts_hits() {
        let rules = vec![Rule::compile(1, "某部 -演示"), Rule::compile(2, "仓储")];
        let notices = vec![
            notice("u1", "某部仓储建设"),
            notice("u2", "某部演示项目"),
            notice("u3", "无关公告"),
        ];
        let (matched, hits) = filter_notices(&rules, &notices);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].url, "u1");
        assert_eq!(matched[0].matched_by.as_deref(), Some("+某部 -演示 | +仓储"));
        assert_eq!(hits, BTreeMap::from([(1, 1), (2, 1)]));
    }

    #[test]
    fn alarm_message_carries_both_links() {
        let text = render_alarm(&alarm(7, "91330000X"), "https://portal.test");
        assert!(text.contains("91330000X"));
        assert!(text.contains("https://portal.test/notice/pen-91330000X"));
        assert!(text.contains("https://portal.test/notice/det-91330000X"));
        assert!(text.contains("长期"));
    }

    fn pipeline(
        messenger: Arc<RecordingMessenger>,
        store: Arc<MemoryStore>,
        gate: RateGateConfig,
    ) -> (DeliveryPipeline, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let pipeline = DeliveryPipeline::new(messenger, store, Arc::new(RateGate::new(gate)), rx)
            .with_portal_url("https://portal.test");
        (pipeline, tx)
    }

    fn job(chat_id: ChatId, rules: &[&str], notices: Vec<Notice>) -> DeliveryJob {
        DeliveryJob {
            chat_id,
            rules: rules
                .iter()
                .enumerate()
                .map(|(i, expr)| Rule::compile(i as i64 + 1, expr))
                .collect(),
            notices: Arc::new(notices),
            alarm_keywords: Vec::new(),
            alarms: Vec::new(),
            force: false,
        }
    }

    #[tokio::test]
    async fn failed_notice_is_reported_and_recorded_after_summary() {
        let messenger = Arc::new(RecordingMessenger::failing_on("u2"));
        let store = Arc::new(MemoryStore::new());
        let (pipeline, _tx) = pipeline(messenger.clone(), store.clone(), RateGateConfig::default());

        let outcome = pipeline
            .run(job(
                1,
                &["公告"],
                vec![notice("u1", "好公告"), notice("u2", "坏公告")],
            ))
            .await;

        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.failed, 1);
        let texts = messenger.texts_for(1);
        assert_eq!(texts.len(), 2);
        assert!(texts[1].starts_with("以下公告推送失败"));
        let urls = store.history().await.into_iter().map(|h| h.url).collect::<Vec<_>>();
        assert_eq!(urls, vec!["u1".to_string(), "u2".to_string()]);
    }

    #[tokio::test]
    async fn failed_summary_leaves_failed_notices_unrecorded() {
        let messenger = Arc::new(RecordingMessenger::failing_on("失败"));
        let store = Arc::new(MemoryStore::new());
        let (pipeline, _tx) = pipeline(messenger.clone(), store.clone(), RateGateConfig::default());

        let outcome = pipeline
            .run(job(1, &["公告"], vec![notice("u9", "失败的公告")]))
            .await;

        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.messages_sent, 0);
        assert!(store.history().await.is_empty());
    }

    #[tokio::test]
    async fn long_message_goes_out_in_ordered_chunks() {
        let messenger = Arc::new(RecordingMessenger::default());
        let store = Arc::new(MemoryStore::new());
        let (pipeline, _tx) = pipeline(messenger.clone(), store.clone(), RateGateConfig::default());
        let pipeline = pipeline.with_max_message_bytes(64);

        let mut long = notice("u1", "长公告");
        long.content = "段落 ".repeat(40);
        let outcome = pipeline.run(job(1, &["长公告"], vec![long])).await;

        let texts = messenger.texts_for(1);
        assert!(texts.len() > 1);
        assert_eq!(outcome.messages_sent, texts.len());
        assert!(texts.iter().all(|t| t.len() <= 64));
        assert!(texts[0].starts_with("【长公告】"));
        assert!(texts.last().is_some_and(|t| t.ends_with("u1")));
    }

    #[tokio::test]
    async fn exhausted_quota_falls_back_without_calling_enricher() {
        let messenger = Arc::new(RecordingMessenger::default());
        let store = Arc::new(MemoryStore::new());
        let enricher = Arc::new(ScriptedEnricher::ok("AI 摘要"));
        let (pipeline, _tx) = pipeline(
            messenger.clone(),
            store,
            RateGateConfig {
                per_minute: 10,
                daily_quota: 0,
            },
        );
        let pipeline = pipeline.with_enricher(Some(enricher.clone() as Arc<dyn Enricher>));

        let mut n = notice("u1", "某部仓储");
        n.content = "原始   正文".into();
        let outcome = pipeline.run(job(1, &["某部"], vec![n])).await;

        assert_eq!(enricher.calls(), 0);
        assert_eq!(outcome.fallback, 1);
        assert!(messenger.texts_for(1)[0].contains("原始 正文"));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_enrichment_spends_quota_then_falls_back() {
        let messenger = Arc::new(RecordingMessenger::default());
        let store = Arc::new(MemoryStore::new());
        let enricher = Arc::new(ScriptedEnricher::ok("AI 摘要"));
        let (tx, rx) = watch::channel(false);
        let gate = Arc::new(RateGate::new(RateGateConfig {
            per_minute: 60,
            daily_quota: 1,
        }));
        let pipeline = DeliveryPipeline::new(messenger.clone(), store, gate.clone(), rx)
            .with_enricher(Some(enricher.clone() as Arc<dyn Enricher>));

        let mut first = notice("u1", "某部仓储");
        first.content = "第一篇   正文".into();
        let mut second = notice("u2", "某部办公");
        second.content = "第二篇   正文".into();
        let outcome = pipeline.run(job(1, &["某部"], vec![first, second])).await;

        assert_eq!(outcome.enriched, 1);
        assert_eq!(outcome.fallback, 1);
        assert_eq!(enricher.calls(), 1);
        assert_eq!(gate.used_today(), 1);
        let texts = messenger.texts_for(1);
        assert_eq!(texts.len(), 2);
        assert!(texts[0].contains("AI 摘要"));
        assert!(!texts[1].contains("AI 摘要"));
        assert!(texts[1].contains("第二篇 正文"));

        let mut third = notice("u3", "某部维修");
        third.content = "第三篇".into();
        pipeline.run(job(1, &["某部"], vec![third])).await;
        assert_eq!(enricher.calls(), 1);
        assert_eq!(gate.used_today(), 1);
        drop(tx);
    }

    #[tokio::test]
    async fn enrichment_failure_does_not_spend_quota() {
        let messenger = Arc::new(RecordingMessenger::default());
        let store = Arc::new(MemoryStore::new());
        let enricher = Arc::new(ScriptedEnricher::failing());
        let (tx, rx) = watch::channel(false);
        let gate = Arc::new(RateGate::new(RateGateConfig {
            per_minute: 60,
            daily_quota: 5,
        }));
        let pipeline = DeliveryPipeline::new(messenger.clone(), store, gate.clone(), rx)
            .with_enricher(Some(enricher.clone() as Arc<dyn Enricher>));

        let mut n = notice("u1", "某部仓储");
        n.content = "正文".into();
        pipeline.run(job(1, &["某部"], vec![n])).await;

        assert_eq!(enricher.calls(), 1);
        assert_eq!(gate.used_today(), 0);
        assert_eq!(gate.remaining_today(), 5);
        drop(tx);
    }

    #[tokio::test]
    async fn cached_and_lapsed_alarms_are_suppressed() {
        let messenger = Arc::new(RecordingMessenger::default());
        let store = Arc::new(MemoryStore::new());
        store.upsert_alarms(&[alarm(1, "OLD")]).await.unwrap();
        let (pipeline, _tx) = pipeline(messenger.clone(), store.clone(), RateGateConfig::default());

        let mut lapsed = alarm(1, "LAPSED");
        lapsed.end_date = NaiveDate::from_ymd_opt(2000, 1, 1);
        let mut j = job(1, &[], Vec::new());
        j.alarm_keywords = vec!["acme".into()];
        j.alarms = vec![alarm(1, "OLD"), alarm(1, "NEW"), lapsed];

        let outcome = pipeline.run(j).await;

        assert_eq!(outcome.alarms_sent, 1);
        let texts = messenger.texts_for(1);
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("NEW"));
        let codes = store
            .alarms()
            .await
            .into_iter()
            .map(|a| a.credit_code)
            .collect::<Vec<_>>();
        assert_eq!(codes, vec!["NEW".to_string(), "OLD".to_string()]);
    }

    #[tokio::test]
    async fn persistence_failure_does_not_block_delivery() {
        let messenger = Arc::new(RecordingMessenger::default());
        let store = Arc::new(MemoryStore::new());
        store.set_fail_writes(true);
        let (pipeline, _tx) = pipeline(messenger.clone(), store.clone(), RateGateConfig::default());

        let outcome = pipeline
            .run(job(1, &["某部"], vec![notice("u1", "某部仓储")]))
            .await;

        assert_eq!(outcome.delivered, 1);
        assert_eq!(messenger.texts_for(1).len(), 1);
        assert!(store.history().await.is_empty());
        assert_eq!(pipeline.ledger().pending().await, BTreeMap::from([(1, 1)]));

        store.set_fail_writes(false);
        pipeline.ledger().flush(store.as_ref()).await.unwrap();
        assert_eq!(store.rule_hits().await, BTreeMap::from([(1, 1)]));
    }
}
