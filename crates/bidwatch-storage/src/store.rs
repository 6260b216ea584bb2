//! Persistence boundary: dedup history, alarm cache, rule hit counters.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bidwatch_core::{AlarmRecord, ChatId, HistoryRecord, Rule, SubscriberConfig};
use chrono::NaiveDate;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tokio::sync::Mutex;
use tracing::info;

/// Rows per INSERT statement; keeps us well under the Postgres bind limit.
const UPSERT_BATCH: usize = 1000;

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Every subscriber owning at least one rule or alarm keyword.
    async fn load_subscribers(&self) -> Result<Vec<SubscriberConfig>>;

    async fn history_exists(&self, chat_id: ChatId, url: &str) -> Result<bool>;

    /// Insert or refresh title/timestamp on `(chat_id, url)` conflict.
    async fn upsert_history(&self, records: &[HistoryRecord]) -> Result<()>;

    /// Credit codes still suppressing re-notification on `today`.
    async fn cached_alarm_codes(&self, chat_id: ChatId, today: NaiveDate) -> Result<HashSet<String>>;

    /// Insert or overwrite every column on `(chat_id, credit_code)` conflict.
    async fn upsert_alarms(&self, records: &[AlarmRecord]) -> Result<()>;

    async fn increment_rule_hits(&self, hits: &BTreeMap<i64, i64>) -> Result<()>;

    /// Delete alarms whose end date is before `today`.
    async fn purge_expired_alarms(&self, today: NaiveDate) -> Result<u64>;
}

/// Keep the last record per key, preserving first-seen order of keys.
fn latest_by_key<T: Clone, K: Ord>(records: &[T], key: impl Fn(&T) -> K) -> Vec<T> {
    let mut slots: BTreeMap<K, usize> = BTreeMap::new();
    let mut out: Vec<T> = Vec::with_capacity(records.len());
    for record in records {
        match slots.get(&key(record)) {
            Some(&idx) => out[idx] = record.clone(),
            None => {
                slots.insert(key(record), out.len());
                out.push(record.clone());
            }
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying migrations")?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl DeliveryStore for PgStore {
    async fn load_subscribers(&self) -> Result<Vec<SubscriberConfig>> {
        let mut by_chat: BTreeMap<ChatId, SubscriberConfig> = BTreeMap::new();

        let rule_rows = sqlx::query(
            r#"
            SELECT id, chat_id, expression
              FROM rules
             ORDER BY chat_id, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("loading rules")?;
        for row in rule_rows {
            let id: i64 = row.try_get("id")?;
            let chat_id: ChatId = row.try_get("chat_id")?;
            let expression: String = row.try_get("expression")?;
            by_chat
                .entry(chat_id)
                .or_insert_with(|| SubscriberConfig {
                    chat_id,
                    ..Default::default()
                })
                .rules
                .push(Rule::compile(id, &expression));
        }

        let keyword_rows = sqlx::query(
            r#"
            SELECT chat_id, keyword
              FROM alarm_keywords
             ORDER BY chat_id, keyword
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("loading alarm keywords")?;
        for row in keyword_rows {
            let chat_id: ChatId = row.try_get("chat_id")?;
            let keyword: String = row.try_get("keyword")?;
            by_chat
                .entry(chat_id)
                .or_insert_with(|| SubscriberConfig {
                    chat_id,
                    ..Default::default()
                })
                .alarm_keywords
                .push(keyword);
        }

        Ok(by_chat.into_values().filter(SubscriberConfig::has_work).collect())
    }

    async fn history_exists(&self, chat_id: ChatId, url: &str) -> Result<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM history WHERE chat_id = $1 AND url = $2)")
            .bind(chat_id)
            .bind(url)
            .fetch_one(&self.pool)
            .await
            .context("checking delivery history")?;
        Ok(row.try_get::<bool, _>(0)?)
    }

    async fn upsert_history(&self, records: &[HistoryRecord]) -> Result<()> {
        let rows = latest_by_key(records, |r| (r.chat_id, r.url.clone()));
        for chunk in rows.chunks(UPSERT_BATCH) {
            let mut qb = QueryBuilder::<Postgres>::new("INSERT INTO history (chat_id, url, title, seen_at) ");
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.chat_id)
                    .push_bind(r.url.clone())
                    .push_bind(r.title.clone())
                    .push_bind(r.seen_at);
            });
            qb.push(
                " ON CONFLICT (chat_id, url) DO UPDATE SET title = EXCLUDED.title, seen_at = EXCLUDED.seen_at",
            );
            qb.build()
                .execute(&self.pool)
                .await
                .context("upserting delivery history")?;
        }
        Ok(())
    }

    async fn cached_alarm_codes(&self, chat_id: ChatId, today: NaiveDate) -> Result<HashSet<String>> {
        let rows = sqlx::query(
            r#"
            SELECT credit_code
              FROM alarms
             WHERE chat_id = $1
               AND (end_date IS NULL OR end_date >= $2)
            "#,
        )
        .bind(chat_id)
        .bind(today)
        .fetch_all(&self.pool)
        .await
        .context("loading cached alarms")?;
        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("credit_code")?);
        }
        Ok(out)
    }

    async fn upsert_alarms(&self, records: &[AlarmRecord]) -> Result<()> {
        let rows = latest_by_key(records, |r| (r.chat_id, r.credit_code.clone()));
        for chunk in rows.chunks(UPSERT_BATCH) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO alarms (chat_id, credit_code, credit_name, business_id, start_date, end_date, \
                 reason, department, result, penalty_notice_id, detail_notice_id, updated_at) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.chat_id)
                    .push_bind(r.credit_code.clone())
                    .push_bind(r.credit_name.clone())
                    .push_bind(r.business_id.clone())
                    .push_bind(r.start_date)
                    .push_bind(r.end_date)
                    .push_bind(r.reason.clone())
                    .push_bind(r.department.clone())
                    .push_bind(r.result.clone())
                    .push_bind(r.penalty_notice_id.clone())
                    .push_bind(r.detail_notice_id.clone())
                    .push("NOW()");
            });
            qb.push(
                " ON CONFLICT (chat_id, credit_code) DO UPDATE SET \
                 credit_name = EXCLUDED.credit_name, \
                 business_id = EXCLUDED.business_id, \
                 start_date = EXCLUDED.start_date, \
                 end_date = EXCLUDED.end_date, \
                 reason = EXCLUDED.reason, \
                 department = EXCLUDED.department, \
                 result = EXCLUDED.result, \
                 penalty_notice_id = EXCLUDED.penalty_notice_id, \
                 detail_notice_id = EXCLUDED.detail_notice_id, \
                 updated_at = EXCLUDED.updated_at",
            );
            qb.build()
                .execute(&self.pool)
                .await
                .context("upserting alarms")?;
        }
        Ok(())
    }

    async fn increment_rule_hits(&self, hits: &BTreeMap<i64, i64>) -> Result<()> {
        if hits.is_empty() {
            return Ok(());
        }
        let ids = hits.keys().copied().collect::<Vec<_>>();
        let deltas = hits.values().copied().collect::<Vec<_>>();
        sqlx::query(
            r#"
            UPDATE rules r
               SET hits = r.hits + v.delta
              FROM UNNEST($1::BIGINT[], $2::BIGINT[]) AS v(id, delta)
             WHERE r.id = v.id
            "#,
        )
        .bind(ids)
        .bind(deltas)
        .execute(&self.pool)
        .await
        .context("incrementing rule hits")?;
        Ok(())
    }

    async fn purge_expired_alarms(&self, today: NaiveDate) -> Result<u64> {
        let result = sqlx::query("DELETE FROM alarms WHERE end_date IS NOT NULL AND end_date < $1")
            .bind(today)
            .execute(&self.pool)
            .await
            .context("purging expired alarms")?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    subscribers: BTreeMap<ChatId, SubscriberConfig>,
    history: BTreeMap<(ChatId, String), HistoryRecord>,
    alarms: BTreeMap<(ChatId, String), AlarmRecord>,
    rule_hits: BTreeMap<i64, i64>,
}

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_subscriber(&self, config: SubscriberConfig) {
        self.state
            .lock()
            .await
            .subscribers
            .insert(config.chat_id, config);
    }

    /// Make every write fail until switched back off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn history(&self) -> Vec<HistoryRecord> {
        self.state.lock().await.history.values().cloned().collect()
    }

    pub async fn alarms(&self) -> Vec<AlarmRecord> {
        self.state.lock().await.alarms.values().cloned().collect()
    }

    pub async fn rule_hits(&self) -> BTreeMap<i64, i64> {
        self.state.lock().await.rule_hits.clone()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("memory store configured to fail writes");
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn load_subscribers(&self) -> Result<Vec<SubscriberConfig>> {
        Ok(self
            .state
            .lock()
            .await
            .subscribers
            .values()
            .filter(|s| s.has_work())
            .cloned()
            .collect())
    }

    async fn history_exists(&self, chat_id: ChatId, url: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .await
            .history
            .contains_key(&(chat_id, url.to_string())))
    }

    async fn upsert_history(&self, records: &[HistoryRecord]) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        for record in records {
            state
                .history
                .insert((record.chat_id, record.url.clone()), record.clone());
        }
        Ok(())
    }

    async fn cached_alarm_codes(&self, chat_id: ChatId, today: NaiveDate) -> Result<HashSet<String>> {
        Ok(self
            .state
            .lock()
            .await
            .alarms
            .values()
            .filter(|a| a.chat_id == chat_id && !a.is_expired_on(today))
            .map(|a| a.credit_code.clone())
            .collect())
    }

    async fn upsert_alarms(&self, records: &[AlarmRecord]) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        for record in records {
            state
                .alarms
                .insert((record.chat_id, record.credit_code.clone()), record.clone());
        }
        Ok(())
    }

    async fn increment_rule_hits(&self, hits: &BTreeMap<i64, i64>) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        for (id, delta) in hits {
            *state.rule_hits.entry(*id).or_default() += delta;
        }
        Ok(())
    }

    async fn purge_expired_alarms(&self, today: NaiveDate) -> Result<u64> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        let before = state.alarms.len();
        state.alarms.retain(|_, a| !a.is_expired_on(today));
        Ok((before - state.alarms.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn history(chat_id: ChatId, url: &str, title: &str, hour: u32) -> HistoryRecord {
        HistoryRecord {
            chat_id,
            url: url.to_string(),
            title: title.to_string(),
            seen_at: Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap(),
        }
    }

    fn alarm(chat_id: ChatId, code: &str, end: Option<NaiveDate>) -> AlarmRecord {
        AlarmRecord {
            chat_id,
            credit_name: format!("subject {code}"),
            credit_code: code.to_string(),
            business_id: format!("biz-{code}"),
            start_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            end_date: end,
            reason: "late delivery".into(),
            department: "finance bureau".into(),
            result: "banned".into(),
            penalty_notice_id: "p1".into(),
            detail_notice_id: "d1".into(),
        }
    }

    #[test]
    fn latest_by_key_keeps_last_value_in_first_position() {
        let rows = vec![
            history(1, "u1", "old", 1),
            history(1, "u2", "other", 2),
            history(1, "u1", "new", 3),
        ];
        let out = latest_by_key(&rows, |r| (r.chat_id, r.url.clone()));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].title, "new");
        assert_eq!(out[1].url, "u2");
    }

    #[tokio::test]
    async fn memory_history_upsert_keeps_one_row_with_latest_values() {
        let store = MemoryStore::new();
        store.upsert_history(&[history(9, "u1", "first", 1)]).await.unwrap();
        store.upsert_history(&[history(9, "u1", "second", 5)]).await.unwrap();

        let rows = store.history().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "second");
        assert_eq!(rows[0], history(9, "u1", "second", 5));
        assert!(store.history_exists(9, "u1").await.unwrap());
        assert!(!store.history_exists(10, "u1").await.unwrap());
    }

    #[tokio::test]
    async fn memory_cached_alarms_ignore_lapsed_and_purge_removes_them() {
        let store = MemoryStore::new();
        let today = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        store
            .upsert_alarms(&[
                alarm(1, "A", None),
                alarm(1, "B", NaiveDate::from_ymd_opt(2026, 2, 1)),
                alarm(1, "C", NaiveDate::from_ymd_opt(2026, 3, 1)),
                alarm(2, "D", None),
            ])
            .await
            .unwrap();

        let cached = store.cached_alarm_codes(1, today).await.unwrap();
        assert_eq!(cached, HashSet::from(["A".to_string(), "C".to_string()]));

        assert_eq!(store.purge_expired_alarms(today).await.unwrap(), 1);
        assert_eq!(store.alarms().await.len(), 3);
    }

    #[tokio::test]
    async fn memory_write_failures_are_reported() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.upsert_history(&[history(1, "u", "t", 1)]).await.is_err());
        assert!(store.history().await.is_empty());
    }

    #[tokio::test]
    async fn pg_history_upsert_dedups_when_database_available() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let Ok(store) = PgStore::connect(&url).await else {
            return;
        };
        store.migrate().await.expect("migrate");

        let chat_id = -(Utc::now().timestamp_micros());
        store
            .upsert_history(&[history(chat_id, "u1", "first", 1), history(chat_id, "u1", "dup", 2)])
            .await
            .expect("first upsert");
        store
            .upsert_history(&[history(chat_id, "u1", "latest", 7)])
            .await
            .expect("second upsert");

        let rows = sqlx::query("SELECT title FROM history WHERE chat_id = $1")
            .bind(chat_id)
            .fetch_all(store.pool())
            .await
            .expect("select");
        assert_eq!(rows.len(), 1);
        let title: String = rows[0].try_get("title").expect("title");
        assert_eq!(title, "latest");

        sqlx::query("DELETE FROM history WHERE chat_id = $1")
            .bind(chat_id)
            .execute(store.pool())
            .await
            .expect("cleanup");
    }
}
