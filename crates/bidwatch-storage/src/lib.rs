//! HTTP client, enrichment rate gate, webhook correlation store, and persistence for bidwatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

mod store;

pub use store::{DeliveryStore, MemoryStore, PgStore};

pub const CRATE_NAME: &str = "bidwatch-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|err| FetchError::Decode {
            url: self.final_url.clone(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::HttpStatus { status, .. } => {
                *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            Self::Decode { .. } => false,
        }
    }
}

/// Shared reqwest client with a global in-flight cap.
///
/// Requests are never retried here: a failed call surfaces to the caller and
/// the next scheduled cycle is the retry.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send a prepared request and return the full body of a 2xx response.
    pub async fn send(
        &self,
        label: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        // The semaphore is owned by self and never closed.
        let _permit = self.global_limit.acquire().await.ok();

        async {
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "http response");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(info_span!("http_fetch", label))
        .await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        label: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        self.send(label, self.client.get(url).query(query))
            .await?
            .json()
    }
}

/// The wait was abandoned because shutdown was signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate gate wait cancelled by shutdown")]
pub struct GateCancelled;

/// Smooth limiter: `capacity` tokens refilled one per `refill_every`.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Bucket of one token refilled `per_minute` times a minute.
    pub fn per_minute(per_minute: u32) -> Self {
        let per_minute = per_minute.max(1);
        Self::new(1, Duration::from_secs(60) / per_minute)
    }

    /// Wait for a token. Returns early with [`GateCancelled`] once `shutdown` flips to true.
    pub async fn take(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), GateCancelled> {
        loop {
            if *shutdown.borrow() {
                return Err(GateCancelled);
            }

            let mut state = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.saturating_duration_since(state.last_refill);
            if self.refill_every.is_zero() {
                state.tokens = self.capacity;
                state.last_refill = now;
            } else if elapsed >= self.refill_every {
                let refills = (elapsed.as_nanos() / self.refill_every.as_nanos()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill += self.refill_every.saturating_mul(refills);
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return Ok(());
            }

            let wake_at = state.last_refill + self.refill_every;
            drop(state);
            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Sender gone: nobody can signal shutdown any more, so just sleep.
                        tokio::time::sleep_until(wake_at).await;
                    }
                }
            }
        }
    }
}

/// Rolling daily counter. The window opens on the first use after a reset and
/// lasts [`DailyQuota::WINDOW`], independent of calendar days.
#[derive(Debug)]
struct DailyQuota {
    limit: u32,
    used: u32,
    reserved: u32,
    window_start: Option<Instant>,
}

impl DailyQuota {
    const WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

    fn roll(&mut self, now: Instant) {
        if let Some(start) = self.window_start {
            if now.saturating_duration_since(start) >= Self::WINDOW {
                self.window_start = None;
                self.used = 0;
            }
        }
    }

    fn try_reserve(&mut self, now: Instant) -> bool {
        self.roll(now);
        if self.used + self.reserved >= self.limit {
            return false;
        }
        self.reserved += 1;
        true
    }

    fn commit(&mut self, now: Instant) {
        self.reserved = self.reserved.saturating_sub(1);
        self.roll(now);
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.used += 1;
    }

    fn release(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateGateConfig {
    pub per_minute: u32,
    pub daily_quota: u32,
}

impl Default for RateGateConfig {
    fn default() -> Self {
        Self {
            per_minute: 10,
            daily_quota: 500,
        }
    }
}

/// Two-tier admission control in front of the enrichment API.
#[derive(Debug)]
pub struct RateGate {
    minute: SimpleTokenBucket,
    daily: std::sync::Mutex<DailyQuota>,
}

/// Outcome of [`RateGate::admit`].
#[derive(Debug)]
pub enum Admission<'a> {
    Granted(QuotaPermit<'a>),
    QuotaExhausted,
}

/// A reserved daily slot. [`QuotaPermit::commit`] after the guarded call
/// succeeds; dropping it uncommitted hands the slot back.
#[derive(Debug)]
pub struct QuotaPermit<'a> {
    gate: &'a RateGate,
    committed: bool,
}

impl QuotaPermit<'_> {
    pub fn commit(mut self) {
        self.gate.with_daily(|d| d.commit(Instant::now()));
        self.committed = true;
    }
}

impl Drop for QuotaPermit<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.gate.with_daily(DailyQuota::release);
        }
    }
}

impl RateGate {
    pub fn new(config: RateGateConfig) -> Self {
        Self {
            minute: SimpleTokenBucket::per_minute(config.per_minute),
            daily: std::sync::Mutex::new(DailyQuota {
                limit: config.daily_quota,
                used: 0,
                reserved: 0,
                window_start: None,
            }),
        }
    }

    fn with_daily<R>(&self, f: impl FnOnce(&mut DailyQuota) -> R) -> R {
        let mut guard = self.daily.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Reserve a daily slot, then wait on the per-minute limiter.
    ///
    /// Returns [`Admission::QuotaExhausted`] without waiting when the daily
    /// window is spent.
    pub async fn admit(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Admission<'_>, GateCancelled> {
        if !self.with_daily(|d| d.try_reserve(Instant::now())) {
            warn!(
                used = self.used_today(),
                "enrichment daily quota exhausted; using local fallback"
            );
            return Ok(Admission::QuotaExhausted);
        }
        let permit = QuotaPermit {
            gate: self,
            committed: false,
        };
        self.minute.take(shutdown).await?;
        Ok(Admission::Granted(permit))
    }

    pub fn used_today(&self) -> u32 {
        self.with_daily(|d| {
            d.roll(Instant::now());
            d.used
        })
    }

    pub fn remaining_today(&self) -> u32 {
        self.with_daily(|d| {
            d.roll(Instant::now());
            d.limit.saturating_sub(d.used + d.reserved)
        })
    }
}

#[derive(Debug)]
struct CorrelationEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Time-boxed key/value map that hands webhook callbacks back to the flow
/// that issued the request. One lock guards the whole map; expiry is checked
/// on read and optionally by [`CorrelationStore::spawn_sweeper`].
#[derive(Debug)]
pub struct CorrelationStore<V> {
    entries: Mutex<HashMap<String, CorrelationEntry<V>>>,
}

impl<V> Default for CorrelationStore<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone + Send + 'static> CorrelationStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .await
            .insert(key.into(), CorrelationEntry { value, expires_at });
    }

    /// Live value for `key`. Expired entries read as absent.
    pub async fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|entry| now >= entry.expires_at) {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|entry| entry.value.clone())
    }

    /// Remove `key`. Returns whether a live entry was removed.
    pub async fn delete(&self, key: &str) -> bool {
        self.entries
            .lock()
            .await
            .remove(key)
            .is_some_and(|entry| Instant::now() < entry.expires_at)
    }

    /// Atomic get-and-delete: at most one caller ever receives the value.
    pub async fn take(&self, key: &str) -> Option<V> {
        self.entries
            .lock()
            .await
            .remove(key)
            .filter(|entry| Instant::now() < entry.expires_at)
            .map(|entry| entry.value)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Drop every expired entry, returning how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        before - entries.len()
    }

    pub fn spawn_sweeper(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.sweep_expired().await;
                        if removed > 0 {
                            debug!(removed, "swept expired correlation entries");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
