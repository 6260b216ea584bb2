//! Asynchronous document rendering: issue a request, park its context, and
//! deliver the artifact when the render service calls back.

use std::sync::Arc;
use std::time::Duration;

use bidwatch_adapters::{AdapterError, Messenger, OutboundFile, RenderRequest, Renderer};
use bidwatch_core::{new_request_id, ArtifactKind, ChatId, MessageId, PendingCallback};
use bidwatch_storage::CorrelationStore;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{info, warn, Instrument};

pub const PLACEHOLDER_TEXT: &str = "正在生成文件，请稍候…";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no render service configured")]
    NotConfigured,
    #[error("render request failed: {0}")]
    Request(#[source] AdapterError),
}

/// Result of handing a webhook payload to [`RenderBridge::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Delivery is running as a tracked upload; see [`RenderBridge::drain`].
    Accepted,
    /// Unknown, expired, or already consumed request id.
    Unknown,
}

pub struct RenderBridge {
    messenger: Arc<dyn Messenger>,
    renderer: Option<Arc<dyn Renderer>>,
    pending: Arc<CorrelationStore<PendingCallback>>,
    public_url: String,
    ttl: Duration,
    uploads: Mutex<JoinSet<()>>,
}

/// What [`RenderBridge::drain`] did with the uploads still in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub finished: usize,
    pub aborted: usize,
}

impl RenderBridge {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        renderer: Option<Arc<dyn Renderer>>,
        public_url: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            messenger,
            renderer,
            pending: Arc::new(CorrelationStore::new()),
            public_url: public_url.into(),
            ttl,
            uploads: Mutex::new(JoinSet::new()),
        }
    }

    pub fn pending(&self) -> Arc<CorrelationStore<PendingCallback>> {
        self.pending.clone()
    }

    pub fn webhook_url(&self, request_id: &str) -> String {
        format!("{}/callback/{request_id}", self.public_url.trim_end_matches('/'))
    }

    /// Ask the render service for `source_url` as `kind`. Returns the request id.
    pub async fn request(
        &self,
        chat_id: ChatId,
        source_url: &str,
        kind: ArtifactKind,
        caption: &str,
        reply_to: Option<MessageId>,
    ) -> Result<String, RenderError> {
        let renderer = self.renderer.as_ref().ok_or(RenderError::NotConfigured)?;

        let placeholder = match self.messenger.send_text(chat_id, PLACEHOLDER_TEXT).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(chat_id, error = %err, "placeholder message failed");
                None
            }
        };

        let request_id = new_request_id();
        // Parked before issuing so a fast callback still finds it.
        self.pending
            .put(
                request_id.clone(),
                PendingCallback {
                    chat_id,
                    placeholder_message_id: placeholder,
                    reply_to,
                    kind,
                    caption: caption.to_string(),
                },
                self.ttl,
            )
            .await;

        let request = RenderRequest {
            request_id: request_id.clone(),
            source_url: source_url.to_string(),
            kind,
            webhook_url: self.webhook_url(&request_id),
        };
        if let Err(err) = renderer.request_render(&request).await {
            self.pending.delete(&request_id).await;
            if let Some(message_id) = placeholder {
                if let Err(del) = self.messenger.delete_message(chat_id, message_id).await {
                    warn!(chat_id, error = %del, "placeholder cleanup failed");
                }
            }
            return Err(RenderError::Request(err));
        }

        info!(chat_id, %request_id, kind = %kind, "render requested");
        Ok(request_id)
    }

    /// Consume the pending entry for `request_id` and deliver `bytes` to its chat.
    ///
    /// Each id is consumed at most once; a late or repeated callback gets
    /// [`CallbackOutcome::Unknown`].
    pub async fn complete(&self, request_id: &str, bytes: Vec<u8>) -> CallbackOutcome {
        let Some(pending) = self.pending.take(request_id).await else {
            warn!(%request_id, "callback for unknown or expired request");
            return CallbackOutcome::Unknown;
        };
        let messenger = self.messenger.clone();
        let request_id = request_id.to_string();
        let mut uploads = self.uploads.lock().await;
        while let Some(done) = uploads.try_join_next() {
            log_upload_result(done);
        }
        uploads.spawn(
            async move {
                deliver_artifact(messenger.as_ref(), &request_id, pending, bytes).await;
            }
            .in_current_span(),
        );
        CallbackOutcome::Accepted
    }

    /// Wait up to `grace` for accepted uploads, then abort the rest.
    pub async fn drain(&self, grace: Duration) -> DrainReport {
        let mut uploads = std::mem::take(&mut *self.uploads.lock().await);
        let deadline = Instant::now() + grace;
        let mut report = DrainReport::default();
        loop {
            match tokio::time::timeout_at(deadline, uploads.join_next()).await {
                Ok(Some(done)) => {
                    log_upload_result(done);
                    report.finished += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    report.aborted = uploads.len();
                    warn!(aborted = report.aborted, "artifact uploads still running at deadline; aborting");
                    uploads.shutdown().await;
                    break;
                }
            }
        }
        info!(finished = report.finished, aborted = report.aborted, "render uploads drained");
        report
    }

    pub fn spawn_sweeper(&self, every: Duration, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.pending.clone().spawn_sweeper(every, shutdown)
    }
}

fn log_upload_result(done: Result<(), tokio::task::JoinError>) {
    if let Err(err) = done {
        if err.is_panic() {
            warn!(error = %err, "artifact upload panicked");
        }
    }
}

async fn deliver_artifact(
    messenger: &dyn Messenger,
    request_id: &str,
    pending: PendingCallback,
    bytes: Vec<u8>,
) {
    let chat_id = pending.chat_id;
    if let Some(message_id) = pending.placeholder_message_id {
        if let Err(err) = messenger.delete_message(chat_id, message_id).await {
            warn!(chat_id, message_id, error = %err, "placeholder delete failed");
        }
    }

    let file = OutboundFile {
        file_name: pending.kind.file_name(request_id),
        bytes,
    };
    let size = file.bytes.len();
    let sent = match pending.kind {
        ArtifactKind::Document => {
            messenger
                .send_document(chat_id, file, &pending.caption, pending.reply_to)
                .await
        }
        ArtifactKind::Image => {
            messenger
                .send_photo(chat_id, file, &pending.caption, pending.reply_to)
                .await
        }
    };
    match sent {
        Ok(_) => info!(chat_id, %request_id, bytes = size, "artifact delivered"),
        Err(err) => warn!(
            chat_id,
            %request_id,
            transient = err.is_transient(),
            error = %err,
            "artifact delivery failed"
        ),
    }
}
