use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bidwatch_core::{ArtifactKind, ChatId, MessageId};
use bidwatch_storage::PgStore;
use bidwatch_sync::{CycleSummary, Notifier, SyncConfig};
use bidwatch_web::{AppState, WebConfig};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "bidwatch")]
#[command(about = "Procurement notice watch: crawl, match, notify")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scheduler plus webhook server until Ctrl-C.
    Run,
    /// One notification cycle, then exit.
    Sync,
    /// Forced cycle for the privileged chat.
    Retry {
        #[arg(long)]
        chat_id: ChatId,
    },
    /// Render a page and deliver it once the render service calls back.
    Render {
        #[arg(long)]
        chat_id: ChatId,
        #[arg(long)]
        url: String,
        #[arg(long, default_value = "document")]
        kind: ArtifactKind,
        #[arg(long, default_value = "")]
        caption: String,
        #[arg(long)]
        reply_to: Option<MessageId>,
    },
    Migrate,
    /// Delete alarm cache rows whose validity has lapsed.
    PurgeAlarms,
    /// Webhook server only.
    Serve,
}

fn log_json() -> bool {
    std::env::var("BIDWATCH_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler unavailable; shutting down");
    }
}

fn summary_line(label: &str, summary: &CycleSummary, json: bool) -> Result<String> {
    if json {
        let mut value = serde_json::to_value(summary).context("serializing cycle summary")?;
        if let Some(fields) = value.as_object_mut() {
            fields.insert("command".to_string(), label.into());
        }
        return Ok(value.to_string());
    }
    Ok(format!(
        "{label} complete: run_id={} notices={} jobs={}/{} delivered={} failed={} alarms={} messages={}",
        summary.run_id,
        summary.notices_crawled,
        summary.jobs_completed,
        summary.jobs_submitted,
        summary.delivered,
        summary.notices_failed,
        summary.alarms_sent,
        summary.messages_sent,
    ))
}

fn print_summary(label: &str, summary: &CycleSummary) -> Result<()> {
    println!("{}", summary_line(label, summary, log_json())?);
    Ok(())
}

fn spawn_web(
    notifier: &Notifier,
) -> (watch::Sender<bool>, tokio::task::JoinHandle<Result<()>>) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let state = AppState::new(notifier.render_bridge());
    let handle = tokio::spawn(bidwatch_web::serve(state, WebConfig::from_env(), stop_rx));
    (stop_tx, handle)
}

async fn stop_web(stop_tx: watch::Sender<bool>, handle: tokio::task::JoinHandle<Result<()>>) {
    let _ = stop_tx.send(true);
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %format!("{err:#}"), "webhook server exited with error"),
        Err(err) => warn!(error = %err, "webhook server task failed"),
    }
}

async fn run(notifier: Arc<Notifier>) -> Result<()> {
    let mut scheduler = notifier.maybe_build_scheduler().await?;
    match &scheduler {
        Some(sched) => sched.start().await.context("starting scheduler")?,
        None => warn!("scheduler disabled (BIDWATCH_SCHEDULER_ENABLED); serving callbacks only"),
    }
    let sweeper = notifier
        .render_bridge()
        .spawn_sweeper(Duration::from_secs(60), notifier.shutdown_signal());
    let (web_stop, web) = spawn_web(&notifier);

    wait_for_shutdown_signal().await;
    info!("shutdown requested");

    if let Some(sched) = scheduler.as_mut() {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
    }
    stop_web(web_stop, web).await;
    let report = notifier.shutdown().await;
    info!(
        drained = report.workers.workers_drained,
        aborted = report.workers.workers_aborted,
        uploads_finished = report.uploads.finished,
        uploads_aborted = report.uploads.aborted,
        "notifier closed"
    );
    let _ = sweeper.await;
    Ok(())
}

async fn render(
    notifier: Arc<Notifier>,
    chat_id: ChatId,
    url: &str,
    kind: ArtifactKind,
    caption: &str,
    reply_to: Option<MessageId>,
) -> Result<()> {
    let (web_stop, web) = spawn_web(&notifier);
    let bridge = notifier.render_bridge();
    let request_id = notifier
        .request_render(chat_id, url, kind, caption, reply_to)
        .await?;
    println!("render requested: request_id={request_id}");

    // Wait for the callback to consume the entry or for its TTL to lapse.
    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(notifier.config().callback_ttl_secs);
    let pending = bridge.pending();
    while pending.get(&request_id).await.is_some() && tokio::time::Instant::now() < deadline {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            _ = wait_for_shutdown_signal() => break,
        }
    }
    stop_web(web_stop, web).await;
    // Waits for the accepted upload, bounded by the shutdown grace.
    let report = notifier.shutdown().await;
    if report.uploads.finished == 0 {
        warn!(%request_id, aborted = report.uploads.aborted, "render artifact not delivered");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(bidwatch_sync::notifier_from_env().await?).await?,
        Commands::Sync => {
            let notifier = bidwatch_sync::notifier_from_env().await?;
            let summary = notifier.process().await?;
            notifier.shutdown().await;
            print_summary("sync", &summary)?;
        }
        Commands::Retry { chat_id } => {
            let notifier = bidwatch_sync::notifier_from_env().await?;
            let result = notifier.retry(chat_id).await;
            notifier.shutdown().await;
            print_summary("retry", &result?)?;
        }
        Commands::Render {
            chat_id,
            url,
            kind,
            caption,
            reply_to,
        } => {
            let notifier = bidwatch_sync::notifier_from_env().await?;
            render(notifier, chat_id, &url, kind, &caption, reply_to).await?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            PgStore::connect(&config.database_url).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::PurgeAlarms => {
            let notifier = bidwatch_sync::notifier_from_env().await?;
            let removed = notifier.purge_expired_alarms().await?;
            notifier.shutdown().await;
            println!("purged {removed} expired alarm rows");
        }
        Commands::Serve => {
            let notifier = bidwatch_sync::notifier_from_env().await?;
            let sweeper = notifier
                .render_bridge()
                .spawn_sweeper(Duration::from_secs(60), notifier.shutdown_signal());
            let (web_stop, web) = spawn_web(&notifier);
            wait_for_shutdown_signal().await;
            stop_web(web_stop, web).await;
            notifier.shutdown().await;
            let _ = sweeper.await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn summary() -> CycleSummary {
        CycleSummary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            forced: true,
            notices_crawled: 4,
            jobs_submitted: 2,
            jobs_completed: 2,
            matched: 3,
            delivered: 3,
            skipped_seen: 0,
            notices_failed: 0,
            messages_sent: 3,
            enriched: 1,
            fallback: 2,
            alarms_sent: 1,
        }
    }

    #[test]
    fn plain_summary_is_one_readable_line() {
        let line = summary_line("sync", &summary(), false).unwrap();
        assert!(line.starts_with("sync complete: run_id=00000000-0000-0000-0000-000000000000"));
        assert!(line.contains("jobs=2/2 delivered=3"));
    }

    #[test]
    fn json_summary_carries_every_counter() {
        let line = summary_line("retry", &summary(), true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["command"], "retry");
        assert_eq!(value["forced"], true);
        assert_eq!(value["delivered"], 3);
        assert_eq!(value["alarms_sent"], 1);
    }
}
