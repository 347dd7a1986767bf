//! Sequential batch executor: sends one message per recipient row, keeps the
//! ledger current after every attempt and applies the rate limit and the
//! continue/abort policy.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::client::MailTransport;
use crate::db::{self, Pool};
use crate::error::BatchError;
use crate::model::{recipient_address, BatchStatus, BatchSummary, RecipientRow};
use crate::payload::PayloadBuilder;
use crate::progress::ProgressReporter;

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Keep going after a failed recipient instead of stopping the batch.
    pub continue_on_error: bool,
    /// Messages per second. Non-positive or non-finite values disable pacing.
    pub rate_limit: Option<f64>,
    /// Defaults to `batch_<id>_errors.log` in the working directory.
    pub error_log_path: Option<PathBuf>,
    /// Sender used when the payload carries none.
    pub default_from_address: Option<String>,
    /// Set to `true` to stop the run before the next recipient.
    pub cancel: Option<watch::Receiver<bool>>,
}

pub fn default_error_log_path(batch_id: &str) -> PathBuf {
    PathBuf::from(format!("batch_{batch_id}_errors.log"))
}

pub fn new_batch_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Time between sends for a rate in messages per second. Rates so small that
/// the interval does not fit a `Duration` are rejected.
pub fn send_interval(rate_limit: Option<f64>) -> Result<Option<Duration>, BatchError> {
    let Some(rate) = rate_limit.filter(|rate| rate.is_finite() && *rate > 0.0) else {
        return Ok(None);
    };
    Duration::try_from_secs_f64(1.0 / rate)
        .map(Some)
        .map_err(|_| BatchError::Input(format!("rate limit {rate} is too small")))
}

#[instrument(skip_all, fields(total = recipients.len()))]
pub async fn run_batch(
    pool: &Pool,
    transport: &dyn MailTransport,
    recipients: &[RecipientRow],
    builder: &dyn PayloadBuilder,
    options: &BatchOptions,
    progress: &dyn ProgressReporter,
) -> Result<BatchSummary, BatchError> {
    let interval = send_interval(options.rate_limit)?;
    let batch_id = new_batch_id();
    let total = recipients.len();
    db::create_batch(
        pool,
        &batch_id,
        total as i64,
        options.continue_on_error,
        options.rate_limit.filter(|rate| rate.is_finite()),
    )
    .await?;
    info!(batch_id = %batch_id, total, "batch started");

    let log_path = options
        .error_log_path
        .clone()
        .unwrap_or_else(|| default_error_log_path(&batch_id));
    let mut cancel = options.cancel.clone();
    let start = Instant::now();

    let mut sent: i64 = 0;
    let mut failed: i64 = 0;

    for (idx, row) in recipients.iter().enumerate() {
        let index = idx + 1;

        if is_cancelled(&cancel) {
            db::update_counts(pool, &batch_id, sent, failed).await?;
            db::complete_batch(pool, &batch_id, BatchStatus::Failed).await?;
            progress.finish();
            warn!(batch_id = %batch_id, sent, failed, "batch cancelled");
            return Err(BatchError::Cancelled { batch_id });
        }

        match deliver(transport, builder, row, options.default_from_address.as_deref()).await {
            Ok(message_id) => {
                sent += 1;
                debug!(batch_id = %batch_id, index, message_id = %message_id, "message sent");
            }
            Err(err) => {
                failed += 1;
                let recipient = recipient_address(row);
                let message = err.to_string();
                warn!(
                    batch_id = %batch_id,
                    index,
                    recipient = recipient.as_deref().unwrap_or(""),
                    error = %message,
                    "message failed"
                );

                append_error_log(&log_path, recipient.as_deref(), &message).await;
                if let Err(log_err) =
                    db::add_error(pool, &batch_id, recipient.as_deref(), &message).await
                {
                    warn!(?log_err, batch_id = %batch_id, "failed to record batch error");
                }

                if !options.continue_on_error {
                    db::update_counts(pool, &batch_id, sent, failed).await?;
                    progress.report(index, total, sent, failed);
                    db::complete_batch(pool, &batch_id, BatchStatus::Failed).await?;
                    progress.finish();
                    warn!(batch_id = %batch_id, index, "batch aborted on first failure");
                    return Err(BatchError::Aborted {
                        batch_id,
                        source: Box::new(err),
                    });
                }
            }
        }

        db::update_counts(pool, &batch_id, sent, failed).await?;
        progress.report(index, total, sent, failed);

        if let Some(interval) = interval {
            let deadline = u32::try_from(index)
                .ok()
                .and_then(|n| interval.checked_mul(n))
                .and_then(|offset| start.checked_add(offset));
            match deadline {
                Some(deadline) if index < total => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {}
                        _ = cancel_requested(&mut cancel) => {}
                    }
                }
                Some(_) => {}
                None => warn!(batch_id = %batch_id, index, "send schedule overflowed; not pausing"),
            }
        }
    }

    let status = if failed == 0 {
        BatchStatus::Completed
    } else {
        BatchStatus::CompletedWithErrors
    };
    db::complete_batch(pool, &batch_id, status).await?;
    progress.finish();

    let record = db::get_batch(pool, &batch_id).await?.ok_or_else(|| {
        BatchError::Internal(format!("batch {batch_id} disappeared from the ledger"))
    })?;
    info!(
        batch_id = %batch_id,
        status = %record.status,
        sent = record.sent_count,
        failed = record.failed_count,
        "batch finished"
    );
    Ok(record.into())
}

async fn deliver(
    transport: &dyn MailTransport,
    builder: &dyn PayloadBuilder,
    row: &RecipientRow,
    default_from: Option<&str>,
) -> Result<String, BatchError> {
    let payload = builder.build(row)?;
    let from = payload.from_address.as_deref().or(default_from);
    let message_id = transport
        .send(&payload.to, &payload.subject, &payload.body, from)
        .await?;
    Ok(message_id)
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().is_some_and(|rx| *rx.borrow())
}

/// Resolves once cancellation is requested. Never resolves without a signal
/// or after the sender is gone.
async fn cancel_requested(cancel: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = cancel {
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
    std::future::pending::<()>().await
}

/// One line per failure. The file is opened and closed each time so an
/// interrupted run leaves a complete log behind.
async fn append_error_log(path: &Path, recipient: Option<&str>, message: &str) {
    let line = format!("recipient={} error={}\n", recipient.unwrap_or(""), message);
    if let Err(err) = append_line(path, &line).await {
        warn!(?err, path = %path.display(), "failed to append to error log");
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}
