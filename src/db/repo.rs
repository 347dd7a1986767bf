use super::LedgerError;
use crate::model::{BatchErrorEntry, BatchRecord, BatchStatus};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

pub type Pool = SqlitePool;

/// Default ledger location, relative to the user's home directory.
pub const DEFAULT_DB_PATH: &str = "~/.mailgoat/batches.db";

pub async fn init_pool(database_url: &str) -> Result<Pool, LedgerError> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL lets `batch status` read while a run is writing; FULL sync makes
    // every committed step survive a crash.
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Open (creating if needed) the ledger database at `path` and bring its
/// schema up to date.
pub async fn open(path: &Path) -> Result<Pool, LedgerError> {
    let pool = init_pool(&database_url_for_path(path)).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

pub fn database_url_for_path(path: &Path) -> String {
    format!("sqlite://{}", path.display())
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    // In-memory URLs like sqlite::memory: or sqlite::memory:?cache=shared
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = expand_home(path_part);

    // Connecting reports the real error if this fails.
    if let Some(parent) = Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

/// Expand a leading `~/` to `$HOME`. Other paths are returned unchanged.
pub fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home.trim_end_matches('/'), rest);
        }
    }
    path.to_string()
}

pub async fn run_migrations(pool: &Pool) -> Result<(), LedgerError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all, fields(batch_id = %batch_id))]
pub async fn create_batch(
    pool: &Pool,
    batch_id: &str,
    total_count: i64,
    continue_on_error: bool,
    rate_limit: Option<f64>,
) -> Result<(), LedgerError> {
    let mut tx = pool.begin().await?;
    let existing = sqlx::query_scalar::<_, String>("SELECT batch_id FROM batches WHERE batch_id = ?")
        .bind(batch_id)
        .fetch_optional(&mut *tx)
        .await?;
    if existing.is_some() {
        return Err(LedgerError::DuplicateBatch(batch_id.to_string()));
    }
    sqlx::query(
        "INSERT INTO batches (batch_id, status, total_count, sent_count, failed_count, continue_on_error, rate_limit, started_at, finished_at) \
         VALUES (?, ?, ?, 0, 0, ?, ?, ?, NULL)",
    )
    .bind(batch_id)
    .bind(BatchStatus::Running.as_str())
    .bind(total_count)
    .bind(continue_on_error)
    .bind(rate_limit)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Overwrite the counters of a batch. Callers keep them non-decreasing; the
/// ledger only rejects negative values.
#[instrument(skip_all)]
pub async fn update_counts(
    pool: &Pool,
    batch_id: &str,
    sent_count: i64,
    failed_count: i64,
) -> Result<(), LedgerError> {
    if sent_count < 0 || failed_count < 0 {
        return Err(LedgerError::NegativeCount {
            sent: sent_count,
            failed: failed_count,
        });
    }
    let result =
        sqlx::query("UPDATE batches SET sent_count = ?, failed_count = ? WHERE batch_id = ?")
            .bind(sent_count)
            .bind(failed_count)
            .bind(batch_id)
            .execute(pool)
            .await?;
    if result.rows_affected() == 0 {
        return Err(LedgerError::NotFound(batch_id.to_string()));
    }
    Ok(())
}

/// Move a batch to a terminal status and stamp `finished_at`.
///
/// Repeating the same terminal status is a no-op and keeps the original
/// `finished_at`. Any other transition out of a terminal status is rejected.
#[instrument(skip_all)]
pub async fn complete_batch(
    pool: &Pool,
    batch_id: &str,
    status: BatchStatus,
) -> Result<(), LedgerError> {
    let mut tx = pool.begin().await?;
    let current = sqlx::query_scalar::<_, String>("SELECT status FROM batches WHERE batch_id = ?")
        .bind(batch_id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(current) = current else {
        return Err(LedgerError::NotFound(batch_id.to_string()));
    };
    let current = parse_status(batch_id, &current)?;

    if current.is_terminal() && current == status {
        return Ok(());
    }
    if current.is_terminal() || !status.is_terminal() {
        return Err(LedgerError::InvalidTransition {
            batch_id: batch_id.to_string(),
            from: current,
            to: status,
        });
    }

    sqlx::query("UPDATE batches SET status = ?, finished_at = ? WHERE batch_id = ?")
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn add_error(
    pool: &Pool,
    batch_id: &str,
    recipient: Option<&str>,
    error: &str,
) -> Result<i64, LedgerError> {
    // `execute` runs the insert to completion, so the row is committed on return.
    let result = sqlx::query(
        "INSERT INTO batch_errors (batch_id, recipient, error, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(batch_id)
    .bind(recipient)
    .bind(error)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

#[instrument(skip_all)]
pub async fn get_batch(pool: &Pool, batch_id: &str) -> Result<Option<BatchRecord>, LedgerError> {
    let row = sqlx::query(
        "SELECT batch_id, status, total_count, sent_count, failed_count, continue_on_error, rate_limit, started_at, finished_at \
         FROM batches WHERE batch_id = ?",
    )
    .bind(batch_id)
    .fetch_optional(pool)
    .await?;
    row.map(|row| batch_from_row(&row)).transpose()
}

/// Most recently started batches first.
#[instrument(skip_all)]
pub async fn list_batches(pool: &Pool, limit: i64) -> Result<Vec<BatchRecord>, LedgerError> {
    let rows = sqlx::query(
        "SELECT batch_id, status, total_count, sent_count, failed_count, continue_on_error, rate_limit, started_at, finished_at \
         FROM batches ORDER BY started_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(batch_from_row).collect()
}

/// Audit rows for a batch in the order they were recorded.
#[instrument(skip_all)]
pub async fn list_errors(pool: &Pool, batch_id: &str) -> Result<Vec<BatchErrorEntry>, LedgerError> {
    let rows = sqlx::query(
        "SELECT id, batch_id, recipient, error, created_at FROM batch_errors WHERE batch_id = ? ORDER BY id ASC",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;

    let entries = rows
        .into_iter()
        .map(|row| -> Result<BatchErrorEntry, LedgerError> {
            Ok(BatchErrorEntry {
                id: row.try_get("id")?,
                batch_id: row.try_get("batch_id")?,
                recipient: row.try_get::<Option<String>, _>("recipient")?,
                error: row.try_get("error")?,
                created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

fn batch_from_row(row: &SqliteRow) -> Result<BatchRecord, LedgerError> {
    let batch_id: String = row.try_get("batch_id")?;
    let status_str: String = row.try_get("status")?;
    let status = parse_status(&batch_id, &status_str)?;

    Ok(BatchRecord {
        status,
        total_count: row.try_get("total_count")?,
        sent_count: row.try_get("sent_count")?,
        failed_count: row.try_get("failed_count")?,
        continue_on_error: row.try_get("continue_on_error")?,
        rate_limit: row.try_get::<Option<f64>, _>("rate_limit")?,
        started_at: row.try_get::<DateTime<Utc>, _>("started_at")?,
        finished_at: row.try_get::<Option<DateTime<Utc>>, _>("finished_at")?,
        batch_id,
    })
}

fn parse_status(batch_id: &str, value: &str) -> Result<BatchStatus, LedgerError> {
    BatchStatus::parse_status(value).ok_or_else(|| LedgerError::UnknownStatus {
        batch_id: batch_id.to_string(),
        status: value.to_string(),
    })
}
