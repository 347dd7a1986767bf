use async_trait::async_trait;
use mailgoat::batch::{run_batch, BatchOptions};
use mailgoat::client::{ClientError, MailTransport};
use mailgoat::db::{self, Pool};
use mailgoat::error::BatchError;
use mailgoat::model::{BatchStatus, RecipientRow};
use mailgoat::payload::{BatchTemplate, TemplatePayloadBuilder};
use mailgoat::progress::{NoProgress, ProgressReporter};
use serde_json::json;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::watch;

async fn setup_pool(dir: &TempDir) -> Pool {
    db::open(&dir.path().join("batches.db")).await.unwrap()
}

#[derive(Debug, Clone, PartialEq)]
struct SendCall {
    to: String,
    subject: String,
    body: String,
    from_address: Option<String>,
    /// `(sent, failed)` in the ledger when the call was made.
    ledger_counts: Option<(i64, i64)>,
}

#[derive(Clone, Default)]
struct RecordingTransport {
    responses: Arc<Mutex<VecDeque<Result<String, ClientError>>>>,
    calls: Arc<Mutex<Vec<SendCall>>>,
    pool: Option<Pool>,
}

impl RecordingTransport {
    fn with_responses(responses: Vec<Result<String, ClientError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    fn watching(mut self, pool: &Pool) -> Self {
        self.pool = Some(pool.clone());
        self
    }

    fn calls(&self) -> Vec<SendCall> {
        self.calls.lock().unwrap().clone()
    }
}

fn api_error(message: &str) -> ClientError {
    ClientError::Api {
        status: 500,
        message: message.to_string(),
        payload: None,
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        from_address: Option<&str>,
    ) -> Result<String, ClientError> {
        let ledger_counts = match &self.pool {
            Some(pool) => {
                let batches = db::list_batches(pool, 1).await.unwrap();
                batches.first().map(|b| (b.sent_count, b.failed_count))
            }
            None => None,
        };
        self.calls.lock().unwrap().push(SendCall {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            from_address: from_address.map(str::to_string),
            ledger_counts,
        });
        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(format!("msg-{to}")))
    }
}

#[derive(Default)]
struct RecordingProgress {
    reports: Mutex<Vec<(usize, usize, i64, i64)>>,
    finished: Mutex<usize>,
}

impl ProgressReporter for RecordingProgress {
    fn report(&self, current: usize, total: usize, sent: i64, failed: i64) {
        self.reports
            .lock()
            .unwrap()
            .push((current, total, sent, failed));
    }

    fn finish(&self) {
        *self.finished.lock().unwrap() += 1;
    }
}

fn rows(values: serde_json::Value) -> Vec<RecipientRow> {
    values
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect()
}

fn options(dir: &TempDir, continue_on_error: bool) -> BatchOptions {
    BatchOptions {
        continue_on_error,
        error_log_path: Some(dir.path().join("errors.log")),
        ..Default::default()
    }
}

fn read_log(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

#[tokio::test]
async fn continue_on_error_records_failure_and_finishes() {
    let dir = TempDir::new().unwrap();
    let pool = setup_pool(&dir).await;
    let transport =
        RecordingTransport::with_responses(vec![Ok("m1".into()), Err(api_error("mailbox full"))]);
    let recipients = rows(json!([
        { "to": "ok@example.com", "subject": "S1", "body": "B1" },
        { "to": "bad@example.com", "subject": "S2", "body": "B2" },
    ]));
    let progress = RecordingProgress::default();

    let summary = run_batch(
        &pool,
        &transport,
        &recipients,
        &TemplatePayloadBuilder::default(),
        &options(&dir, true),
        &progress,
    )
    .await
    .unwrap();

    assert_eq!(summary.total, 2);
    assert_eq!(summary.sent, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.status, BatchStatus::CompletedWithErrors);
    assert!(summary.finished_at.is_some());

    let log = read_log(&dir.path().join("errors.log"));
    assert!(log.contains("recipient=bad@example.com"));
    assert!(log.contains("mailbox full"));

    let errors = db::list_errors(&pool, &summary.batch_id).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].recipient.as_deref(), Some("bad@example.com"));
    assert!(errors[0].error.contains("mailbox full"));

    assert_eq!(
        *progress.reports.lock().unwrap(),
        vec![(1, 2, 1, 0), (2, 2, 1, 1)]
    );
    assert_eq!(*progress.finished.lock().unwrap(), 1);
}

#[tokio::test]
async fn abort_on_first_failure_marks_batch_failed() {
    let dir = TempDir::new().unwrap();
    let pool = setup_pool(&dir).await;
    let transport = RecordingTransport::with_responses(vec![Err(api_error("rejected"))]);
    let recipients = rows(json!([
        { "to": "first@example.com", "subject": "S", "body": "B" },
        { "to": "second@example.com", "subject": "S", "body": "B" },
    ]));

    let err = run_batch(
        &pool,
        &transport,
        &recipients,
        &TemplatePayloadBuilder::default(),
        &options(&dir, false),
        &NoProgress,
    )
    .await
    .unwrap_err();

    let (batch_id, source) = match err {
        BatchError::Aborted { batch_id, source } => (batch_id, source),
        other => panic!("expected abort, got {other:?}"),
    };
    assert!(matches!(*source, BatchError::Transport(ClientError::Api { .. })));
    assert_eq!(transport.calls().len(), 1);

    let record = db::get_batch(&pool, &batch_id).await.unwrap().unwrap();
    assert_eq!(record.status, BatchStatus::Failed);
    assert_eq!(record.sent_count, 0);
    assert_eq!(record.failed_count, 1);
    assert_eq!(record.total_count, 2);
    assert!(record.finished_at.is_some());
}

#[tokio::test]
async fn empty_batch_completes_without_log_or_delay() {
    let dir = TempDir::new().unwrap();
    let pool = setup_pool(&dir).await;
    let transport = RecordingTransport::default();
    let mut opts = options(&dir, false);
    opts.rate_limit = Some(0.5);

    let started = Instant::now();
    let summary = run_batch(
        &pool,
        &transport,
        &[],
        &TemplatePayloadBuilder::default(),
        &opts,
        &NoProgress,
    )
    .await
    .unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(summary.total, 0);
    assert_eq!(summary.sent, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.status, BatchStatus::Completed);
    assert!(!dir.path().join("errors.log").exists());
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn rate_limit_spaces_out_sends() {
    let dir = TempDir::new().unwrap();
    let pool = setup_pool(&dir).await;
    let transport = RecordingTransport::default();
    let recipients = rows(json!([
        { "to": "a@example.com" },
        { "to": "b@example.com" },
    ]));
    let mut opts = options(&dir, true);
    opts.rate_limit = Some(2.0);

    let started = Instant::now();
    let summary = run_batch(
        &pool,
        &transport,
        &recipients,
        &TemplatePayloadBuilder::default(),
        &opts,
        &NoProgress,
    )
    .await
    .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(450));
    assert_eq!(summary.sent, 2);
    assert_eq!(summary.status, BatchStatus::Completed);

    let record = db::get_batch(&pool, &summary.batch_id).await.unwrap().unwrap();
    assert_eq!(record.rate_limit, Some(2.0));
}

#[tokio::test]
async fn missing_to_is_counted_as_failure() {
    let dir = TempDir::new().unwrap();
    let pool = setup_pool(&dir).await;
    let transport = RecordingTransport::default();
    let recipients = rows(json!([
        { "subject": "no address" },
        { "to": "ok@example.com" },
    ]));

    let summary = run_batch(
        &pool,
        &transport,
        &recipients,
        &TemplatePayloadBuilder::default(),
        &options(&dir, true),
        &NoProgress,
    )
    .await
    .unwrap();

    assert_eq!(summary.sent, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(transport.calls().len(), 1);

    let log = read_log(&dir.path().join("errors.log"));
    assert_eq!(log, "recipient= error=recipient row is missing 'to'\n");

    let errors = db::list_errors(&pool, &summary.batch_id).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].recipient, None);
}

#[tokio::test]
async fn ledger_counts_never_decrease_during_run() {
    let dir = TempDir::new().unwrap();
    let pool = setup_pool(&dir).await;
    let transport = RecordingTransport::with_responses(vec![
        Ok("m1".into()),
        Err(api_error("boom")),
        Ok("m3".into()),
        Err(api_error("boom")),
        Ok("m5".into()),
    ])
    .watching(&pool);
    let recipients = rows(json!([
        { "to": "1@example.com" },
        { "to": "2@example.com" },
        { "to": "3@example.com" },
        { "to": "4@example.com" },
        { "to": "5@example.com" },
    ]));
    let progress = RecordingProgress::default();

    let summary = run_batch(
        &pool,
        &transport,
        &recipients,
        &TemplatePayloadBuilder::default(),
        &options(&dir, true),
        &progress,
    )
    .await
    .unwrap();

    let snapshots: Vec<(i64, i64)> = transport
        .calls()
        .iter()
        .map(|c| c.ledger_counts.unwrap())
        .collect();
    assert_eq!(snapshots, vec![(0, 0), (1, 0), (1, 1), (2, 1), (2, 2)]);
    for pair in snapshots.windows(2) {
        assert!(pair[1].0 >= pair[0].0 && pair[1].1 >= pair[0].1);
    }
    for (index, (sent, failed)) in snapshots.iter().enumerate() {
        assert_eq!((sent + failed) as usize, index);
    }

    let reports = progress.reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 5);
    assert_eq!(reports.last(), Some(&(5, 5, 3, 2)));

    assert_eq!(summary.sent + summary.failed, summary.total);
    assert_eq!(summary.status, BatchStatus::CompletedWithErrors);
}

#[tokio::test]
async fn terminal_batch_requery_is_stable() {
    let dir = TempDir::new().unwrap();
    let pool = setup_pool(&dir).await;
    let transport = RecordingTransport::default();
    let recipients = rows(json!([{ "to": "a@example.com" }]));

    let summary = run_batch(
        &pool,
        &transport,
        &recipients,
        &TemplatePayloadBuilder::default(),
        &options(&dir, false),
        &NoProgress,
    )
    .await
    .unwrap();

    let first = db::get_batch(&pool, &summary.batch_id).await.unwrap();
    let second = db::get_batch(&pool, &summary.batch_id).await.unwrap();
    assert!(first.is_some());
    assert_eq!(first, second);
    assert_eq!(first.unwrap().finished_at, summary.finished_at);
}

#[tokio::test]
async fn template_and_default_sender_reach_transport() {
    let dir = TempDir::new().unwrap();
    let pool = setup_pool(&dir).await;
    let transport = RecordingTransport::default();
    let recipients = rows(json!([
        { "to": "ada@example.com", "name": "Ada" },
        { "to": "bob@example.com", "name": "Bob" },
    ]));
    let builder = TemplatePayloadBuilder::new(Some(BatchTemplate {
        subject: "Hello {{name}}".into(),
        body: "Hi {{name}}, welcome.".into(),
        from: None,
    }));
    let mut opts = options(&dir, false);
    opts.default_from_address = Some("team@example.com".into());

    run_batch(&pool, &transport, &recipients, &builder, &opts, &NoProgress)
        .await
        .unwrap();

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].to, "ada@example.com");
    assert_eq!(calls[0].subject, "Hello Ada");
    assert_eq!(calls[1].body, "Hi Bob, welcome.");
    assert_eq!(calls[1].from_address.as_deref(), Some("team@example.com"));
}

#[tokio::test]
async fn cancellation_stops_before_next_recipient() {
    let dir = TempDir::new().unwrap();
    let pool = setup_pool(&dir).await;
    let transport = RecordingTransport::default();
    let recipients = rows(json!([
        { "to": "a@example.com" },
        { "to": "b@example.com" },
        { "to": "c@example.com" },
    ]));
    let (tx, rx) = watch::channel(false);
    let mut opts = options(&dir, true);
    // Slow enough that the signal lands during the first pause.
    opts.rate_limit = Some(1.0);
    opts.cancel = Some(rx);

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        tx
    });

    let started = Instant::now();
    let err = run_batch(
        &pool,
        &transport,
        &recipients,
        &TemplatePayloadBuilder::default(),
        &opts,
        &NoProgress,
    )
    .await
    .unwrap_err();
    let _tx = canceller.await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(900));
    let batch_id = match err {
        BatchError::Cancelled { batch_id } => batch_id,
        other => panic!("expected cancellation, got {other:?}"),
    };
    assert_eq!(transport.calls().len(), 1);

    let record = db::get_batch(&pool, &batch_id).await.unwrap().unwrap();
    assert_eq!(record.status, BatchStatus::Failed);
    assert_eq!(record.sent_count, 1);
    assert_eq!(record.failed_count, 0);
}

#[tokio::test]
async fn unusable_rate_limit_is_rejected_before_ledger_row() {
    let dir = TempDir::new().unwrap();
    let pool = setup_pool(&dir).await;
    let transport = RecordingTransport::default();
    let recipients = rows(json!([{ "to": "a@example.com" }]));
    let mut opts = options(&dir, true);
    opts.rate_limit = Some(1e-20);

    let err = run_batch(
        &pool,
        &transport,
        &recipients,
        &TemplatePayloadBuilder::default(),
        &opts,
        &NoProgress,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, BatchError::Input(_)), "got {err:?}");
    assert!(transport.calls().is_empty());
    assert!(db::list_batches(&pool, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn unwritable_ledger_stops_the_run() {
    let dir = TempDir::new().unwrap();
    let pool = setup_pool(&dir).await;
    pool.close().await;
    let transport = RecordingTransport::default();
    let recipients = rows(json!([
        { "to": "a@example.com" },
        { "to": "b@example.com" },
    ]));

    let err = run_batch(
        &pool,
        &transport,
        &recipients,
        &TemplatePayloadBuilder::default(),
        &options(&dir, true),
        &NoProgress,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, BatchError::Storage(_)), "got {err:?}");
    assert!(transport.calls().is_empty());
    assert!(!dir.path().join("errors.log").exists());
}
