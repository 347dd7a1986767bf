//! Single-line progress indicator for batch runs.
use std::io::Write;

const BAR_WIDTH: usize = 24;

/// Render `[#####---] current/total sent=S failed=F`. An empty batch renders as
/// complete.
pub fn render_progress(current: usize, total: usize, sent: i64, failed: i64) -> String {
    let filled = if total == 0 {
        BAR_WIDTH
    } else {
        (current.min(total) * BAR_WIDTH) / total
    };
    let bar = format!("{}{}", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled));
    format!("[{bar}] {current}/{total} sent={sent} failed={failed}")
}

/// Observer for executor progress. Implementations must not influence control flow.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, current: usize, total: usize, sent: i64, failed: i64);

    /// Called once after the last report of a run.
    fn finish(&self) {}
}

/// Rewrites one line on stderr; stdout stays reserved for command output.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalProgress;

impl ProgressReporter for TerminalProgress {
    fn report(&self, current: usize, total: usize, sent: i64, failed: i64) {
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\r{}", render_progress(current, total, sent, failed));
        let _ = err.flush();
    }

    fn finish(&self) {
        let _ = writeln!(std::io::stderr());
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _current: usize, _total: usize, _sent: i64, _failed: i64) {}
}
