//! Buffered per-attempt log files.
//!
//! Layout: `<log root>/<runnerJobId>-attempt-<first8OfAttemptId>.log`.
//! Lines are `[<ISO-8601 timestamp>] [<phase>] <content>`; phase boundaries
//! get `========== <PHASE> SECTION START/END ==========` markers. Appends
//! are buffered and flushed every 100 ms, or synchronously on shutdown.

use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

use super::types::Phase;

pub const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Path for an attempt's log file under `log_root`.
pub fn attempt_log_path(log_root: &Path, runner_job_id: &str, attempt_id: &str) -> PathBuf {
    let short: String = attempt_id.chars().take(8).collect();
    log_root.join(format!("{runner_job_id}-attempt-{short}.log"))
}

#[derive(Clone)]
pub struct AttemptLog {
    inner: Arc<LogInner>,
}

struct LogInner {
    path: PathBuf,
    buffer: Mutex<String>,
    flusher_armed: AtomicBool,
}

impl AttemptLog {
    pub fn create(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Touch the file so the path is valid even before the first flush.
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            inner: Arc::new(LogInner {
                path,
                buffer: Mutex::new(String::new()),
                flusher_armed: AtomicBool::new(false),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn append(&self, phase: Phase, content: &str) {
        let timestamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let line = format!("[{timestamp}] [{phase}] {content}\n");
        self.buffer_line(line);
    }

    pub fn section_start(&self, phase: Phase) {
        self.buffer_line(format!("========== {} SECTION START ==========\n", phase.marker()));
    }

    pub fn section_end(&self, phase: Phase) {
        self.buffer_line(format!("========== {} SECTION END ==========\n", phase.marker()));
    }

    fn buffer_line(&self, line: String) {
        self.inner.buffer.lock().unwrap().push_str(&line);
        if self.inner.flusher_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(FLUSH_INTERVAL).await;
            inner.flusher_armed.store(false, Ordering::SeqCst);
            if let Err(e) = LogInner::flush(&inner) {
                warn!("failed to flush log {}: {e}", inner.path.display());
            }
        });
    }

    /// Synchronous flush of anything buffered (shutdown path).
    pub fn flush(&self) -> std::io::Result<()> {
        LogInner::flush(&self.inner)
    }
}

impl LogInner {
    fn flush(inner: &Arc<LogInner>) -> std::io::Result<()> {
        let pending = {
            let mut buffer = inner.buffer.lock().unwrap();
            if buffer.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&inner.path)?;
        file.write_all(pending.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_uses_first8_of_attempt_id() {
        let path = attempt_log_path(
            Path::new("/logs"),
            "runner-1",
            "0b5c4f1e-9a2d-4e8b-b7c3-1f2a3b4c5d6e",
        );
        assert_eq!(path, PathBuf::from("/logs/runner-1-attempt-0b5c4f1e.log"));
    }

    #[tokio::test]
    async fn lines_carry_timestamp_and_phase() {
        let dir = tempfile::tempdir().unwrap();
        let log = AttemptLog::create(dir.path().join("a.log")).unwrap();

        log.section_start(Phase::Work);
        log.append(Phase::Work, "building");
        log.section_end(Phase::Work);
        log.flush().unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "========== WORK SECTION START ==========");
        assert!(lines[1].starts_with('['));
        assert!(lines[1].contains("] [work] building"));
        assert_eq!(lines[2], "========== WORK SECTION END ==========");
    }

    #[tokio::test]
    async fn background_flush_happens() {
        let dir = tempfile::tempdir().unwrap();
        let log = AttemptLog::create(dir.path().join("b.log")).unwrap();
        log.append(Phase::Prechecks, "lint ok");
        tokio::time::sleep(FLUSH_INTERVAL * 3).await;
        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert!(contents.contains("lint ok"));
    }
}
