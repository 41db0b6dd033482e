//! Per-day status log and the `last_status` cell shown in the UI.
//!
//! Every user-visible status line lands in `tracking_YYYY-MM-DD.log` with an
//! ISO timestamp prefix and is kept as the most recent status for the web
//! surface. Structured diagnostics go through `tracing` separately.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Local;
use tracing::warn;

#[derive(Debug)]
struct Inner {
    last_status: String,
}

/// Append-only per-day log plus the latest status string.
#[derive(Debug)]
pub struct StatusLog {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl StatusLog {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            inner: Mutex::new(Inner {
                last_status: String::new(),
            }),
        }
    }

    /// Record a status line: remember it as `last_status` and append it to
    /// today's log file. Log-file I/O failures are reported but never
    /// propagate into the guiding loops.
    pub fn record(&self, status: impl Into<String>) {
        let status = status.into();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.last_status = status.clone();
        }
        let now = Local::now();
        let line = format!("{}, {}\n", now.format("%Y-%m-%d %H:%M:%S"), status);
        let path = self.dir.join(format!("tracking_{}.log", now.format("%Y-%m-%d")));
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!("failed to append to {}: {}", path.display(), e);
        }
    }

    pub fn last_status(&self) -> String {
        self.inner.lock().unwrap().last_status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_updates_last_status_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = StatusLog::new(dir.path().to_path_buf());

        log.record("ADDED STAR at (321.7, 240.3)");
        log.record("LOST TRACKING: Tracked stars not detected.");
        assert_eq!(log.last_status(), "LOST TRACKING: Tracked stars not detected.");

        let day = Local::now().format("%Y-%m-%d").to_string();
        let contents =
            std::fs::read_to_string(dir.path().join(format!("tracking_{day}.log"))).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("ADDED STAR at (321.7, 240.3)"));
        // ISO date prefix.
        assert!(lines[0].starts_with(&day));
    }

    #[test]
    fn last_status_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = StatusLog::new(dir.path().to_path_buf());
        assert_eq!(log.last_status(), "");
    }
}
