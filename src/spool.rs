//! On-disk durability for backend writes.
//!
//! When a backend write fails, the value is serialized to
//! `{spool}/{subdir}/{ns-timestamp}.json`; the nanosecond filename gives
//! total arrival ordering. A single flusher task walks each registered
//! subdirectory every 30 seconds in filename order and replays files through
//! the subdirectory's flusher. Files are never modified in place: the only
//! terminal transitions are delete (flushed) and rename to `.error`
//! (unparseable), which together give FIFO, at-least-once replay.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::SpoolError;

/// How often registered subdirectories are walked.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Replays one spool file's bytes into the backend.
///
/// Returning [`SpoolError::Unparseable`] quarantines the file; any other
/// error leaves it in place and stops this subdirectory's walk for the cycle.
pub type Flusher = Box<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<(), SpoolError>> + Send + Sync>;

/// Serialize `value` into the spool for later replay.
pub async fn write_to_spool(
    dir: &Path,
    subdir: &str,
    value: &impl Serialize,
) -> Result<(), SpoolError> {
    let parent = dir.join(subdir);
    tokio::fs::create_dir_all(&parent).await?;

    let ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let path = parent.join(format!("{ns}.json"));

    let contents = serde_json::to_vec_pretty(value).map_err(|e| SpoolError::Flush {
        reason: format!("serializing spool value: {e}"),
    })?;
    tokio::fs::write(&path, contents).await?;
    tracing::info!(path = %path.display(), "spooled value for later flush");
    Ok(())
}

/// The periodic flusher over a spool directory.
pub struct Spool {
    dir: PathBuf,
    flushers: Vec<(String, Flusher)>,
}

impl Spool {
    /// Create a spool rooted at `dir`, ensuring it is writable.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SpoolError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let probe = dir.join(".writable");
        std::fs::write(&probe, b"")?;
        std::fs::remove_file(&probe)?;
        Ok(Spool {
            dir,
            flushers: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Register `flusher` for `{spool}/{subdir}`, creating the subdirectory.
    pub fn register(&mut self, subdir: &str, flusher: Flusher) -> Result<(), SpoolError> {
        std::fs::create_dir_all(self.dir.join(subdir))?;
        self.flushers.push((subdir.to_string(), flusher));
        Ok(())
    }

    /// Run flush cycles until `shutdown` flips. Consumes the spool; callers
    /// hold the directory path separately if they need it afterwards.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.flush_all().await,
                _ = shutdown.changed() => {
                    tracing::info!("spool flusher exiting");
                    return;
                }
            }
        }
    }

    /// Walk every registered subdirectory once.
    pub async fn flush_all(&self) {
        for (subdir, flusher) in &self.flushers {
            if let Err(e) = flush_dir(&self.dir.join(subdir), flusher).await {
                tracing::warn!(subdir = %subdir, error = %e, "spool flush stopped for this cycle");
            }
        }
    }
}

/// Flush one subdirectory in filename order, stopping at the first flusher
/// failure so later files wait for earlier ones.
async fn flush_dir(dir: &Path, flusher: &Flusher) -> Result<(), SpoolError> {
    let mut entries: Vec<PathBuf> = Vec::new();
    let mut reader = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = reader.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            entries.push(path);
        }
    }
    entries.sort();

    for path in entries {
        let contents = tokio::fs::read(&path).await?;
        match flusher(contents).await {
            Ok(()) => {
                tokio::fs::remove_file(&path).await?;
                tracing::debug!(path = %path.display(), "flushed spool file");
            }
            Err(SpoolError::Unparseable { reason }) => {
                let quarantined = path.with_extension("json.error");
                tracing::error!(path = %path.display(), %reason, "quarantining unparseable spool file");
                tokio::fs::rename(&path, &quarantined).await?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use tokio::sync::Mutex;

    use super::*;

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn write_creates_ordered_json_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_to_spool(tmp.path(), "statuses", &serde_json::json!({"n": 1}))
            .await
            .expect("write");
        write_to_spool(tmp.path(), "statuses", &serde_json::json!({"n": 2}))
            .await
            .expect("write");

        let files = names(&tmp.path().join("statuses"));
        assert_eq!(files.len(), 2);
        assert!(files[0] < files[1]);
        assert!(files.iter().all(|f| f.ends_with(".json")));
    }

    #[tokio::test]
    async fn flushes_in_filename_order_and_stops_on_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("statuses");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("1.json"), br#"{"n":1}"#).expect("write");
        std::fs::write(dir.join("2.json"), br#"{"n":2}"#).expect("write");
        std::fs::write(dir.join("3.json"), br#"{"n":3}"#).expect("write");

        let flushed: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let failing = Arc::new(AtomicBool::new(true));

        let mut spool = Spool::new(tmp.path()).expect("spool");
        let flushed_in = Arc::clone(&flushed);
        let failing_in = Arc::clone(&failing);
        spool
            .register(
                "statuses",
                Box::new(move |bytes: Vec<u8>| {
                    let flushed = Arc::clone(&flushed_in);
                    let failing = Arc::clone(&failing_in);
                    async move {
                        let value: serde_json::Value =
                            serde_json::from_slice(&bytes).map_err(|e| SpoolError::Unparseable {
                                reason: e.to_string(),
                            })?;
                        let n = value["n"].as_i64().unwrap_or(0);
                        if n == 2 && failing.load(Ordering::SeqCst) {
                            return Err(SpoolError::Flush {
                                reason: "backend down".to_string(),
                            });
                        }
                        flushed.lock().await.push(n);
                        Ok(())
                    }
                    .boxed()
                }),
            )
            .expect("register");

        // first cycle: 1 flushes, 2 fails, 3 must be left untouched
        spool.flush_all().await;
        assert_eq!(*flushed.lock().await, vec![1]);
        assert_eq!(names(&dir), vec!["2.json", "3.json"]);

        // backend recovers: 2 then 3 flush in order
        failing.store(false, Ordering::SeqCst);
        spool.flush_all().await;
        assert_eq!(*flushed.lock().await, vec![1, 2, 3]);
        assert_eq!(names(&dir), Vec::<String>::new());
    }

    #[tokio::test]
    async fn unparseable_files_are_quarantined_not_retried() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("msgs");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("1.json"), b"{not json").expect("write");
        std::fs::write(dir.join("2.json"), br#"{"n":2}"#).expect("write");

        let flushed: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let mut spool = Spool::new(tmp.path()).expect("spool");
        let flushed_in = Arc::clone(&flushed);
        spool
            .register(
                "msgs",
                Box::new(move |bytes: Vec<u8>| {
                    let flushed = Arc::clone(&flushed_in);
                    async move {
                        let value: serde_json::Value =
                            serde_json::from_slice(&bytes).map_err(|e| SpoolError::Unparseable {
                                reason: e.to_string(),
                            })?;
                        flushed.lock().await.push(value["n"].as_i64().unwrap_or(0));
                        Ok(())
                    }
                    .boxed()
                }),
            )
            .expect("register");

        spool.flush_all().await;
        assert_eq!(*flushed.lock().await, vec![2]);
        assert_eq!(names(&dir), vec!["1.json.error"]);

        // the quarantined file is never re-read
        spool.flush_all().await;
        assert_eq!(*flushed.lock().await, vec![2]);
        assert_eq!(names(&dir), vec!["1.json.error"]);
    }
}
