//! Out-of-band cancellation of requests the server is already working on.
//!
//! The server polls for a file named `<pipe name><seq>` while it processes
//! request `seq`; creating that file asks it to abandon the work. There is no
//! acknowledgement, so this is only ever a courtesy signal.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use uuid::Uuid;

/// Generate a fresh pipe name in the system temp directory.
#[must_use]
pub fn generate_pipe_name() -> PathBuf {
    std::env::temp_dir().join(format!("tscancellation-{}.tmp", Uuid::new_v4().simple()))
}

/// Server argument value for a pipe name: the server substitutes the request
/// sequence number for the trailing `*`.
#[must_use]
pub fn pipe_argument(pipe_name: &Path) -> String {
    format!("{}*", pipe_name.display())
}

enum SentinelOp {
    Create { seq: u64, path: PathBuf },
    Remove { seq: u64, path: PathBuf },
    #[cfg(test)]
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// Applies sentinel operations in order, off the event loop.
async fn run_sentinel_ops(mut ops: mpsc::UnboundedReceiver<SentinelOp>) {
    while let Some(op) = ops.recv().await {
        match op {
            SentinelOp::Create { seq, path } => match tokio::fs::write(&path, b"").await {
                Ok(()) => tracing::debug!(seq, path = %path.display(), "Wrote cancellation sentinel"),
                Err(e) => tracing::debug!(seq, "Failed to write cancellation sentinel: {e}"),
            },
            SentinelOp::Remove { seq, path } => {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::debug!(seq, "Failed to remove cancellation sentinel: {e}");
                }
            }
            #[cfg(test)]
            SentinelOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[derive(Debug)]
struct Pipe {
    name: PathBuf,
    ops: mpsc::UnboundedSender<SentinelOp>,
}

#[derive(Debug, Default)]
pub(crate) struct CancellationBridge {
    /// `None` when the running server does not watch for sentinels.
    pipe: Option<Pipe>,
    signalled: HashSet<u64>,
}

impl CancellationBridge {
    /// A bridge for `pipe_name`. With a pipe this spawns the task that does
    /// the file IO, so it must be called inside a tokio runtime.
    pub fn new(pipe_name: Option<PathBuf>) -> Self {
        let pipe = pipe_name.map(|name| {
            let (ops, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_sentinel_ops(rx));
            Pipe { name, ops }
        });
        Self {
            pipe,
            signalled: HashSet::new(),
        }
    }

    #[cfg(test)]
    pub fn is_supported(&self) -> bool {
        self.pipe.is_some()
    }

    fn sentinel_path(pipe: &Pipe, seq: u64) -> PathBuf {
        let mut name = OsString::from(pipe.name.as_os_str());
        name.push(seq.to_string());
        PathBuf::from(name)
    }

    /// Ask the server to stop working on `seq`. Returns whether a sentinel was
    /// requested; the file itself is written in the background.
    pub fn signal(&mut self, seq: u64) -> bool {
        let Some(pipe) = &self.pipe else {
            return false;
        };
        let path = Self::sentinel_path(pipe, seq);
        if pipe.ops.send(SentinelOp::Create { seq, path }).is_err() {
            return false;
        }
        self.signalled.insert(seq);
        true
    }

    /// Remove the sentinel for `seq` once its response has arrived.
    pub fn cleanup(&mut self, seq: u64) {
        if !self.signalled.remove(&seq) {
            return;
        }
        if let Some(pipe) = &self.pipe {
            let path = Self::sentinel_path(pipe, seq);
            let _ = pipe.ops.send(SentinelOp::Remove { seq, path });
        }
    }

    /// Remove every sentinel this instance wrote.
    pub fn cleanup_all(&mut self) {
        let seqs: Vec<u64> = self.signalled.iter().copied().collect();
        for seq in seqs {
            self.cleanup(seq);
        }
    }

    /// Wait until every operation issued so far has hit the disk.
    #[cfg(test)]
    pub async fn flush(&self) {
        let Some(pipe) = &self.pipe else {
            return;
        };
        let (done, rx) = tokio::sync::oneshot::channel();
        if pipe.ops.send(SentinelOp::Flush(done)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl Drop for CancellationBridge {
    fn drop(&mut self) {
        self.cleanup_all();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn bridge_in(dir: &tempfile::TempDir) -> (CancellationBridge, PathBuf) {
        let pipe = dir.path().join("tscancellation-test.tmp");
        (CancellationBridge::new(Some(pipe.clone())), pipe)
    }

    fn sentinel(pipe: &Path, seq: u64) -> PathBuf {
        PathBuf::from(format!("{}{seq}", pipe.display()))
    }

    #[tokio::test]
    async fn test_signal_writes_empty_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let (mut bridge, pipe) = bridge_in(&dir);

        assert!(bridge.signal(7));
        bridge.flush().await;
        let path = sentinel(&pipe, 7);
        assert!(path.exists());
        assert_eq!(fs::read(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let (mut bridge, pipe) = bridge_in(&dir);

        bridge.signal(3);
        bridge.cleanup(3);
        // Cleaning up an unsignalled seq is a no-op.
        bridge.cleanup(4);
        bridge.flush().await;
        assert!(!sentinel(&pipe, 3).exists());
    }

    #[tokio::test]
    async fn test_cleanup_all_removes_outstanding_sentinels() {
        let dir = tempfile::tempdir().unwrap();
        let (mut bridge, pipe) = bridge_in(&dir);
        bridge.signal(1);
        bridge.signal(2);
        bridge.flush().await;
        assert!(sentinel(&pipe, 1).exists());

        bridge.cleanup_all();
        bridge.flush().await;
        assert!(!sentinel(&pipe, 1).exists());
        assert!(!sentinel(&pipe, 2).exists());
    }

    #[test]
    fn test_unsupported_bridge_never_writes() {
        let mut bridge = CancellationBridge::new(None);
        assert!(!bridge.is_supported());
        assert!(!bridge.signal(1));
    }

    #[test]
    fn test_pipe_name_shape() {
        let pipe = generate_pipe_name();
        let name = pipe.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("tscancellation-"));
        assert!(name.ends_with(".tmp"));
        assert!(pipe_argument(&pipe).ends_with(".tmp*"));
    }
}
