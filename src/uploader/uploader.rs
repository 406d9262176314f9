// SPDX-License-Identifier: GPL-2.0-or-later

//! Bounded worker pool executing a recorded file's post-actions in order.
//!
//! Upload protocol specifics are out of scope here: `UploadClient` is an
//! abstract collaborator the embedder supplies, just like `SiteDriver` and
//! `Parser` are abstract elsewhere in the engine.

use async_trait::async_trait;
use common::{ArcLogger, LogEntry, LogLevel};
use registry::PostActionSpec;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// A finalized recording plus the post-actions it must run, in order.
#[derive(Clone, Debug)]
pub struct TaskGroup {
    pub filepath: String,
    pub actions: Vec<PostActionSpec>,
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("shell command exited non-zero: {0}")]
    Shell(String),
}

/// Abstract upload collaborator. The engine never speaks an upload protocol
/// itself; it hands the file and credentials to whatever is registered here.
#[async_trait]
pub trait UploadClient: Send + Sync {
    async fn upload(
        &self,
        filepath: &str,
        cookie_file: &str,
        threads: u32,
    ) -> Result<(), ActionError>;
}

/// Always succeeds without doing anything. Used where no real upload
/// collaborator is configured.
pub struct NoopUploadClient;

#[async_trait]
impl UploadClient for NoopUploadClient {
    async fn upload(&self, _filepath: &str, _cookie_file: &str, _threads: u32) -> Result<(), ActionError> {
        Ok(())
    }
}

async fn archive_file(filepath: &str) -> Result<(), ActionError> {
    let path = std::path::Path::new(filepath);
    let parent = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let archive_dir = parent.join("archive");
    tokio::fs::create_dir_all(&archive_dir).await?;
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| filepath.to_owned());
    let dest = archive_dir.join(base);

    match tokio::fs::rename(filepath, &dest).await {
        Ok(()) => Ok(()),
        // Cross-device rename: fall back to copy + fsync + chmod + remove.
        Err(_) => {
            tokio::fs::copy(filepath, &dest).await?;
            let file = tokio::fs::File::open(&dest).await?;
            file.sync_all().await?;
            drop(file);
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o644)).await?;
            }
            tokio::fs::remove_file(filepath).await?;
            Ok(())
        }
    }
}

async fn run_shell(filepath: &str, args: &[String], cancel: &CancellationToken) -> Result<(), ActionError> {
    let Some((program, rest)) = args.split_first() else {
        return Ok(());
    };
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(rest);
    cmd.env("FILE_PATH", filepath);

    let mut child = cmd.spawn().map_err(ActionError::Io)?;

    tokio::select! {
        () = cancel.cancelled() => {
            let _ = child.kill().await;
            Err(ActionError::Shell("cancelled".to_owned()))
        }
        status = child.wait() => {
            let status = status?;
            if status.success() {
                Ok(())
            } else {
                Err(ActionError::Shell(status.to_string()))
            }
        }
    }
}

async fn run_action(
    filepath: &str,
    action: &PostActionSpec,
    cancel: &CancellationToken,
    upload_client: &dyn UploadClient,
) -> Result<(), ActionError> {
    match action {
        PostActionSpec::Trash => Ok(tokio::fs::remove_file(filepath).await?),
        PostActionSpec::Archive => archive_file(filepath).await,
        PostActionSpec::Upload { cookie_file, threads } => {
            upload_client.upload(filepath, cookie_file, *threads).await
        }
        PostActionSpec::Shell { args } => run_shell(filepath, args, cancel).await,
    }
}

async fn process_group(
    group: TaskGroup,
    cancel: &CancellationToken,
    logger: &ArcLogger,
    upload_client: &dyn UploadClient,
) {
    for action in &group.actions {
        if let Err(e) = run_action(&group.filepath, action, cancel, upload_client).await {
            logger.log(LogEntry::new(
                LogLevel::Error,
                "uploader",
                None,
                format!("action failed for '{}': {e}", group.filepath),
            ));
            return;
        }
    }
}

const QUEUE_CAPACITY: usize = 1024;

/// Bounded worker pool consuming `TaskGroup`s. Concurrency equals the number
/// of workers spawned so far via `run()`/`scale_to()`.
pub struct UploaderPool {
    sender: mpsc::Sender<TaskGroup>,
    receiver: Arc<Mutex<mpsc::Receiver<TaskGroup>>>,
    cancel: CancellationToken,
    logger: ArcLogger,
    upload_client: Arc<dyn UploadClient>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl UploaderPool {
    #[must_use]
    pub fn new(logger: ArcLogger, upload_client: Arc<dyn UploadClient>) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            cancel: CancellationToken::new(),
            logger,
            upload_client,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Enqueues `groups`, dropping any that don't fit or arrive after
    /// `stop()`. Never blocks — called from a recorder finalization path.
    pub fn submit(&self, groups: Vec<TaskGroup>) {
        for group in groups {
            if self.cancel.is_cancelled() {
                self.logger.log(LogEntry::new(
                    LogLevel::Warning,
                    "uploader",
                    None,
                    format!("dropped task for '{}': pool stopping", group.filepath),
                ));
                continue;
            }
            if let Err(e) = self.sender.try_send(group) {
                let filepath = match &e {
                    mpsc::error::TrySendError::Full(g) | mpsc::error::TrySendError::Closed(g) => {
                        g.filepath.clone()
                    }
                };
                self.logger.log(LogEntry::new(
                    LogLevel::Warning,
                    "uploader",
                    None,
                    format!("dropped task for '{filepath}': queue full or closed"),
                ));
            }
        }
    }

    /// Starts `concurrency` workers pulling from the shared queue.
    pub async fn run(&self, concurrency: usize) {
        self.scale_to(concurrency.max(1)).await;
    }

    /// Grows the pool to `target` workers by spawning the shortfall; a no-op
    /// if already at or above `target`. Workers pull from the same shared
    /// queue, so adding one is safe at any time — there is no handshake
    /// needed with the ones already running. Shrinking a live pool would
    /// need a way to tell a specific worker to exit after its current group;
    /// this pool doesn't support that, so `target` only ever grows it.
    pub async fn scale_to(&self, target: usize) {
        let mut workers = self.workers.lock().await;
        if workers.len() >= target {
            return;
        }
        for _ in workers.len()..target {
            let receiver = self.receiver.clone();
            let cancel = self.cancel.clone();
            let logger = self.logger.clone();
            let upload_client = self.upload_client.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let next = { receiver.lock().await.recv().await };
                    let Some(group) = next else {
                        return;
                    };
                    process_group(group, &cancel, &logger, upload_client.as_ref()).await;
                }
            }));
        }
    }

    /// Scans `save_dir` for orphaned `*.flv` files and enqueues `[upload,
    /// trash]` for each, recovering from a crash between recording and
    /// upload.
    pub async fn prerun(&self, save_dir: &str, cookie_file: &str, threads: u32) {
        let Ok(mut entries) = tokio::fs::read_dir(save_dir).await else {
            return;
        };
        let mut groups = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("flv") {
                groups.push(TaskGroup {
                    filepath: path.to_string_lossy().into_owned(),
                    actions: vec![
                        PostActionSpec::Upload {
                            cookie_file: cookie_file.to_owned(),
                            threads,
                        },
                        PostActionSpec::Trash,
                    ],
                });
            }
        }
        self.submit(groups);
    }

    /// Signals stop, closes the queue, and waits for every worker to drain
    /// its in-flight group and exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        // Close from the receiver side: the sender half is never dropped
        // (it's cloned into every `submit` caller's `&self`), so
        // `sender.closed()` would never resolve. Closing the receiver makes
        // `recv()` return `None` once the queue drains, which is what the
        // worker loop in `run()` waits on.
        self.receiver.lock().await.close();
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use common::DummyLogger;
    use tempfile::tempdir;

    #[tokio::test]
    async fn trash_action_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.flv");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let cancel = CancellationToken::new();
        run_action(
            path.to_str().unwrap(),
            &PostActionSpec::Trash,
            &cancel,
            &NoopUploadClient,
        )
        .await
        .unwrap();

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn archive_action_moves_into_archive_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.flv");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let cancel = CancellationToken::new();
        run_action(
            path.to_str().unwrap(),
            &PostActionSpec::Archive,
            &cancel,
            &NoopUploadClient,
        )
        .await
        .unwrap();

        assert!(dir.path().join("archive/a.flv").exists());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn pool_processes_submitted_group() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.flv");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let pool = UploaderPool::new(DummyLogger::new(), Arc::new(NoopUploadClient));
        pool.run(2).await;
        pool.submit(vec![TaskGroup {
            filepath: path.to_str().unwrap().to_owned(),
            actions: vec![PostActionSpec::Trash],
        }]);

        // Give the worker a chance to run before stopping.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        pool.stop().await;

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn failed_action_aborts_remaining_actions() {
        struct FailingUploadClient;
        #[async_trait]
        impl UploadClient for FailingUploadClient {
            async fn upload(&self, _: &str, _: &str, _: u32) -> Result<(), ActionError> {
                Err(ActionError::Upload("boom".to_owned()))
            }
        }

        let dir = tempdir().unwrap();
        let path = dir.path().join("a.flv");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let group = TaskGroup {
            filepath: path.to_str().unwrap().to_owned(),
            actions: vec![
                PostActionSpec::Upload {
                    cookie_file: String::new(),
                    threads: 1,
                },
                PostActionSpec::Trash,
            ],
        };
        let logger: ArcLogger = DummyLogger::new();
        process_group(
            group,
            &CancellationToken::new(),
            &logger,
            &FailingUploadClient,
        )
        .await;

        // Trash never ran because upload failed first.
        assert!(path.exists());
    }
}
