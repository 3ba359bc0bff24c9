//! Filesystem log store
//!
//! One append-only file per job. A per-name writer task owns the file, so
//! writes are serialized without the core holding any lock across log
//! I/O. Readers replay the file and then follow live appends until the
//! log is closed; a slow follower is dropped rather than slowing writes.

use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::PollSender;
use tracing::{error, warn};

use kiln_domain::{DomainError, DomainResult};
use kiln_ports::{LogReader, LogStore, LogWriter};

const WRITER_QUEUE: usize = 64;
const FOLLOWER_QUEUE: usize = 256;
const REPLAY_CHUNK: usize = 8 * 1024;

enum LogCmd {
    Write(Bytes),
    Attach(mpsc::Sender<Result<Bytes, std::io::Error>>),
    Close,
}

struct OpenLog {
    tx: mpsc::Sender<LogCmd>,
}

/// Log store rooted at a base directory, one `<name>.log` per job.
pub struct FileLogStore {
    base: PathBuf,
    open: DashMap<String, OpenLog>,
}

impl FileLogStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        FileLogStore {
            base: base.into(),
            open: DashMap::new(),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.base.join(format!("{name}.log"))
    }

    fn writer_for(&self, name: &str) -> Option<LogWriter> {
        self.open
            .get(name)
            .map(|entry| Box::new(LogAppender::new(entry.tx.clone())) as LogWriter)
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn open(&self, name: &str) -> DomainResult<LogWriter> {
        if let Some(writer) = self.writer_for(name) {
            return Ok(writer);
        }

        tokio::fs::create_dir_all(&self.base)
            .await
            .map_err(|e| DomainError::Store(format!("cannot create log directory: {e}")))?;

        let path = self.path_for(name);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| DomainError::Store(format!("cannot open log {}: {e}", path.display())))?;

        let (tx, rx) = mpsc::channel(WRITER_QUEUE);
        tokio::spawn(run_log(path, file, rx));
        self.open.insert(name.to_string(), OpenLog { tx });

        Ok(self.writer_for(name).expect("log entry just inserted"))
    }

    async fn append(&self, name: &str) -> DomainResult<LogWriter> {
        self.writer_for(name)
            .ok_or_else(|| DomainError::NotFound(format!("log {name} is not open")))
    }

    async fn read(&self, name: &str) -> DomainResult<LogReader> {
        if let Some(entry) = self.open.get(name) {
            let (tx, rx) = mpsc::channel(FOLLOWER_QUEUE);
            entry
                .tx
                .send(LogCmd::Attach(tx))
                .await
                .map_err(|_| DomainError::Store(format!("log {name} writer is gone")))?;
            return Ok(Box::new(StreamReader::new(ReceiverStream::new(rx))));
        }

        let path = self.path_for(name);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|_| DomainError::NotFound(format!("no log stored for {name}")))?;
        Ok(Box::new(file))
    }

    async fn close(&self, name: &str) -> DomainResult<()> {
        if let Some((_, entry)) = self.open.remove(name) {
            let _ = entry.tx.send(LogCmd::Close).await;
        }
        Ok(())
    }
}

/// The per-name writer task. Owns the file handle and the follower list.
async fn run_log(path: PathBuf, mut file: tokio::fs::File, mut rx: mpsc::Receiver<LogCmd>) {
    let mut followers: Vec<mpsc::Sender<Result<Bytes, std::io::Error>>> = Vec::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            LogCmd::Write(chunk) => {
                if let Err(err) = file.write_all(&chunk).await {
                    error!(log = %path.display(), "log write failed: {err}");
                    break;
                }
                followers.retain(|f| match f.try_send(Ok(chunk.clone())) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(log = %path.display(), "dropping slow log follower");
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
            LogCmd::Attach(follower) => {
                if replay(&path, &follower).await.is_ok() {
                    followers.push(follower);
                }
            }
            LogCmd::Close => break,
        }
    }
    let _ = file.flush().await;
    // dropping the followers delivers EOF
}

/// Streams the current file contents to a fresh follower.
async fn replay(
    path: &PathBuf,
    follower: &mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> Result<(), ()> {
    let mut file = tokio::fs::File::open(path).await.map_err(|_| ())?;
    let mut buf = vec![0u8; REPLAY_CHUNK];
    loop {
        match file.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => {
                if follower
                    .send(Ok(Bytes::copy_from_slice(&buf[..n])))
                    .await
                    .is_err()
                {
                    return Err(());
                }
            }
            Err(_) => return Err(()),
        }
    }
}

/// AsyncWrite handle feeding the writer task.
struct LogAppender {
    tx: PollSender<LogCmd>,
}

impl LogAppender {
    fn new(tx: mpsc::Sender<LogCmd>) -> Self {
        LogAppender {
            tx: PollSender::new(tx),
        }
    }
}

impl AsyncWrite for LogAppender {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                if self
                    .tx
                    .send_item(LogCmd::Write(Bytes::copy_from_slice(buf)))
                    .is_err()
                {
                    return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
                }
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.tx.close();
        Poll::Ready(Ok(()))
    }
}
