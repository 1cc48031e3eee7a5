// OpenReLife Desktop - Backend Log Sink
// Append-only capture of backend output, one session header per start

use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Bytes read from the end of the log when building a tail
const TAIL_WINDOW: u64 = 64 * 1024;

enum SinkMessage {
    /// Raw backend output, written verbatim
    Output(Vec<u8>),
    /// Supervisor annotation, timestamped and flushed before the ack fires
    Note(String, oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// Cloneable handle used by the stream readers and the exit watcher.
/// Writes after the sink is closed are dropped.
#[derive(Clone)]
pub struct LogWriter {
    tx: mpsc::UnboundedSender<SinkMessage>,
}

impl LogWriter {
    pub fn output(&self, bytes: Vec<u8>) {
        let _ = self.tx.send(SinkMessage::Output(bytes));
    }

    /// Append a timestamped annotation and wait until it is on disk.
    /// Returns false if the sink is already closed.
    pub async fn note(&self, text: impl Into<String>) -> bool {
        let (ack, done) = oneshot::channel();
        if self.tx.send(SinkMessage::Note(text.into(), ack)).is_err() {
            return false;
        }
        done.await.is_ok()
    }
}

/// Owner of the backend log file. A single writer task holds the file handle;
/// everything else talks to it through `LogWriter`.
pub struct LogSink {
    writer: LogWriter,
    task: JoinHandle<()>,
}

impl LogSink {
    /// Open (or create) the log in append mode and write the session header
    pub async fn open(path: &Path, session: &str) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path).await?;

        let header = format!("\n===== {} [{}] =====\n", session, timestamp());
        file.write_all(header.as_bytes()).await?;
        file.flush().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_writer(file, rx));

        Ok(Self {
            writer: LogWriter { tx },
            task,
        })
    }

    pub fn writer(&self) -> LogWriter {
        self.writer.clone()
    }

    /// Flush and release the file. Pending writes queued before the call are kept.
    pub async fn close(self) {
        let (ack, done) = oneshot::channel();
        if self.writer.tx.send(SinkMessage::Close(ack)).is_ok() {
            let _ = done.await;
        }
        let _ = self.task.await;
    }
}

async fn run_writer(mut file: File, mut rx: mpsc::UnboundedReceiver<SinkMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            SinkMessage::Output(mut bytes) => {
                if !bytes.ends_with(b"\n") {
                    bytes.push(b'\n');
                }
                if let Err(e) = file.write_all(&bytes).await {
                    log::warn!("[Supervisor] Failed to write backend log: {}", e);
                }
            }
            SinkMessage::Note(text, ack) => {
                let line = format!("[{}] {}\n", timestamp(), text);
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    log::warn!("[Supervisor] Failed to write backend log: {}", e);
                }
                let _ = file.flush().await;
                let _ = ack.send(());
            }
            SinkMessage::Close(ack) => {
                let _ = file.flush().await;
                let _ = ack.send(());
                break;
            }
        }
    }
    let _ = file.flush().await;
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Last `count` non-empty lines of the log
pub async fn read_tail(path: &Path, count: usize) -> std::io::Result<Vec<String>> {
    let mut file = File::open(path).await?;
    let len = file.metadata().await?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(TAIL_WINDOW))).await?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    let text = String::from_utf8_lossy(&buf);

    let mut lines: Vec<String> = text
        .lines()
        .rev()
        .filter(|line| !line.trim().is_empty())
        .take(count)
        .map(str::to_string)
        .collect();
    lines.reverse();
    Ok(lines)
}
