//! Tail-follow streaming of job log files.
//!
//! A stream first replays the file from the beginning, then keeps reading as
//! the job appends to it. Wake-ups come from file change notifications, with
//! a periodic rescan as a fallback. The stream ends when:
//!
//! - the caller cancels (or drops the stream): clean end, no further chunks
//! - the job's completion signal fires: one final drain, then clean end
//! - a read fails: the error is sent as the last item

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::StreamConfig;
use crate::error::{JobError, Result};

/// Live sequence of output chunks, in file order.
pub type OutputStream = ReceiverStream<Result<Vec<u8>>>;

#[derive(Debug, Clone)]
pub struct OutputStreamer {
    chunk_size: usize,
    channel_capacity: usize,
    rescan_interval: Duration,
}

impl Default for OutputStreamer {
    fn default() -> Self {
        Self::new(&StreamConfig::default())
    }
}

impl OutputStreamer {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            channel_capacity: config.channel_capacity.max(1),
            rescan_interval: config.rescan_interval,
        }
    }

    /// Starts following `path`.
    ///
    /// Opening the file and registering the change watcher happen before this
    /// returns, so their failures are reported to the caller directly.
    /// `done` is the completion signal of the process writing the file.
    pub fn tail(
        &self,
        cancel: CancellationToken,
        path: &Path,
        done: watch::Receiver<bool>,
    ) -> Result<OutputStream> {
        let file = std::fs::File::open(path).map_err(JobError::Read)?;

        let changed = Arc::new(Notify::new());
        let waker = changed.clone();
        let mut watcher = notify::recommended_watcher(
            move |res: notify::Result<notify::Event>| match res {
                Ok(_) => waker.notify_one(),
                Err(e) => tracing::warn!(error = %e, "Log file watcher error"),
            },
        )?;
        // Registered before the first read so no write can slip between the
        // initial drain and the first wait.
        watcher.watch(path, RecursiveMode::NonRecursive)?;

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let tailer = Tailer {
            file: tokio::fs::File::from_std(file),
            tx,
            changed,
            done,
            cancel,
            chunk_size: self.chunk_size,
            rescan_interval: self.rescan_interval,
            _watcher: watcher,
        };
        tokio::spawn(tailer.run());

        Ok(ReceiverStream::new(rx))
    }
}

struct Tailer {
    file: tokio::fs::File,
    tx: mpsc::Sender<Result<Vec<u8>>>,
    changed: Arc<Notify>,
    done: watch::Receiver<bool>,
    cancel: CancellationToken,
    chunk_size: usize,
    rescan_interval: Duration,
    // Dropping the watcher unregisters it.
    _watcher: RecommendedWatcher,
}

enum Drain {
    /// Reached the current end of file.
    Caught,
    /// Cancelled, consumer gone or read failed.
    Stop,
}

impl Tailer {
    async fn run(mut self) {
        let mut buf = vec![0u8; self.chunk_size];
        let mut finishing = false;

        loop {
            if let Drain::Stop = self.drain(&mut buf).await {
                break;
            }
            if finishing {
                tracing::debug!("Job completed and output drained, ending stream");
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.tx.closed() => break,
                _ = self.changed.notified() => {}
                // A dropped sender means the job table is gone; treat it the
                // same as completion.
                _ = wait_done(&mut self.done) => finishing = true,
                _ = tokio::time::sleep(self.rescan_interval) => {}
            }
        }
    }

    /// Sends everything between the current position and end of file.
    /// Short reads are forwarded as they are.
    async fn drain(&mut self, buf: &mut [u8]) -> Drain {
        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Drain::Stop,
                read = self.file.read(buf) => read,
            };

            let chunk = match read {
                Ok(0) => return Drain::Caught,
                Ok(n) => Ok(buf[..n].to_vec()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read log file");
                    Err(JobError::Read(e))
                }
            };
            let failed = chunk.is_err();

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Drain::Stop,
                sent = self.tx.send(chunk) => {
                    if sent.is_err() {
                        return Drain::Stop;
                    }
                }
            }
            if failed {
                return Drain::Stop;
            }
        }
    }
}

/// Resolves once the completion signal is set or its sender is gone.
pub(crate) async fn wait_done(done: &mut watch::Receiver<bool>) {
    loop {
        let finished = *done.borrow_and_update();
        if finished || done.changed().await.is_err() {
            return;
        }
    }
}
