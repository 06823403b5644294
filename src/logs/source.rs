use crate::error::Result;
use crate::logs::LogLine;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capability to read one container's logs
///
/// Implementations only hand out data; ordering, tagging and line
/// reassembly are the multiplexer's job.
#[async_trait]
pub trait LogSource: Send + Sync + 'static {
    /// Resolve a container reference to the name shown as its label
    async fn resolve(&self, identity: &str) -> Result<String> {
        Ok(identity.to_string())
    }

    /// Fetch the last `count` lines, oldest first
    async fn fetch_tail(&self, identity: &str, count: usize) -> Result<Vec<LogLine>>;

    /// Open a live stream of raw log bytes
    ///
    /// Chunks need not align with line boundaries. The stream must stop
    /// producing once `cancel` fires.
    async fn subscribe(&self, identity: &str, cancel: CancellationToken) -> Result<LiveStream>;
}

/// A live, cancelable stream of raw log chunks
pub struct LiveStream {
    /// Receiver for chunks (or the error that ended the stream)
    receiver: mpsc::Receiver<Result<Vec<u8>>>,
    /// Background task feeding the receiver, aborted on drop
    task_handle: Option<JoinHandle<()>>,
}

impl LiveStream {
    /// Wrap a receiver fed by some external producer
    pub fn new(receiver: mpsc::Receiver<Result<Vec<u8>>>) -> Self {
        Self {
            receiver,
            task_handle: None,
        }
    }

    /// Create a bounded channel and the stream reading from it
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<Vec<u8>>>, LiveStream) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }

    /// Attach the producer task after the stream was created with `channel`
    pub fn attach_task(&mut self, task: JoinHandle<()>) {
        self.task_handle = Some(task);
    }

    /// Receive the next chunk
    ///
    /// # Returns
    /// * `Some(Ok(bytes))` - Next chunk of log output
    /// * `Some(Err(e))` - The stream failed
    /// * `None` - The stream has ended
    pub async fn next(&mut self) -> Option<Result<Vec<u8>>> {
        self.receiver.recv().await
    }
}

impl Drop for LiveStream {
    fn drop(&mut self) {
        if let Some(task) = self.task_handle.take() {
            task.abort();
        }
    }
}
