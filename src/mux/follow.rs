use crate::error::DocklogError;
use crate::logs::{LineSplitter, LiveStream, LogLine, LogSource, Tag, TaggedLine};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Message from a source task to the merge task
#[derive(Debug)]
pub(crate) enum SourceMessage {
    Line(TaggedLine),
    Ended(usize),
    Failed(usize, DocklogError),
}

/// Everything one follow task needs
pub(crate) struct SourceFeed {
    pub index: usize,
    pub identity: String,
    pub tag: Tag,
    pub cancel: CancellationToken,
    pub tx: mpsc::Sender<SourceMessage>,
    pub partial_line_timeout: Duration,
}

enum Chunk {
    Data(Option<crate::error::Result<Vec<u8>>>),
    Stalled,
}

/// Follow one source until it ends, fails or is canceled
///
/// Only complete lines are handed to the merge task. Sends go through the
/// bounded fan-in queue, so a slow consumer slows the reads here.
pub(crate) async fn follow_source<S: LogSource>(source: Arc<S>, feed: SourceFeed) {
    let SourceFeed {
        index,
        identity,
        tag,
        cancel,
        tx,
        partial_line_timeout,
    } = feed;

    let subscribed = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        subscribed = source.subscribe(&identity, cancel.clone()) => subscribed,
    };

    let mut stream = match subscribed {
        Ok(stream) => stream,
        Err(e) => {
            send(&tx, &cancel, SourceMessage::Failed(index, e)).await;
            return;
        }
    };
    debug!(identity = %identity, "Subscribed to live logs");

    let mut splitter = LineSplitter::new();
    let mut partial_since: Option<Instant> = None;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(identity = %identity, "Follow canceled");
                return;
            }
            chunk = next_chunk(&mut stream, partial_since.is_some(), partial_line_timeout) => chunk,
        };

        match chunk {
            Chunk::Stalled => {
                let elapsed = partial_since.map(|t| t.elapsed()).unwrap_or_default();
                let slow = DocklogError::PartialLineTimeout {
                    identity: identity.clone(),
                    elapsed,
                };
                debug!(identity = %identity, "{}", slow);
            }
            Chunk::Data(Some(Ok(bytes))) => {
                for payload in splitter.push(&bytes) {
                    let line = stamp(LogLine::parse(identity.as_str(), &payload));
                    let tagged = TaggedLine::new(index, tag.clone(), line);
                    if !send(&tx, &cancel, SourceMessage::Line(tagged)).await {
                        return;
                    }
                }

                partial_since = match (splitter.has_partial(), partial_since) {
                    (true, None) => Some(Instant::now()),
                    (true, since) => since,
                    (false, _) => None,
                };
            }
            Chunk::Data(Some(Err(e))) => {
                send(&tx, &cancel, SourceMessage::Failed(index, e)).await;
                return;
            }
            Chunk::Data(None) => {
                if let Some(rest) = splitter.finish() {
                    let line = stamp(LogLine::parse(identity.as_str(), &rest));
                    let tagged = TaggedLine::new(index, tag.clone(), line);
                    if !send(&tx, &cancel, SourceMessage::Line(tagged)).await {
                        return;
                    }
                }
                debug!(identity = %identity, "Live stream ended");
                send(&tx, &cancel, SourceMessage::Ended(index)).await;
                return;
            }
        }
    }
}

/// Wait for the next chunk, giving up after `limit` while a partial line is held
async fn next_chunk(stream: &mut LiveStream, holding_partial: bool, limit: Duration) -> Chunk {
    if holding_partial {
        match tokio::time::timeout(limit, stream.next()).await {
            Ok(chunk) => Chunk::Data(chunk),
            Err(_) => Chunk::Stalled,
        }
    } else {
        Chunk::Data(stream.next().await)
    }
}

/// Live lines without a recorded time get their arrival time
fn stamp(mut line: LogLine) -> LogLine {
    if line.timestamp.is_none() {
        line.timestamp = Some(Utc::now());
    }
    line
}

async fn send(
    tx: &mpsc::Sender<SourceMessage>,
    cancel: &CancellationToken,
    message: SourceMessage,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(message) => sent.is_ok(),
    }
}
