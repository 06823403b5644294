// Multiplexer - fans in many container log streams into one ordered output

mod follow;
mod merge;
mod state;

pub use merge::merge_batches;
pub use state::{Outcome, Phase, SessionEvent, SessionSummary, SourceReport, SourceState};

use crate::config::SessionConfig;
use crate::error::{DocklogError, Result};
use crate::logs::{LineTagger, LogLine, LogSource, Tag, TaggedLine};
use crate::perf_time;
use follow::{follow_source, SourceFeed, SourceMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bootstrap phases slower than this are reported under the `perf` target
const SLOW_BOOTSTRAP_MS: u64 = 2000;

/// Entry point: validates a request and starts a session over a `LogSource`
pub struct Multiplexer<S: LogSource> {
    source: Arc<S>,
    config: SessionConfig,
    cancel: CancellationToken,
}

impl<S: LogSource> Multiplexer<S> {
    pub fn new(source: S, config: SessionConfig) -> Self {
        Self {
            source: Arc::new(source),
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie the session to an outside cancellation signal
    ///
    /// The session runs on a child of `cancel`, so canceling it stops the
    /// session while a session failure never cancels the caller's token.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validate the request and spawn the session
    ///
    /// Must be called from within a tokio runtime. Nothing is asked of the
    /// `LogSource` when validation fails.
    pub fn start(self, identities: Vec<String>) -> Result<Session> {
        SessionConfig::validate_sources(&identities)?;
        self.config.validate()?;

        let cancel = self.cancel.child_token();
        let (events_tx, events_rx) = mpsc::channel(self.config.channel_capacity);

        let slots = identities
            .into_iter()
            .map(|identity| SourceSlot {
                identity,
                tag: None,
                state: SourceState::Connecting,
            })
            .collect();

        let driver = SessionDriver {
            source: self.source,
            config: self.config,
            cancel: cancel.clone(),
            events: events_tx,
            slots,
            lines_emitted: 0,
        };

        info!(sources = driver.slots.len(), follow = driver.config.follow, "Starting log session");
        let task = tokio::spawn(driver.run());

        Ok(Session {
            events: events_rx,
            task,
            cancel,
        })
    }
}

/// A running session
///
/// Read events with `next_event` until it returns `None`, then collect the
/// result with `wait`.
pub struct Session {
    events: mpsc::Receiver<SessionEvent>,
    task: JoinHandle<Result<SessionSummary>>,
    cancel: CancellationToken,
}

impl Session {
    /// Receive the next event; `None` once the session has stopped
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Request cancellation of every source
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the session to stop
    ///
    /// Undelivered events are discarded, which ends a session still in
    /// progress as canceled.
    pub async fn wait(self) -> Result<SessionSummary> {
        let Session { events, task, .. } = self;
        drop(events);

        task.await
            .map_err(|e| DocklogError::Other(format!("Session task failed: {}", e)))?
    }
}

struct SourceSlot {
    identity: String,
    tag: Option<Tag>,
    state: SourceState,
}

/// The merge task: sole writer of the session's event queue
struct SessionDriver<S: LogSource> {
    source: Arc<S>,
    config: SessionConfig,
    cancel: CancellationToken,
    events: mpsc::Sender<SessionEvent>,
    slots: Vec<SourceSlot>,
    lines_emitted: usize,
}

impl<S: LogSource> SessionDriver<S> {
    async fn run(mut self) -> Result<SessionSummary> {
        let result = self.drive().await;

        match &result {
            Ok(outcome) => info!(outcome = %outcome, lines = self.lines_emitted, "Log session finished"),
            Err(e) => warn!("Log session aborted: {}", e),
        }

        result.map(|outcome| SessionSummary {
            outcome,
            sources: self
                .slots
                .iter()
                .map(|slot| SourceReport {
                    identity: slot.identity.clone(),
                    label: slot.tag.as_ref().map(|t| t.label.clone()),
                    state: slot.state,
                })
                .collect(),
            lines_emitted: self.lines_emitted,
        })
    }

    async fn drive(&mut self) -> Result<Outcome> {
        if !self.emit(SessionEvent::PhaseChanged(Phase::Bootstrap)).await {
            return Ok(self.canceled());
        }

        let Some(batches) = self.bootstrap().await? else {
            return Ok(self.canceled());
        };

        if batches.is_empty() {
            return Err(DocklogError::NoReachableSources);
        }

        for (index, line) in merge_batches(batches) {
            if !self.emit_line(index, line).await {
                return Ok(self.canceled());
            }
        }

        if !self.config.follow {
            self.mark_active(SourceState::Drained);
            self.emit(SessionEvent::PhaseChanged(Phase::Done)).await;
            return Ok(Outcome::Done);
        }

        if !self.emit(SessionEvent::PhaseChanged(Phase::Follow)).await {
            return Ok(self.canceled());
        }

        let outcome = self.follow().await?;
        if outcome == Outcome::Done {
            self.emit(SessionEvent::PhaseChanged(Phase::Done)).await;
        }

        Ok(outcome)
    }

    /// Resolve every source and buffer its tail
    ///
    /// Returns the tails of the reachable sources, or `None` when canceled.
    async fn bootstrap(&mut self) -> Result<Option<Vec<(usize, Vec<LogLine>)>>> {
        let _timer = perf_time!("bootstrap", SLOW_BOOTSTRAP_MS);
        let mut tasks = JoinSet::new();

        for (index, slot) in self.slots.iter().enumerate() {
            let source = Arc::clone(&self.source);
            let identity = slot.identity.clone();
            let tail = self.config.tail;

            tasks.spawn(async move {
                let fetched = async {
                    let name = source.resolve(&identity).await?;
                    let lines = source.fetch_tail(&identity, tail).await?;
                    Ok::<_, DocklogError>((name, lines))
                }
                .await;
                (index, fetched)
            });
        }

        let mut tails: Vec<Option<Vec<LogLine>>> = self.slots.iter().map(|_| None).collect();

        loop {
            let joined = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                joined = tasks.join_next() => Some(joined),
            };

            let (index, fetched) = match joined {
                None => {
                    tasks.shutdown().await;
                    return Ok(None);
                }
                Some(None) => break,
                Some(Some(Ok(done))) => done,
                Some(Some(Err(e))) => {
                    tasks.shutdown().await;
                    return Err(DocklogError::Other(format!("Bootstrap task failed: {}", e)));
                }
            };

            match fetched {
                Ok((name, lines)) => {
                    debug!(identity = %self.slots[index].identity, lines = lines.len(), "Bootstrapped source");
                    let slot = &mut self.slots[index];
                    slot.tag = Some(LineTagger::assign(index, &name));
                    slot.state = SourceState::Bootstrapping;
                    tails[index] = Some(lines);
                }
                Err(e) if e.is_fatal() => {
                    self.slots[index].state = SourceState::Failed;
                    self.cancel.cancel();
                    tasks.shutdown().await;
                    self.mark_active(SourceState::Canceled);
                    return Err(e);
                }
                Err(e) => {
                    let identity = self.slots[index].identity.clone();
                    warn!(identity = %identity, "Source unavailable: {}", e);
                    self.slots[index].state = SourceState::Failed;
                    if !self.emit(SessionEvent::SourceFailed { identity, error: e }).await {
                        tasks.shutdown().await;
                        return Ok(None);
                    }
                }
            }
        }

        Ok(Some(
            tails
                .into_iter()
                .enumerate()
                .filter_map(|(index, lines)| lines.map(|lines| (index, lines)))
                .collect(),
        ))
    }

    /// Stream every bootstrapped source until all end, one fails fatally, or cancel
    async fn follow(&mut self) -> Result<Outcome> {
        let (line_tx, mut line_rx) = mpsc::channel(self.config.channel_capacity);
        let mut tasks = JoinSet::new();
        let mut active = 0usize;

        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(tag) = slot.tag.clone() else {
                continue;
            };
            if slot.state != SourceState::Bootstrapping {
                continue;
            }

            slot.state = SourceState::Streaming;
            active += 1;
            tasks.spawn(follow_source(
                Arc::clone(&self.source),
                SourceFeed {
                    index,
                    identity: slot.identity.clone(),
                    tag,
                    cancel: self.cancel.child_token(),
                    tx: line_tx.clone(),
                    partial_line_timeout: self.config.partial_line_timeout(),
                },
            ));
        }
        drop(line_tx);
        info!(sources = active, "Following live logs");

        let result = loop {
            if active == 0 {
                break Ok(Outcome::Done);
            }

            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                message = line_rx.recv() => message,
            };

            match message {
                None => break Ok(self.canceled()),
                Some(SourceMessage::Line(tagged)) => {
                    if !self.emit_tagged(tagged).await {
                        break Ok(self.canceled());
                    }
                }
                Some(SourceMessage::Ended(index)) => {
                    active -= 1;
                    self.slots[index].state = SourceState::Ended;
                    let identity = self.slots[index].identity.clone();
                    debug!(identity = %identity, remaining = active, "Source ended");
                    if !self.emit(SessionEvent::SourceEnded { identity }).await {
                        break Ok(self.canceled());
                    }
                }
                Some(SourceMessage::Failed(index, e)) if e.is_fatal() => {
                    self.slots[index].state = SourceState::Failed;
                    break Err(e);
                }
                Some(SourceMessage::Failed(index, e)) => {
                    active -= 1;
                    self.slots[index].state = SourceState::Failed;
                    let identity = self.slots[index].identity.clone();
                    warn!(identity = %identity, "Source dropped from session: {}", e);
                    if !self.emit(SessionEvent::SourceFailed { identity, error: e }).await {
                        break Ok(self.canceled());
                    }
                }
            }
        };

        // Every exit path tears all remaining sources down before returning
        self.cancel.cancel();
        drop(line_rx);
        while tasks.join_next().await.is_some() {}
        self.mark_active(SourceState::Canceled);

        result
    }

    async fn emit_line(&mut self, index: usize, line: LogLine) -> bool {
        let Some(tag) = self.slots[index].tag.clone() else {
            return true;
        };
        self.emit_tagged(TaggedLine::new(index, tag, line)).await
    }

    async fn emit_tagged(&mut self, tagged: TaggedLine) -> bool {
        let sent = self.emit(SessionEvent::Line(tagged)).await;
        if sent {
            self.lines_emitted += 1;
        }
        sent
    }

    /// Deliver one event, waiting for room in the queue
    ///
    /// Returns false when the session was canceled or the consumer is gone.
    async fn emit(&self, event: SessionEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }

    fn canceled(&mut self) -> Outcome {
        self.cancel.cancel();
        self.mark_active(SourceState::Canceled);
        Outcome::Canceled
    }

    /// Move every source that is still live into `state`
    fn mark_active(&mut self, state: SourceState) {
        for slot in self.slots.iter_mut().filter(|s| !s.state.is_terminal()) {
            slot.state = state;
        }
    }
}
