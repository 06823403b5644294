use crate::error::DocklogError;
use crate::logs::TaggedLine;

/// Lifecycle of one source within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Connecting,
    Bootstrapping,
    /// Tail emitted in static mode
    Drained,
    Streaming,
    /// Live stream closed on its own
    Ended,
    Failed,
    Canceled,
}

impl SourceState {
    /// Whether the source will produce no further lines
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SourceState::Drained | SourceState::Ended | SourceState::Failed | SourceState::Canceled
        )
    }
}

impl std::fmt::Display for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceState::Connecting => write!(f, "connecting"),
            SourceState::Bootstrapping => write!(f, "bootstrapping"),
            SourceState::Drained => write!(f, "drained"),
            SourceState::Streaming => write!(f, "streaming"),
            SourceState::Ended => write!(f, "ended"),
            SourceState::Failed => write!(f, "failed"),
            SourceState::Canceled => write!(f, "canceled"),
        }
    }
}

/// Session-wide phase
///
/// `Bootstrap` output is strictly ordered by timestamp; `Follow` output
/// is only ordered per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Bootstrap,
    Follow,
    Done,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Bootstrap => write!(f, "bootstrap"),
            Phase::Follow => write!(f, "follow"),
            Phase::Done => write!(f, "done"),
        }
    }
}

/// Everything the session hands to its consumer, in delivery order
#[derive(Debug)]
pub enum SessionEvent {
    Line(TaggedLine),
    /// A source could not be used; the session carries on without it
    SourceFailed {
        identity: String,
        error: DocklogError,
    },
    SourceEnded {
        identity: String,
    },
    PhaseChanged(Phase),
}

/// How a session that did not fail came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Static drain finished or every followed source ended
    Done,
    Canceled,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Done => write!(f, "done"),
            Outcome::Canceled => write!(f, "canceled"),
        }
    }
}

/// Final state of one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    pub identity: String,
    /// Display label, once the source got far enough to be tagged
    pub label: Option<String>,
    pub state: SourceState,
}

/// Result of a session that did not fail
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub outcome: Outcome,
    pub sources: Vec<SourceReport>,
    pub lines_emitted: usize,
}

impl SessionSummary {
    /// Reports for sources in the given state
    pub fn sources_in(&self, state: SourceState) -> impl Iterator<Item = &SourceReport> {
        self.sources.iter().filter(move |s| s.state == state)
    }
}
