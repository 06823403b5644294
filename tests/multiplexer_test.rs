use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use docklog::config::SessionConfig;
use docklog::error::{DocklogError, Result};
use docklog::logs::{LiveStream, LogLine, LogSource};
use docklog::mux::{Multiplexer, Outcome, Phase, Session, SessionEvent, SessionSummary, SourceState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug)]
enum Failure {
    NotFound,
    Connection,
}

impl Failure {
    fn error(self, identity: &str) -> DocklogError {
        match self {
            Failure::NotFound => DocklogError::NotFound(identity.to_string()),
            Failure::Connection => DocklogError::ConnectionError("daemon went away".to_string()),
        }
    }
}

#[derive(Clone, Debug)]
enum LiveEnd {
    Close,
    Fail(Failure),
    Hang,
    /// Fail at the moment the session is canceled, like a client hit by Ctrl-C
    FailOnCancel(Failure),
}

/// Scripted behaviour of one container
#[derive(Clone, Debug)]
struct Feed {
    tail: Vec<(Option<i64>, String)>,
    tail_delay: Duration,
    bootstrap_failure: Option<Failure>,
    live: Vec<Vec<u8>>,
    live_delay: Duration,
    live_end: LiveEnd,
}

impl Feed {
    fn new() -> Self {
        Self {
            tail: Vec::new(),
            tail_delay: Duration::ZERO,
            bootstrap_failure: None,
            live: Vec::new(),
            live_delay: Duration::ZERO,
            live_end: LiveEnd::Close,
        }
    }

    fn tail(mut self, lines: &[(i64, &str)]) -> Self {
        self.tail = lines
            .iter()
            .map(|(secs, payload)| (Some(*secs), payload.to_string()))
            .collect();
        self
    }

    fn delayed(mut self, millis: u64) -> Self {
        self.tail_delay = Duration::from_millis(millis);
        self
    }

    fn failing(mut self, failure: Failure) -> Self {
        self.bootstrap_failure = Some(failure);
        self
    }

    fn live(mut self, chunks: &[&[u8]]) -> Self {
        self.live = chunks.iter().map(|c| c.to_vec()).collect();
        self
    }

    fn live_every(mut self, millis: u64) -> Self {
        self.live_delay = Duration::from_millis(millis);
        self
    }

    fn then(mut self, end: LiveEnd) -> Self {
        self.live_end = end;
        self
    }
}

/// What the multiplexer asked of the source
#[derive(Default)]
struct Probe {
    calls: AtomicUsize,
    tail_requests: Mutex<Vec<(String, usize)>>,
    subscribed: Mutex<Vec<String>>,
    canceled: Mutex<Vec<String>>,
}

impl Probe {
    fn subscribed(&self) -> usize {
        self.subscribed.lock().unwrap().len()
    }

    fn canceled(&self) -> Vec<String> {
        let mut canceled = self.canceled.lock().unwrap().clone();
        canceled.sort();
        canceled
    }

    fn record_cancel(&self, identity: &str) {
        self.canceled.lock().unwrap().push(identity.to_string());
    }
}

struct ScriptedSource {
    feeds: HashMap<String, Feed>,
    probe: Arc<Probe>,
}

impl ScriptedSource {
    fn new() -> Self {
        Self {
            feeds: HashMap::new(),
            probe: Arc::new(Probe::default()),
        }
    }

    fn feed(mut self, identity: &str, feed: Feed) -> Self {
        self.feeds.insert(identity.to_string(), feed);
        self
    }

    fn probe(&self) -> Arc<Probe> {
        Arc::clone(&self.probe)
    }

    fn lookup(&self, identity: &str) -> Result<Feed> {
        self.feeds
            .get(identity)
            .cloned()
            .ok_or_else(|| DocklogError::NotFound(identity.to_string()))
    }
}

#[async_trait]
impl LogSource for ScriptedSource {
    async fn resolve(&self, identity: &str) -> Result<String> {
        self.probe.calls.fetch_add(1, Ordering::SeqCst);
        let feed = self.lookup(identity)?;

        if let Some(failure) = feed.bootstrap_failure {
            sleep(feed.tail_delay).await;
            return Err(failure.error(identity));
        }

        Ok(identity.to_string())
    }

    async fn fetch_tail(&self, identity: &str, count: usize) -> Result<Vec<LogLine>> {
        self.probe.calls.fetch_add(1, Ordering::SeqCst);
        self.probe
            .tail_requests
            .lock()
            .unwrap()
            .push((identity.to_string(), count));

        let feed = self.lookup(identity)?;
        sleep(feed.tail_delay).await;

        let skip = feed.tail.len().saturating_sub(count);
        Ok(feed
            .tail
            .into_iter()
            .skip(skip)
            .map(|(secs, payload)| {
                LogLine::new(identity, secs.and_then(|s| Utc.timestamp_opt(s, 0).single()), payload)
            })
            .collect())
    }

    async fn subscribe(&self, identity: &str, cancel: CancellationToken) -> Result<LiveStream> {
        self.probe.calls.fetch_add(1, Ordering::SeqCst);
        self.probe
            .subscribed
            .lock()
            .unwrap()
            .push(identity.to_string());

        let feed = self.lookup(identity)?;
        let (tx, stream) = LiveStream::channel(1);
        let probe = Arc::clone(&self.probe);
        let identity = identity.to_string();

        // Not owned by the stream, so it outlives a dropped stream and can
        // report whether it saw the cancellation
        tokio::spawn(async move {
            for chunk in feed.live {
                if !feed.live_delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            probe.record_cancel(&identity);
                            return;
                        }
                        _ = sleep(feed.live_delay) => {}
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => {
                        probe.record_cancel(&identity);
                        return;
                    }
                    sent = tx.send(Ok(chunk)) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }

            match feed.live_end {
                LiveEnd::Close => {}
                LiveEnd::Fail(failure) => {
                    let _ = tx.send(Err(failure.error(&identity))).await;
                }
                LiveEnd::Hang => {
                    cancel.cancelled().await;
                    probe.record_cancel(&identity);
                }
                LiveEnd::FailOnCancel(failure) => {
                    cancel.cancelled().await;
                    probe.record_cancel(&identity);
                    let _ = tx.send(Err(failure.error(&identity))).await;
                }
            }
        });

        Ok(stream)
    }
}

fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

fn static_config() -> SessionConfig {
    SessionConfig {
        follow: false,
        ..SessionConfig::default()
    }
}

async fn collect(mut session: Session) -> (Vec<SessionEvent>, Result<SessionSummary>) {
    let mut events = Vec::new();
    while let Some(event) = session.next_event().await {
        events.push(event);
    }
    (events, session.wait().await)
}

/// `identity:payload` for every line event, in delivery order
fn rendered(events: &[SessionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Line(tagged) => {
                Some(format!("{}:{}", tagged.line.identity, tagged.line.payload))
            }
            _ => None,
        })
        .collect()
}

fn phases(events: &[SessionEvent]) -> Vec<Phase> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::PhaseChanged(phase) => Some(*phase),
            _ => None,
        })
        .collect()
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_static_example_interleaves_two_sources() {
    let source = ScriptedSource::new()
        .feed("a", Feed::new().tail(&[(1, "a1"), (3, "a3")]))
        .feed("b", Feed::new().tail(&[(2, "b2")]));
    let probe = source.probe();

    let session = Multiplexer::new(source, static_config())
        .start(ids(&["a", "b"]))
        .unwrap();
    let (events, summary) = collect(session).await;
    let summary = summary.unwrap();

    assert_eq!(rendered(&events), vec!["a:a1", "b:b2", "a:a3"]);
    assert_eq!(phases(&events), vec![Phase::Bootstrap, Phase::Done]);
    assert_eq!(summary.outcome, Outcome::Done);
    assert_eq!(summary.lines_emitted, 3);
    assert!(summary.sources.iter().all(|s| s.state == SourceState::Drained));

    let mut requests = probe.tail_requests.lock().unwrap().clone();
    requests.sort();
    assert_eq!(requests, vec![("a".to_string(), 10), ("b".to_string(), 10)]);
    assert_eq!(probe.subscribed(), 0);
}

#[tokio::test]
async fn test_bootstrap_is_sorted_despite_out_of_order_arrival() {
    // The slowest responder holds the earliest lines
    let source = ScriptedSource::new()
        .feed("web", Feed::new().tail(&[(1, "w1"), (5, "w5"), (9, "w9")]).delayed(60))
        .feed("db", Feed::new().tail(&[(2, "d2"), (5, "d5"), (8, "d8")]))
        .feed("cache", Feed::new().tail(&[(3, "c3"), (5, "c5"), (7, "c7")]).delayed(30));

    let session = Multiplexer::new(source, static_config())
        .start(ids(&["web", "db", "cache"]))
        .unwrap();
    let (events, summary) = collect(session).await;

    assert!(summary.is_ok());
    assert_eq!(
        rendered(&events),
        vec![
            "web:w1", "db:d2", "cache:c3", "web:w5", "db:d5", "cache:c5", "cache:c7", "db:d8",
            "web:w9",
        ]
    );
}

#[tokio::test]
async fn test_tags_follow_registration_order() {
    let source = ScriptedSource::new()
        .feed("first", Feed::new().tail(&[(2, "x"), (4, "y")]).delayed(20))
        .feed("second", Feed::new().tail(&[(1, "z")]));

    let session = Multiplexer::new(source, static_config())
        .start(ids(&["first", "second"]))
        .unwrap();
    let (events, _) = collect(session).await;

    for event in &events {
        if let SessionEvent::Line(tagged) = event {
            let expected = if tagged.line.identity == "first" { 0 } else { 1 };
            assert_eq!(tagged.tag.color_index, expected);
            assert_eq!(tagged.source_index, expected);
            assert_eq!(tagged.tag.label, tagged.line.identity);
        }
    }
}

#[tokio::test]
async fn test_too_many_sources_rejected_before_any_call() {
    let names = ["a", "b", "c", "d", "e", "f", "g", "h", "i"];
    let mut source = ScriptedSource::new();
    for name in names {
        source = source.feed(name, Feed::new().tail(&[(1, "x")]));
    }
    let probe = source.probe();

    let result = Multiplexer::new(source, static_config()).start(ids(&names));

    assert!(matches!(result, Err(DocklogError::ConfigurationError(_))));
    sleep(Duration::from_millis(20)).await;
    assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_container_degrades_gracefully() {
    let source = ScriptedSource::new().feed("web", Feed::new().tail(&[(1, "up")]));

    let session = Multiplexer::new(source, static_config())
        .start(ids(&["web", "ghost"]))
        .unwrap();
    let (events, summary) = collect(session).await;
    let summary = summary.unwrap();

    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::SourceFailed { identity, error: DocklogError::NotFound(_) } if identity == "ghost"
    )));
    assert_eq!(rendered(&events), vec!["web:up"]);
    assert_eq!(summary.sources_in(SourceState::Failed).count(), 1);
    assert_eq!(summary.sources_in(SourceState::Drained).count(), 1);
}

#[tokio::test]
async fn test_no_reachable_sources_is_an_error_without_output() {
    let source = ScriptedSource::new();

    let session = Multiplexer::new(source, static_config())
        .start(ids(&["ghost", "phantom"]))
        .unwrap();
    let (events, summary) = collect(session).await;

    assert!(matches!(summary, Err(DocklogError::NoReachableSources)));
    assert!(rendered(&events).is_empty());
}

#[tokio::test]
async fn test_connection_error_during_bootstrap_is_fatal() {
    let source = ScriptedSource::new()
        .feed("web", Feed::new().tail(&[(1, "up")]).delayed(50))
        .feed("db", Feed::new().failing(Failure::Connection));

    let session = Multiplexer::new(source, static_config())
        .start(ids(&["web", "db"]))
        .unwrap();
    let (events, summary) = collect(session).await;

    assert!(matches!(summary, Err(DocklogError::ConnectionError(_))));
    assert!(rendered(&events).is_empty());
}

#[tokio::test]
async fn test_follow_reassembles_chunked_lines() {
    let source = ScriptedSource::new().feed(
        "web",
        Feed::new()
            .tail(&[(1, "boot")])
            .live(&[b"GET /in", b"dex 200\nGET ", b"/api 201\nPOST /login", b" 302\n"]),
    );

    let session = Multiplexer::new(source, SessionConfig::default())
        .start(ids(&["web"]))
        .unwrap();
    let (events, summary) = collect(session).await;

    assert_eq!(
        rendered(&events),
        vec!["web:boot", "web:GET /index 200", "web:GET /api 201", "web:POST /login 302"]
    );
    assert_eq!(phases(&events), vec![Phase::Bootstrap, Phase::Follow, Phase::Done]);
    assert_eq!(summary.unwrap().outcome, Outcome::Done);
}

#[tokio::test]
async fn test_follow_continues_after_one_source_ends() {
    let source = ScriptedSource::new()
        .feed("short", Feed::new().live(&[b"bye\n"]))
        .feed("long", Feed::new().live(&[b"still here\n", b"done\n"]).live_every(60));

    let session = Multiplexer::new(source, SessionConfig::default())
        .start(ids(&["short", "long"]))
        .unwrap();
    let (events, summary) = collect(session).await;
    let summary = summary.unwrap();

    let short_ended = events
        .iter()
        .position(|e| matches!(e, SessionEvent::SourceEnded { identity } if identity == "short"))
        .expect("short source should end");
    let long_line = events
        .iter()
        .position(|e| matches!(e, SessionEvent::Line(t) if t.line.payload == "still here"))
        .expect("long source should keep streaming");

    assert!(short_ended < long_line);
    assert_eq!(rendered(&events), vec!["short:bye", "long:still here", "long:done"]);
    assert_eq!(summary.outcome, Outcome::Done);
    assert!(summary.sources.iter().all(|s| s.state == SourceState::Ended));
}

#[tokio::test]
async fn test_connection_error_during_follow_cancels_the_rest() {
    let source = ScriptedSource::new()
        .feed(
            "web",
            Feed::new()
                .live(&[b"about to fail\n"])
                .live_every(30)
                .then(LiveEnd::Fail(Failure::Connection)),
        )
        .feed("db", Feed::new().then(LiveEnd::Hang))
        .feed("cache", Feed::new().then(LiveEnd::Hang));
    let probe = source.probe();

    let session = Multiplexer::new(source, SessionConfig::default())
        .start(ids(&["web", "db", "cache"]))
        .unwrap();
    let (events, summary) = timeout(Duration::from_secs(2), collect(session))
        .await
        .expect("session should stop after a fatal error");

    assert!(matches!(summary, Err(DocklogError::ConnectionError(_))));
    assert_eq!(rendered(&events), vec!["web:about to fail"]);

    let probe_ref = Arc::clone(&probe);
    wait_for(move || probe_ref.canceled().len() == 2).await;
    assert_eq!(probe.canceled(), vec!["cache", "db"]);
}

#[tokio::test]
async fn test_non_fatal_follow_failure_drops_only_that_source() {
    let source = ScriptedSource::new()
        .feed("gone", Feed::new().then(LiveEnd::Fail(Failure::NotFound)))
        .feed("web", Feed::new().live(&[b"ok\n"]).live_every(40));

    let session = Multiplexer::new(source, SessionConfig::default())
        .start(ids(&["gone", "web"]))
        .unwrap();
    let (events, summary) = collect(session).await;
    let summary = summary.unwrap();

    assert_eq!(rendered(&events), vec!["web:ok"]);
    assert_eq!(summary.outcome, Outcome::Done);
    assert_eq!(summary.sources_in(SourceState::Failed).count(), 1);
    assert_eq!(summary.sources_in(SourceState::Ended).count(), 1);
}

#[tokio::test]
async fn test_cancel_reaches_every_subscription_quickly() {
    let source = ScriptedSource::new()
        .feed("a", Feed::new().then(LiveEnd::Hang))
        .feed("b", Feed::new().then(LiveEnd::Hang))
        .feed("c", Feed::new().then(LiveEnd::Hang));
    let probe = source.probe();

    let mut session = Multiplexer::new(source, SessionConfig::default())
        .start(ids(&["a", "b", "c"]))
        .unwrap();

    loop {
        match session.next_event().await {
            Some(SessionEvent::PhaseChanged(Phase::Follow)) => break,
            Some(_) => continue,
            None => panic!("session ended before following"),
        }
    }
    let probe_ref = Arc::clone(&probe);
    wait_for(move || probe_ref.subscribed() == 3).await;

    let started = Instant::now();
    session.cancel();
    let (_, summary) = timeout(Duration::from_millis(200), collect(session))
        .await
        .expect("session should stop promptly");

    let probe_ref = Arc::clone(&probe);
    wait_for(move || probe_ref.canceled().len() == 3).await;
    assert!(started.elapsed() < Duration::from_millis(200));

    let summary = summary.unwrap();
    assert_eq!(summary.outcome, Outcome::Canceled);
    assert!(summary.sources.iter().all(|s| s.state == SourceState::Canceled));
}

#[tokio::test]
async fn test_outer_token_cancels_session() {
    let source = ScriptedSource::new().feed("a", Feed::new().then(LiveEnd::Hang));
    let probe = source.probe();
    let interrupt = CancellationToken::new();

    let session = Multiplexer::new(source, SessionConfig::default())
        .with_cancel_token(interrupt.clone())
        .start(ids(&["a"]))
        .unwrap();

    let probe_ref = Arc::clone(&probe);
    wait_for(move || probe_ref.subscribed() == 1).await;
    interrupt.cancel();

    let (_, summary) = timeout(Duration::from_secs(1), collect(session)).await.unwrap();
    assert_eq!(summary.unwrap().outcome, Outcome::Canceled);
}

#[tokio::test]
async fn test_slow_consumer_applies_backpressure_without_loss() {
    let chunks: Vec<Vec<u8>> = (0..300).map(|i| format!("line-{}\n", i).into_bytes()).collect();
    let chunk_refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_slice()).collect();
    let source = ScriptedSource::new().feed("chatty", Feed::new().live(&chunk_refs));

    let config = SessionConfig {
        channel_capacity: 2,
        ..SessionConfig::default()
    };
    let mut session = Multiplexer::new(source, config).start(ids(&["chatty"])).unwrap();

    let mut received = Vec::new();
    while let Some(event) = session.next_event().await {
        if let SessionEvent::Line(tagged) = event {
            received.push(tagged.line.payload);
            if received.len() % 50 == 0 {
                sleep(Duration::from_millis(10)).await;
            }
        }
    }

    let expected: Vec<String> = (0..300).map(|i| format!("line-{}", i)).collect();
    assert_eq!(received, expected);
    assert_eq!(session.wait().await.unwrap().lines_emitted, 300);
}

#[tokio::test]
async fn test_partial_line_survives_a_stall() {
    let source = ScriptedSource::new().feed(
        "slow",
        Feed::new().live(&[b"par", b"tial\n"]).live_every(150),
    );
    let config = SessionConfig {
        partial_line_timeout_ms: 20,
        ..SessionConfig::default()
    };

    let session = Multiplexer::new(source, config).start(ids(&["slow"])).unwrap();
    let (events, summary) = collect(session).await;

    assert_eq!(rendered(&events), vec!["slow:partial"]);
    assert_eq!(summary.unwrap().outcome, Outcome::Done);
}

#[tokio::test]
async fn test_failure_racing_cancel_still_ends_as_canceled() {
    for _ in 0..20 {
        let source = ScriptedSource::new()
            .feed("a", Feed::new().then(LiveEnd::FailOnCancel(Failure::Connection)))
            .feed("b", Feed::new().then(LiveEnd::FailOnCancel(Failure::Connection)));
        let probe = source.probe();

        let session = Multiplexer::new(source, SessionConfig::default())
            .start(ids(&["a", "b"]))
            .unwrap();

        let probe_ref = Arc::clone(&probe);
        wait_for(move || probe_ref.subscribed() == 2).await;
        session.cancel();

        let (_, summary) = timeout(Duration::from_secs(1), collect(session)).await.unwrap();
        assert_eq!(summary.unwrap().outcome, Outcome::Canceled);
    }
}
