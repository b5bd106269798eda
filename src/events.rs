//! Streaming event model and the queues plugin sessions publish through.
//!
//! Events are append-only and ordered within a session; the last event of a
//! session is always a [`StreamEvent::Completion`]. See `PROGRESS:` in the
//! plugin protocol for the stderr wire form these deserialize from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::models::Phase;

/// Which stream an [`StreamEvent::Output`] line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A single event on the plugin↔orchestrator channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Output {
        stream: OutputStream,
        line: String,
    },
    Progress {
        phase: Phase,
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes_downloaded: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes_total: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        items_completed: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        items_total: Option<u64>,
    },
    PhaseStart {
        phase: Phase,
    },
    PhaseEnd {
        phase: Phase,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Completion {
        success: bool,
        exit_code: i32,
        #[serde(default)]
        packages_updated: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A `type` not recognized by this engine version. Preserved rather
    /// than rejected so a newer plugin degrades gracefully against an
    /// older engine.
    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    pub fn is_completion(&self) -> bool {
        matches!(self, StreamEvent::Completion { .. })
    }

    /// Whether this event belongs on the control lane (`PhaseStart`,
    /// `PhaseEnd`, `Completion`) rather than the bounded Output/Progress
    /// lane. Control events carry the invariants consumers rely on
    /// (a session always ends in `Completion`) so they must never be
    /// subject to the drop-newest overflow policy.
    pub fn is_control(&self) -> bool {
        matches!(self, StreamEvent::PhaseStart { .. } | StreamEvent::PhaseEnd { .. } | StreamEvent::Completion { .. })
    }
}

/// A [`StreamEvent`] tagged with its plugin and emission time, the unit
/// actually carried on the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub plugin: String,
    pub timestamp: DateTime<Utc>,
    pub event: StreamEvent,
}

impl TimestampedEvent {
    pub fn new(plugin: &str, event: StreamEvent) -> Self {
        Self { plugin: plugin.to_string(), timestamp: Utc::now(), event }
    }
}

const DEFAULT_CAPACITY: usize = 1000;
const DROP_LOG_INTERVAL: u64 = 100;

enum ControlMessage {
    Event(TimestampedEvent),
    Terminator,
}

/// A queue consumers iterate until a terminator sentinel, backed by two
/// lanes: a bounded, drop-newest lane for `Output`/`Progress`, and a
/// separate unbounded-but-small control lane for `PhaseStart`/`PhaseEnd`/
/// `Completion` and the terminator itself, so backpressure on chatty
/// stdout/stderr never risks silently dropping the session-ending
/// `Completion`.
///
/// `put` routes automatically by event kind — callers never choose a lane
/// themselves. Drop logging follows "first drop, then every `N`th"
/// (`DROP_LOG_INTERVAL`) via [`DropCounter`] rather than logging every
/// drop, so sustained backpressure doesn't flood the log.
pub struct EventQueue {
    rx: mpsc::Receiver<TimestampedEvent>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    dropped: std::sync::Arc<DropCounter>,
    main_open: bool,
    tx: mpsc::Sender<TimestampedEvent>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self { tx, rx, control_tx, control_rx, dropped: std::sync::Arc::new(DropCounter::new()), main_open: true }
    }

    pub fn handle(&self) -> EventQueueHandle {
        EventQueueHandle { tx: self.tx.clone(), control_tx: self.control_tx.clone(), dropped: self.dropped.clone() }
    }

    /// Enqueues the terminator sentinel through the control lane. Callers
    /// iterating via `recv` see it as the end of the stream (`None`).
    pub fn close(&self) {
        let _ = self.control_tx.send(ControlMessage::Terminator);
    }

    pub async fn recv(&mut self) -> Option<TimestampedEvent> {
        loop {
            let control = if self.main_open {
                tokio::select! {
                    c = self.control_rx.recv() => Some(c),
                    m = self.rx.recv() => {
                        match m {
                            Some(ev) => return Some(ev),
                            None => {
                                self.main_open = false;
                                None
                            }
                        }
                    }
                }
            } else {
                Some(self.control_rx.recv().await)
            };

            if let Some(control) = control {
                match control {
                    Some(ControlMessage::Event(ev)) => return Some(ev),
                    Some(ControlMessage::Terminator) => return None,
                    None => return None,
                }
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.total()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A cloneable producer handle for an [`EventQueue`].
#[derive(Clone)]
pub struct EventQueueHandle {
    tx: mpsc::Sender<TimestampedEvent>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    dropped: std::sync::Arc<DropCounter>,
}

impl EventQueueHandle {
    /// Non-blocking put. Control events (`PhaseStart`/`PhaseEnd`/
    /// `Completion`) always succeed unless the queue itself is gone.
    /// Output/Progress events are dropped-newest when the bounded lane is
    /// full, returning `false`.
    pub fn put(&self, event: TimestampedEvent) -> bool {
        if event.event.is_control() {
            return self.control_tx.send(ControlMessage::Event(event)).is_ok();
        }
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                if self.dropped.record() {
                    warn!(total_dropped = self.dropped.total(), "event queue full, dropping newest event");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Enqueues the terminator sentinel. Equivalent to [`EventQueue::close`]
    /// but callable from a cloned producer handle.
    pub fn close(&self) {
        let _ = self.control_tx.send(ControlMessage::Terminator);
    }

    /// Backpressure-respecting put for the Output/Progress lane; control
    /// events still go straight through the unbounded lane. Used by
    /// callers (e.g. unit tests) that want to wait rather than drop.
    pub async fn send(&self, event: TimestampedEvent) {
        if event.event.is_control() {
            let _ = self.control_tx.send(ControlMessage::Event(event));
            return;
        }
        let _ = self.tx.send(event).await;
    }
}

/// Tracks drop counts for a queue whose producer side is cloned across
/// tasks, so drop logging can follow the "first + every Nth" cadence
/// described in the event-queue design.
pub struct DropCounter {
    count: std::sync::atomic::AtomicU64,
}

impl DropCounter {
    pub fn new() -> Self {
        Self { count: std::sync::atomic::AtomicU64::new(0) }
    }

    /// Records a drop and returns whether it should be logged.
    pub fn record(&self) -> bool {
        let n = self.count.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        n == 1 || n % DROP_LOG_INTERVAL == 0
    }

    pub fn total(&self) -> u64 {
        self.count.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl Default for DropCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Severity of a [`validate_event`] finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSeverity {
    Warning,
    Error,
}

/// A single finding from [`validate_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub severity: ValidationSeverity,
    pub message: String,
}

/// Pure, stateless sanity check over a single event's own fields — the
/// tool a validator (e.g. a CLI `validate` subcommand) runs over a
/// recorded event stream. Checks: `Progress::percent` fits in `0..=100`;
/// a `Completion` whose `success`/`exit_code` disagree; an `Unknown`
/// event type. This does not check cross-event invariants like
/// "Completion is last" — that needs the whole stream, not one event.
pub fn validate_event(event: &StreamEvent) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    match event {
        StreamEvent::Progress { percent: Some(p), .. } if *p > 100 => {
            issues.push(ValidationIssue {
                severity: ValidationSeverity::Error,
                message: format!("progress percent {p} out of range 0-100"),
            });
        }
        StreamEvent::Completion { success: true, exit_code, .. } if *exit_code != 0 => {
            issues.push(ValidationIssue {
                severity: ValidationSeverity::Warning,
                message: format!("completion reports success but exit code is {exit_code}"),
            });
        }
        StreamEvent::Completion { success: false, exit_code: 0, .. } => {
            issues.push(ValidationIssue {
                severity: ValidationSeverity::Warning,
                message: "completion reports failure but exit code is 0".to_string(),
            });
        }
        StreamEvent::Unknown => {
            issues.push(ValidationIssue { severity: ValidationSeverity::Warning, message: "unrecognized event type".to_string() });
        }
        _ => {}
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_deserializes_instead_of_erroring() {
        let v: StreamEvent = serde_json::from_str(r#"{"type":"something_new","foo":1}"#).unwrap();
        assert!(matches!(v, StreamEvent::Unknown));
    }

    #[test]
    fn completion_round_trips() {
        let e = StreamEvent::Completion { success: true, exit_code: 0, packages_updated: 3, error: None };
        let s = serde_json::to_string(&e).unwrap();
        assert!(s.contains("\"type\":\"completion\""));
        let back: StreamEvent = serde_json::from_str(&s).unwrap();
        assert!(back.is_completion());
    }

    #[tokio::test]
    async fn put_drops_newest_when_full() {
        let mut queue = EventQueue::new(1);
        let handle = queue.handle();
        let ev = |n: u8| TimestampedEvent::new("p", StreamEvent::Output { stream: OutputStream::Stdout, line: n.to_string() });
        assert!(handle.put(ev(1)));
        assert!(!handle.put(ev(2)));
        let received = queue.recv().await.unwrap();
        if let StreamEvent::Output { line, .. } = received.event {
            assert_eq!(line, "1");
        } else {
            panic!("wrong event");
        }
    }

    #[tokio::test]
    async fn completion_bypasses_a_full_output_lane() {
        let mut queue = EventQueue::new(1);
        let handle = queue.handle();
        handle.put(TimestampedEvent::new("p", StreamEvent::Output { stream: OutputStream::Stdout, line: "1".to_string() }));
        handle.put(TimestampedEvent::new("p", StreamEvent::Output { stream: OutputStream::Stdout, line: "dropped".to_string() }));
        handle.put(TimestampedEvent::new("p", StreamEvent::Completion { success: true, exit_code: 0, packages_updated: 0, error: None }));

        let first = queue.recv().await.unwrap();
        assert!(first.event.is_completion(), "control lane event should be delivered ahead of a backlogged main lane");
    }

    #[tokio::test]
    async fn close_terminates_iteration() {
        let mut queue = EventQueue::new(10);
        let handle = queue.handle();
        handle.put(TimestampedEvent::new("p", StreamEvent::Output { stream: OutputStream::Stdout, line: "1".to_string() }));
        queue.close();

        assert!(queue.recv().await.is_some());
        assert!(queue.recv().await.is_none());
    }

    #[test]
    fn drop_counter_logs_first_and_every_nth() {
        let c = DropCounter::new();
        assert!(c.record());
        for _ in 0..98 {
            assert!(!c.record());
        }
        assert!(c.record());
        assert_eq!(c.total(), 100);
    }

    #[tokio::test]
    async fn drop_cadence_follows_drop_counter_not_every_drop() {
        let mut queue = EventQueue::new(1);
        let handle = queue.handle();
        handle.put(TimestampedEvent::new("p", StreamEvent::Output { stream: OutputStream::Stdout, line: "keep".to_string() }));
        for i in 0..5 {
            assert!(!handle.put(TimestampedEvent::new("p", StreamEvent::Output { stream: OutputStream::Stdout, line: i.to_string() })));
        }
        assert_eq!(queue.dropped_count(), 5);
    }

    #[test]
    fn validate_event_flags_out_of_range_percent() {
        let issues = validate_event(&StreamEvent::Progress {
            phase: Phase::Download,
            percent: Some(150),
            message: None,
            bytes_downloaded: None,
            bytes_total: None,
            items_completed: None,
            items_total: None,
        });
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, ValidationSeverity::Error);
    }

    #[test]
    fn validate_event_flags_inconsistent_completion() {
        let issues = validate_event(&StreamEvent::Completion { success: true, exit_code: 1, packages_updated: 0, error: None });
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, ValidationSeverity::Warning);
    }

    #[test]
    fn validate_event_accepts_well_formed_events() {
        assert!(validate_event(&StreamEvent::Completion { success: true, exit_code: 0, packages_updated: 2, error: None }).is_empty());
        assert!(validate_event(&StreamEvent::Output { stream: OutputStream::Stdout, line: "ok".to_string() }).is_empty());
    }
}
