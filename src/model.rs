//! Domain types for the session-derivation pipeline.
//!
//! These are explicit, named-field records, never a generic map of
//! key/value pairs standing in for a proper type.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// The trailing window subtracted from an `Idle` event's timestamp when
/// sealing a derived session into `REAL_IDLE`.
pub const IDLE_TIME_SECS: i64 = 600;

pub fn idle_time() -> Duration {
    Duration::seconds(IDLE_TIME_SECS)
}

/// The action kind carried by a raw telemetry event.
///
/// `Generic` covers any action name other than the seven named ones (a
/// catch-all "interaction" bucket). Its `Ord` impl compares by wire string,
/// matching the `ORDER BY ... ae.action` tiebreak from
/// `original_source/container/lib/raw_event_processor.py` — this is the
/// mechanism that guarantees `AutoEndSession` sorts before `ExitSession`.
#[derive(Debug, Clone)]
pub enum Action {
    VideoStart,
    VideoEnd,
    AudioStart,
    AudioEnd,
    Idle,
    ExitSession,
    AutoEndSession,
    Generic(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::VideoStart => "VideoStart",
            Action::VideoEnd => "VideoEnd",
            Action::AudioStart => "AudioStart",
            Action::AudioEnd => "AudioEnd",
            Action::Idle => "Idle",
            Action::ExitSession => "ExitSession",
            Action::AutoEndSession => "AutoEndSession",
            Action::Generic(s) => s.as_str(),
        }
    }

    /// `ExitSession` / `AutoEndSession` — the two boundary (session-ending)
    /// events.
    pub fn is_boundary(&self) -> bool {
        matches!(self, Action::ExitSession | Action::AutoEndSession)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Action::Idle)
    }

    pub fn is_activity_start(&self) -> bool {
        matches!(self, Action::VideoStart | Action::AudioStart)
    }

    pub fn is_activity_end(&self) -> bool {
        matches!(self, Action::VideoEnd | Action::AudioEnd)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "VideoStart" => Action::VideoStart,
            "VideoEnd" => Action::VideoEnd,
            "AudioStart" => Action::AudioStart,
            "AudioEnd" => Action::AudioEnd,
            "Idle" => Action::Idle,
            "ExitSession" => Action::ExitSession,
            "AutoEndSession" => Action::AutoEndSession,
            other => Action::Generic(other.to_string()),
        })
    }
}

impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Action {}

impl PartialOrd for Action {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Action {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

/// Per-device activity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastState {
    RealIdle,
    PlayingVideo,
    WaitInput,
}

impl LastState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LastState::RealIdle => "REAL_IDLE",
            LastState::PlayingVideo => "PLAYING_VIDEO",
            LastState::WaitInput => "WAIT_INPUT",
        }
    }
}

impl fmt::Display for LastState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LastState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REAL_IDLE" => Ok(LastState::RealIdle),
            "PLAYING_VIDEO" => Ok(LastState::PlayingVideo),
            "WAIT_INPUT" => Ok(LastState::WaitInput),
            other => Err(format!("unknown last_state {other:?}")),
        }
    }
}

/// An immutable raw telemetry event, as selected from the event source.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub serial: String,
    pub user_id: String,
    pub action: Action,
    pub tstamp: NaiveDateTime,
    /// Kept as the canonical string form straight off the wire; the
    /// bookmark is advanced by plain string comparison.
    pub collector_tstamp: String,
    pub session_id: String,
    pub session_type: String,
}

/// Per-device state carrying the currently-open derived session across
/// batches. At most one exists per `serial`.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSession {
    pub serial: String,
    pub user_id: String,
    pub raw_session_id: String,
    pub start_time: NaiveDateTime,
    pub last_event_time: NaiveDateTime,
    pub session_type: String,
    pub last_state: LastState,
    pub split_counter: i32,
}

impl PendingSession {
    /// `"<raw_session_id>/<split_counter>"`, computed at emit time from
    /// the session's *current* field values.
    pub fn derived_session_id(&self) -> String {
        format!("{}/{}", self.raw_session_id, self.split_counter)
    }
}

/// The two derived-session actions emitted to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    SessionStart,
    SessionEnd,
}

impl SessionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionAction::SessionStart => "SessionStart",
            SessionAction::SessionEnd => "SessionEnd",
        }
    }
}

impl fmt::Display for SessionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An append-only derived session row.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedSessionRow {
    pub serial: String,
    pub user_id: String,
    pub session_id: String,
    pub tstamp: NaiveDateTime,
    pub session_type: String,
    pub action: SessionAction,
}

impl DerivedSessionRow {
    pub fn new(session: &PendingSession, action: SessionAction) -> Self {
        DerivedSessionRow {
            serial: session.serial.clone(),
            user_id: session.user_id.clone(),
            session_id: session.derived_session_id(),
            tstamp: session.last_event_time,
            session_type: session.session_type.clone(),
            action,
        }
    }
}

/// The durable processor state carried between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorState {
    pub max_raw_event_receiving_time: String,
}
