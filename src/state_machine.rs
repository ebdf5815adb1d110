//! The per-device session state machine.
//!
//! Pure function from `(pending session, incoming event)` to
//! `(new pending session?, emitted rows)`. No I/O; the batch driver
//! (`crate::driver`) is the only thing that talks to the collaborators.
//! This split models the original's out-of-sync exceptions as a tagged
//! error returned from the driver rather than thrown across arbitrary
//! boundaries.

use crate::error::{Error, Result};
use crate::model::{Action, DerivedSessionRow, LastState, PendingSession, RawEvent, SessionAction};

/// What the state machine wants the driver to do with the per-device
/// pending session after processing one event.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOutcome {
    /// No change (e.g. a second `Idle` while already `REAL_IDLE`, or a
    /// trailing `ExitSession` with no pending session to end).
    Unchanged,
    Upsert(PendingSession),
    Delete,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transition {
    pub outcome: Option<PendingOutcome>,
    pub emissions: Vec<DerivedSessionRow>,
}

impl Transition {
    fn unchanged() -> Self {
        Transition { outcome: Some(PendingOutcome::Unchanged), emissions: Vec::new() }
    }

    fn delete() -> Self {
        Transition { outcome: Some(PendingOutcome::Delete), emissions: Vec::new() }
    }

    fn delete_with(emission: DerivedSessionRow) -> Self {
        Transition { outcome: Some(PendingOutcome::Delete), emissions: vec![emission] }
    }

    fn upsert(session: PendingSession) -> Self {
        Transition { outcome: Some(PendingOutcome::Upsert(session)), emissions: Vec::new() }
    }

    fn upsert_with(session: PendingSession, emission: DerivedSessionRow) -> Self {
        Transition { outcome: Some(PendingOutcome::Upsert(session)), emissions: vec![emission] }
    }
}

/// Apply one event to the current pending session for its device.
///
/// `pending` and `event` are assumed to share a `serial` and (when
/// `pending` is `Some`) a `raw_session_id` — the batch driver is
/// responsible for routing boundary-crossing events through
/// `initiate`/flush instead of here.
pub fn apply(pending: Option<&PendingSession>, event: &RawEvent) -> Result<Transition> {
    let pending = match pending {
        None => {
            // No pending session for this device: a trailing
            // ExitSession/AutoEndSession races a prior AutoEndSession that
            // already cleaned the session up. Anything else here is a
            // logic regression upstream (a fresh raw session with no
            // pending row should have gone through `initiate`).
            return if event.action.is_boundary() {
                Ok(Transition::unchanged())
            } else {
                Err(Error::UnreachableTransition {
                    serial: event.serial.clone(),
                    action: event.action.to_string(),
                })
            };
        }
        Some(p) => p,
    };

    if pending.raw_session_id != event.session_id {
        return Err(Error::UnmatchedPendingSession { serial: event.serial.clone() });
    }

    let action = &event.action;

    if action.is_boundary() {
        return match pending.last_state {
            LastState::RealIdle => Ok(Transition::delete()),
            LastState::PlayingVideo | LastState::WaitInput => {
                let emission = DerivedSessionRow::new(pending, SessionAction::SessionEnd);
                Ok(Transition::delete_with(emission))
            }
        };
    }

    match pending.last_state {
        LastState::RealIdle => {
            if action.is_idle() {
                // Two consecutive Idle events.
                Ok(Transition::unchanged())
            } else {
                let mut next = pending.clone();
                next.last_event_time = event.tstamp;
                next.last_state =
                    if action.is_activity_start() { LastState::PlayingVideo } else { LastState::WaitInput };
                next.split_counter += 1;
                let emission = DerivedSessionRow::new(&next, SessionAction::SessionStart);
                Ok(Transition::upsert_with(next, emission))
            }
        }

        LastState::PlayingVideo => {
            let mut next = pending.clone();
            next.last_event_time = event.tstamp;
            next.last_state = if action.is_activity_end() { LastState::WaitInput } else { LastState::PlayingVideo };
            Ok(Transition::upsert(next))
        }

        LastState::WaitInput => {
            if action.is_idle() {
                let mut next = pending.clone();
                next.last_event_time = event.tstamp - crate::model::idle_time();
                next.last_state = LastState::RealIdle;
                let emission = DerivedSessionRow::new(&next, SessionAction::SessionEnd);
                Ok(Transition::upsert_with(next, emission))
            } else if action.is_activity_start() {
                let mut next = pending.clone();
                next.last_event_time = event.tstamp;
                next.last_state = LastState::PlayingVideo;
                Ok(Transition::upsert(next))
            } else {
                let mut next = pending.clone();
                next.last_event_time = event.tstamp;
                // Activity-end and generic interaction both leave WAIT_INPUT.
                next.last_state = LastState::WaitInput;
                Ok(Transition::upsert(next))
            }
        }
    }
}

/// Build a fresh pending session for the first event of a raw session.
///
/// Returns `None` for `ExitSession`/`AutoEndSession` (cannot start on a
/// terminator). Uses the self-consistent action names `VideoStart` /
/// `AudioStart` to decide the initial state, fixing the `StartVideo`/
/// `StartAudio` naming mismatch in
/// `original_source/container/lib/raw_event_processor.py`'s
/// `initiate_pending_session` (that variant can never match real traffic,
/// since raw events never carry `StartVideo`/`StartAudio`).
pub fn initiate(event: &RawEvent) -> Option<(PendingSession, Option<DerivedSessionRow>)> {
    if event.action.is_boundary() {
        return None;
    }

    let last_state = if event.action.is_idle() {
        LastState::RealIdle
    } else if event.action.is_activity_start() {
        LastState::PlayingVideo
    } else {
        LastState::WaitInput
    };

    let session = PendingSession {
        serial: event.serial.clone(),
        user_id: event.user_id.clone(),
        raw_session_id: event.session_id.clone(),
        start_time: event.tstamp,
        last_event_time: event.tstamp,
        session_type: event.session_type.clone(),
        last_state,
        split_counter: 1,
    };

    let emission =
        (last_state != LastState::RealIdle).then(|| DerivedSessionRow::new(&session, SessionAction::SessionStart));

    Some((session, emission))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn t(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn event(serial: &str, session_id: &str, action: &str, tstamp: &str) -> RawEvent {
        RawEvent {
            serial: serial.to_string(),
            user_id: "u1".to_string(),
            action: action.parse().unwrap(),
            tstamp: t(tstamp),
            collector_tstamp: tstamp.to_string(),
            session_id: session_id.to_string(),
            session_type: "default".to_string(),
        }
    }

    fn pending(serial: &str, session_id: &str, state: LastState, last_event_time: &str, split: i32) -> PendingSession {
        PendingSession {
            serial: serial.to_string(),
            user_id: "u1".to_string(),
            raw_session_id: session_id.to_string(),
            start_time: t(last_event_time),
            last_event_time: t(last_event_time),
            session_type: "default".to_string(),
            last_state: state,
            split_counter: split,
        }
    }

    #[test]
    fn action_ord_matches_wire_tiebreak() {
        // AutoEndSession must sort before ExitSession at the same instant.
        assert!(Action::AutoEndSession < Action::ExitSession);
    }

    #[test]
    fn initiate_on_video_start_plays() {
        let e = event("S1", "R1", "VideoStart", "2024-01-01 00:00:00");
        let (session, emission) = initiate(&e).unwrap();
        assert_eq!(session.last_state, LastState::PlayingVideo);
        assert_eq!(session.split_counter, 1);
        let emission = emission.expect("VideoStart initiate must emit SessionStart");
        assert_eq!(emission.action, SessionAction::SessionStart);
        assert_eq!(emission.session_id, "R1/1");
    }

    #[test]
    fn initiate_on_idle_is_silent() {
        let e = event("S1", "R1", "Idle", "2024-01-01 00:00:00");
        let (session, emission) = initiate(&e).unwrap();
        assert_eq!(session.last_state, LastState::RealIdle);
        assert!(emission.is_none());
    }

    #[test]
    fn initiate_on_terminator_is_noop() {
        let e = event("S1", "R1", "ExitSession", "2024-01-01 00:00:00");
        assert!(initiate(&e).is_none());
    }

    #[test]
    fn scenario_simple_watch_then_exit() {
        let p = pending("S1", "R1", LastState::PlayingVideo, "2024-01-01 00:00:00", 1);
        let video_end = event("S1", "R1", "VideoEnd", "2024-01-01 00:01:00");
        let t1 = apply(Some(&p), &video_end).unwrap();
        let p = match t1.outcome.unwrap() {
            PendingOutcome::Upsert(s) => s,
            other => panic!("expected upsert, got {other:?}"),
        };
        assert_eq!(p.last_state, LastState::WaitInput);
        assert!(t1.emissions.is_empty());

        let exit = event("S1", "R1", "ExitSession", "2024-01-01 00:02:00");
        let t2 = apply(Some(&p), &exit).unwrap();
        assert_eq!(t2.outcome, Some(PendingOutcome::Delete));
        assert_eq!(t2.emissions.len(), 1);
        assert_eq!(t2.emissions[0].action, SessionAction::SessionEnd);
        assert_eq!(t2.emissions[0].tstamp, t("2024-01-01 00:01:00"));
    }

    #[test]
    fn scenario_idle_backdates_then_resumes() {
        let p = pending("S1", "R1", LastState::WaitInput, "2024-01-01 00:00:30", 1);
        let idle = event("S1", "R1", "Idle", "2024-01-01 00:10:30"); // t0+630s
        let t1 = apply(Some(&p), &idle).unwrap();
        let p = match t1.outcome.unwrap() {
            PendingOutcome::Upsert(s) => s,
            other => panic!("expected upsert, got {other:?}"),
        };
        assert_eq!(p.last_state, LastState::RealIdle);
        assert_eq!(p.last_event_time, t("2024-01-01 00:00:30")); // 00:10:30 - 600s
        assert_eq!(t1.emissions.len(), 1);
        assert_eq!(t1.emissions[0].action, SessionAction::SessionEnd);
        assert_eq!(t1.emissions[0].tstamp, t("2024-01-01 00:00:30"));

        let resume = event("S1", "R1", "VideoStart", "2024-01-01 00:15:00");
        let t2 = apply(Some(&p), &resume).unwrap();
        let p = match t2.outcome.unwrap() {
            PendingOutcome::Upsert(s) => s,
            other => panic!("expected upsert, got {other:?}"),
        };
        assert_eq!(p.split_counter, 2);
        assert_eq!(t2.emissions[0].session_id, "R1/2");
    }

    #[test]
    fn real_idle_drops_without_emission_on_new_raw_session() {
        // This only covers the state-machine half; the cross-raw-session
        // drop itself is driver behavior (see driver.rs tests).
        let p = pending("S1", "R1", LastState::RealIdle, "2024-01-01 00:00:00", 2);
        assert_eq!(p.last_state, LastState::RealIdle);
    }

    #[test]
    fn auto_end_then_trailing_exit_is_dropped() {
        let p = pending("S1", "R1", LastState::WaitInput, "2024-01-01 00:00:00", 1);
        let auto_end = event("S1", "R1", "AutoEndSession", "2024-01-01 00:01:00");
        let t1 = apply(Some(&p), &auto_end).unwrap();
        assert_eq!(t1.outcome, Some(PendingOutcome::Delete));
        assert_eq!(t1.emissions.len(), 1);

        // No pending session now; a trailing ExitSession must be dropped silently.
        let exit = event("S1", "R1", "ExitSession", "2024-01-01 00:01:00");
        let t2 = apply(None, &exit).unwrap();
        assert_eq!(t2.outcome, Some(PendingOutcome::Unchanged));
        assert!(t2.emissions.is_empty());
    }

    #[test]
    fn no_pending_non_boundary_is_unreachable() {
        let e = event("S1", "R1", "VideoStart", "2024-01-01 00:00:00");
        assert!(matches!(apply(None, &e), Err(Error::UnreachableTransition { .. })));
    }

    #[test]
    fn idle_while_playing_video_does_not_end_session() {
        let p = pending("S1", "R1", LastState::PlayingVideo, "2024-01-01 00:00:00", 1);
        let idle = event("S1", "R1", "Idle", "2024-01-01 00:05:00");
        let t1 = apply(Some(&p), &idle).unwrap();
        let p = match t1.outcome.unwrap() {
            PendingOutcome::Upsert(s) => s,
            other => panic!("expected upsert, got {other:?}"),
        };
        assert_eq!(p.last_state, LastState::PlayingVideo);
        assert!(t1.emissions.is_empty());
    }
}
