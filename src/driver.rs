//! The batch driver: iterates the event stream, detects raw session
//! boundaries, drives the state machine, and accumulates the mutations
//! that should land in the two collaborators.
//!
//! This module is the pure "imperative shell" around `state_machine`'s
//! pure core: `process` takes the initial in-memory State Index and the
//! already-ordered event slice, and returns every mutation/emission it
//! would make, with no I/O at all. The async orchestration that actually
//! talks to Postgres lives in `crate::store::postgres` and is invoked
//! from `main`.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::model::{DerivedSessionRow, LastState, PendingSession, RawEvent, SessionAction};
use crate::state_machine::{self, PendingOutcome};

/// A single durable change to the Pending-Session Store, in the order the
/// state machine produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingMutation {
    Upsert(PendingSession),
    Delete(String),
}

/// Everything one call to `process` decided should happen, ready to be
/// applied to the real collaborators (or inspected directly in tests).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchResult {
    pub pending_mutations: Vec<PendingMutation>,
    pub derived_rows: Vec<DerivedSessionRow>,
    /// `None` only when the input event slice was empty.
    pub bookmark: Option<String>,
    /// The State Index as it stood after the last event, handed back so
    /// callers (and tests) can verify convergence without replaying the
    /// mutation list.
    pub final_pending: HashMap<String, PendingSession>,
}

/// Run the batch driver's core loop over `events` (already ordered and
/// filtered by the event source), starting from `initial_pending` (the
/// State Index reconstructed from the Pending-Session Store at startup).
pub fn process(
    initial_pending: HashMap<String, PendingSession>,
    events: &[RawEvent],
) -> Result<BatchResult> {
    let mut pending = initial_pending;
    let mut mutations = Vec::new();
    let mut derived_rows = Vec::new();
    let mut bookmark: Option<String> = None;
    let mut last_event: Option<&RawEvent> = None;

    for event in events {
        let switch = match last_event {
            None => true,
            Some(last) => last.session_id != event.session_id,
        };

        if !switch {
            let transition = state_machine::apply(pending.get(&event.serial), event)?;
            apply_transition(&mut pending, &mut mutations, &mut derived_rows, &event.serial, transition);
        } else {
            if let Some(last) = last_event {
                flush_last_session(&pending, last)?;
            }

            match pending.get(&event.serial).cloned() {
                Some(existing) if existing.raw_session_id == event.session_id => {
                    let transition = state_machine::apply(Some(&existing), event)?;
                    apply_transition(&mut pending, &mut mutations, &mut derived_rows, &event.serial, transition);
                }
                Some(existing) => {
                    // Same serial, different raw_session_id: the prior raw
                    // session's pending entry is no longer current.
                    if existing.last_state != LastState::RealIdle {
                        derived_rows.push(DerivedSessionRow::new(&existing, SessionAction::SessionEnd));
                    }
                    pending.remove(&event.serial);
                    mutations.push(PendingMutation::Delete(event.serial.clone()));
                    initiate_session(&mut pending, &mut mutations, &mut derived_rows, event)?;
                }
                None => {
                    initiate_session(&mut pending, &mut mutations, &mut derived_rows, event)?;
                }
            }
        }

        bookmark = Some(match bookmark {
            None => event.collector_tstamp.clone(),
            Some(current) if event.collector_tstamp > current => event.collector_tstamp.clone(),
            Some(current) => current,
        });

        last_event = Some(event);
    }

    if let Some(last) = last_event {
        flush_last_session(&pending, last)?;
    }

    Ok(BatchResult { pending_mutations: mutations, derived_rows, bookmark, final_pending: pending })
}

fn apply_transition(
    pending: &mut HashMap<String, PendingSession>,
    mutations: &mut Vec<PendingMutation>,
    derived_rows: &mut Vec<DerivedSessionRow>,
    serial: &str,
    transition: state_machine::Transition,
) {
    derived_rows.extend(transition.emissions);
    match transition.outcome {
        None | Some(PendingOutcome::Unchanged) => {}
        Some(PendingOutcome::Upsert(session)) => {
            mutations.push(PendingMutation::Upsert(session.clone()));
            pending.insert(serial.to_string(), session);
        }
        Some(PendingOutcome::Delete) => {
            pending.remove(serial);
            mutations.push(PendingMutation::Delete(serial.to_string()));
        }
    }
}

/// Create a fresh pending session for `event`'s device. A no-op if `event`
/// is a terminator, or if the State Index unexpectedly already holds an
/// entry for this serial (store/memory desync — `StoreOutOfSync`).
fn initiate_session(
    pending: &mut HashMap<String, PendingSession>,
    mutations: &mut Vec<PendingMutation>,
    derived_rows: &mut Vec<DerivedSessionRow>,
    event: &RawEvent,
) -> Result<()> {
    if pending.contains_key(&event.serial) {
        return Err(Error::StoreOutOfSync { serial: event.serial.clone() });
    }

    if let Some((session, emission)) = state_machine::initiate(event) {
        mutations.push(PendingMutation::Upsert(session.clone()));
        pending.insert(event.serial.clone(), session);
        if let Some(row) = emission {
            derived_rows.push(row);
        }
    }

    Ok(())
}

/// Validate that the just-finished raw session's pending entry, if any,
/// still agrees with the last event processed for it. A disagreement
/// means the in-memory index drifted from the event stream's own
/// bookkeeping — a hard error.
fn flush_last_session(pending: &HashMap<String, PendingSession>, last_event: &RawEvent) -> Result<()> {
    if let Some(p) = pending.get(&last_event.serial) {
        if p.raw_session_id != last_event.session_id {
            return Err(Error::UnmatchedPendingSession { serial: last_event.serial.clone() });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Action;
    use chrono::NaiveDateTime;

    fn t(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn event(serial: &str, session_id: &str, action: &str, tstamp: &str, collector: &str) -> RawEvent {
        RawEvent {
            serial: serial.to_string(),
            user_id: "u1".to_string(),
            action: action.parse::<Action>().unwrap(),
            tstamp: t(tstamp),
            collector_tstamp: collector.to_string(),
            session_id: session_id.to_string(),
            session_type: "default".to_string(),
        }
    }

    #[test]
    fn empty_batch_is_idempotent() {
        let result = process(HashMap::new(), &[]).unwrap();
        assert!(result.pending_mutations.is_empty());
        assert!(result.derived_rows.is_empty());
        assert_eq!(result.bookmark, None);
        assert!(result.final_pending.is_empty());
    }

    #[test]
    fn scenario_simple_watch_then_exit() {
        let events = vec![
            event("S1", "R1", "VideoStart", "2024-01-01 00:00:00", "c0"),
            event("S1", "R1", "VideoEnd", "2024-01-01 00:01:00", "c1"),
            event("S1", "R1", "ExitSession", "2024-01-01 00:02:00", "c2"),
        ];
        let result = process(HashMap::new(), &events).unwrap();
        assert_eq!(result.derived_rows.len(), 2);
        assert_eq!(result.derived_rows[0].action, SessionAction::SessionStart);
        assert_eq!(result.derived_rows[0].session_id, "R1/1");
        assert_eq!(result.derived_rows[0].tstamp, t("2024-01-01 00:00:00"));
        assert_eq!(result.derived_rows[1].action, SessionAction::SessionEnd);
        assert_eq!(result.derived_rows[1].tstamp, t("2024-01-01 00:01:00"));
        assert!(result.final_pending.is_empty());
        assert_eq!(result.bookmark.as_deref(), Some("c2"));
    }

    #[test]
    fn scenario_idle_then_resume_same_raw_session() {
        let events = vec![
            event("S1", "R1", "VideoStart", "2024-01-01 00:00:00", "c0"),
            event("S1", "R1", "VideoEnd", "2024-01-01 00:00:30", "c1"),
            event("S1", "R1", "Idle", "2024-01-01 00:10:30", "c2"),
            event("S1", "R1", "VideoStart", "2024-01-01 00:15:00", "c3"),
            event("S1", "R1", "ExitSession", "2024-01-01 00:20:00", "c4"),
        ];
        let result = process(HashMap::new(), &events).unwrap();
        let actions: Vec<_> = result.derived_rows.iter().map(|r| (r.session_id.clone(), r.action, r.tstamp)).collect();
        assert_eq!(
            actions,
            vec![
                ("R1/1".to_string(), SessionAction::SessionStart, t("2024-01-01 00:00:00")),
                ("R1/1".to_string(), SessionAction::SessionEnd, t("2024-01-01 00:00:30")),
                ("R1/2".to_string(), SessionAction::SessionStart, t("2024-01-01 00:15:00")),
                ("R1/2".to_string(), SessionAction::SessionEnd, t("2024-01-01 00:20:00")),
            ]
        );
        assert!(result.final_pending.is_empty());
    }

    #[test]
    fn scenario_same_serial_new_raw_session_while_active() {
        let events = vec![
            event("S1", "R1", "VideoStart", "2024-01-01 00:00:00", "c0"),
            event("S1", "R1", "VideoEnd", "2024-01-01 00:01:00", "c1"), // -> WAIT_INPUT
            event("S1", "R2", "VideoStart", "2024-01-01 00:05:00", "c2"),
        ];
        let result = process(HashMap::new(), &events).unwrap();
        // R1/1 SessionStart, R1/1 SessionEnd (forced by the raw-session switch), R2/1 SessionStart.
        assert_eq!(result.derived_rows.len(), 3);
        assert_eq!(result.derived_rows[1].session_id, "R1/1");
        assert_eq!(result.derived_rows[1].action, SessionAction::SessionEnd);
        assert_eq!(result.derived_rows[1].tstamp, t("2024-01-01 00:01:00"));
        assert_eq!(result.derived_rows[2].session_id, "R2/1");
        assert_eq!(result.derived_rows[2].action, SessionAction::SessionStart);
        let p = result.final_pending.get("S1").unwrap();
        assert_eq!(p.raw_session_id, "R2");
        assert_eq!(p.split_counter, 1);
    }

    #[test]
    fn scenario_same_serial_new_raw_session_while_real_idle() {
        use crate::model::PendingSession;
        let mut initial = HashMap::new();
        initial.insert(
            "S1".to_string(),
            PendingSession {
                serial: "S1".to_string(),
                user_id: "u1".to_string(),
                raw_session_id: "R1".to_string(),
                start_time: t("2024-01-01 00:00:00"),
                last_event_time: t("2024-01-01 00:00:00"),
                session_type: "default".to_string(),
                last_state: LastState::RealIdle,
                split_counter: 2,
            },
        );
        let events = vec![event("S1", "R2", "Idle", "2024-01-01 00:10:00", "c0")];
        let result = process(initial, &events).unwrap();
        assert!(result.derived_rows.is_empty());
        let p = result.final_pending.get("S1").unwrap();
        assert_eq!(p.raw_session_id, "R2");
        assert_eq!(p.last_state, LastState::RealIdle);
        assert_eq!(p.split_counter, 1);
    }

    #[test]
    fn scenario_auto_end_then_trailing_exit_same_instant() {
        let events = vec![
            event("S1", "R1", "VideoStart", "2024-01-01 00:00:00", "c0"),
            event("S1", "R1", "AutoEndSession", "2024-01-01 00:05:00", "c1"),
            event("S1", "R1", "ExitSession", "2024-01-01 00:05:00", "c2"),
        ];
        let result = process(HashMap::new(), &events).unwrap();
        assert_eq!(result.derived_rows.len(), 2);
        assert_eq!(result.derived_rows[1].action, SessionAction::SessionEnd);
        assert!(result.final_pending.is_empty());
    }

    #[test]
    fn oem_serials_are_expected_to_be_filtered_upstream() {
        // The driver itself trusts its input; the OEM exclusion is the event
        // source's job. Demonstrate that an OEM-looking serial is processed
        // like any other if it reaches the driver, to document that the
        // filter boundary is the source, not here.
        let events = vec![event("DEVICE-OEM-1", "R1", "VideoStart", "2024-01-01 00:00:00", "c0")];
        let result = process(HashMap::new(), &events).unwrap();
        assert_eq!(result.derived_rows.len(), 1);
    }

    #[test]
    fn bookmark_tracks_max_collector_tstamp_regardless_of_event_order() {
        let events = vec![
            event("S1", "R1", "VideoStart", "2024-01-01 00:00:00", "b"),
            event("S1", "R1", "VideoEnd", "2024-01-01 00:01:00", "a"),
        ];
        let result = process(HashMap::new(), &events).unwrap();
        assert_eq!(result.bookmark.as_deref(), Some("b"));
    }
}
