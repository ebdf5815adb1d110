//! The bookmark/processor-state watermark.
//!
//! The bookmark is carried as a plain string and compared lexicographically
//! — this is only correct because the event source emits `collector_tstamp`
//! in a canonical, time-zone-consistent form, which the SQL layer
//! guarantees by construction.

use std::path::Path;

use crate::error::Result;
use crate::model::ProcessorState;

/// The max `collector_tstamp` observed, if any events were processed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bookmark(Option<String>);

impl Bookmark {
    pub fn empty() -> Self {
        Bookmark(None)
    }

    pub fn from_state(state: Option<&ProcessorState>) -> Self {
        Bookmark(state.map(|s| s.max_raw_event_receiving_time.clone()))
    }

    /// The value to bind as the event source's `collector_tstamp > $1`
    /// predicate. `None` means "no lower bound" (first run).
    pub fn as_predicate(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn value(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn into_state(self) -> Option<ProcessorState> {
        self.0.map(|max_raw_event_receiving_time| ProcessorState { max_raw_event_receiving_time })
    }
}

pub fn load_state(path: Option<&Path>) -> Result<Option<ProcessorState>> {
    let Some(path) = path else { return Ok(None) };
    let text = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&text)?))
}

/// Print the new processor state to stdout as a single JSON object — the
/// mechanism by which the bookmark crosses runs.
pub fn emit_state(state: &ProcessorState) -> Result<()> {
    println!("{}", serde_json::to_string(state)?);
    Ok(())
}
