//! The three external collaborators as traits, so the batch orchestration
//! (`run_batch` below) can be driven against either the real
//! PostgreSQL-backed implementations (`store::postgres`) or in-memory fakes
//! in tests — mirroring the `Box<dyn Reader>` pattern in
//! `docc-lab-pythia`'s `src/reader/mod.rs`.

pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::driver::PendingMutation;
use crate::error::Result;
use crate::model::{DerivedSessionRow, PendingSession, RawEvent};

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Events with `collector_tstamp > bookmark`, OEM serials excluded,
    /// ordered `serial, tstamp, action`.
    async fn select_new_events(&self, bookmark: Option<&str>) -> Result<Vec<RawEvent>>;
}

#[async_trait]
pub trait PendingSessionStore: Send + Sync {
    /// Reconstruct the State Index at startup. A duplicate `serial` is a
    /// hard error.
    async fn load_all(&self) -> Result<HashMap<String, PendingSession>>;

    async fn bootstrap(&self) -> Result<()>;
    async fn drop_table(&self) -> Result<()>;

    /// Apply every mutation in order. Commits iff `commit` is true —
    /// `--debug` passes `false` so nothing durable happens.
    async fn apply_mutations(&self, mutations: &[PendingMutation], commit: bool) -> Result<()>;
}

#[async_trait]
pub trait DerivedSessionSink: Send + Sync {
    async fn bootstrap(&self) -> Result<()>;
    async fn drop_table(&self) -> Result<()>;

    /// Append every row in order. Commits iff `commit` is true.
    async fn insert_rows(&self, rows: &[DerivedSessionRow], commit: bool) -> Result<()>;
}

/// Run one incremental batch end to end: load the State Index, pull new
/// events, run the pure driver core, then persist the results in the
/// order that keeps the State Index authoritative if the process dies
/// mid-commit (pending store before derived sink).
///
/// Returns the new bookmark, or `None` if no events were processed.
pub async fn run_batch(
    event_source: &dyn EventSource,
    pending_store: &dyn PendingSessionStore,
    derived_sink: &dyn DerivedSessionSink,
    bookmark: Option<&str>,
    commit: bool,
) -> Result<Option<String>> {
    let initial_pending = pending_store.load_all().await?;
    let events = event_source.select_new_events(bookmark).await?;

    let result = crate::driver::process(initial_pending, &events)?;

    pending_store.apply_mutations(&result.pending_mutations, commit).await?;
    derived_sink.insert_rows(&result.derived_rows, commit).await?;

    Ok(result.bookmark)
}
