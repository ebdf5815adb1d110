//! PostgreSQL-backed collaborators.
//!
//! Table and column names here are part of the external interface:
//! `cros_derived.pending_sessions` keyed by `serial`, and the append-only
//! `cros_derived.cros_sessions`. The raw event source query is the literal
//! one carried over from `original_source/container/lib/raw_event_processor.py`
//! (a Snowplow-style `atomic` schema: the action/context tables are joined
//! against `atomic.events` to pick up `derived_tstamp`/`collector_tstamp`,
//! the distinct ingestion-time watermark the bookmark advances on).

use std::collections::HashMap;
use std::str::FromStr;

use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

use crate::config::ConnectionConfig;
use crate::driver::PendingMutation;
use crate::error::{Error, Result};
use crate::model::{Action, DerivedSessionRow, LastState, PendingSession, RawEvent};

use super::{DerivedSessionSink, EventSource, PendingSessionStore};

const PENDING_SESSIONS_TABLE: &str = "cros_derived.pending_sessions";
const CROS_SESSIONS_TABLE: &str = "cros_derived.cros_sessions";

const RAW_ACTION_EVENT_TABLE: &str = "atomic.us_vibe_cros_action_event_1";
const RAW_EVENT_CONTEXT_TABLE: &str = "atomic.us_vibe_cros_event_context_1";
const RAW_EVENT_TABLE: &str = "atomic.events";

/// Open a connection and spawn its driving task, per the standard
/// `tokio-postgres` pattern.
pub async fn connect(config: &ConnectionConfig) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(&config.to_postgres_config_string(), NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            log::error!("postgres connection error: {e}");
        }
    });
    Ok(client)
}

pub struct PgEventSource {
    client: Mutex<Client>,
}

impl PgEventSource {
    pub fn new(client: Client) -> Self {
        PgEventSource { client: Mutex::new(client) }
    }
}

#[async_trait::async_trait]
impl EventSource for PgEventSource {
    async fn select_new_events(&self, bookmark: Option<&str>) -> Result<Vec<RawEvent>> {
        let client = self.client.lock().await;
        let query = format!(
            "SELECT
                ctx.serial,
                ctx.user_id,
                ae.action,
                e.derived_tstamp AS tstamp,
                e.collector_tstamp::text AS collector_tstamp,
                ctx.session_id,
                ctx.session_type
            FROM {RAW_ACTION_EVENT_TABLE} ae
            JOIN {RAW_EVENT_CONTEXT_TABLE} ctx ON ae.root_id = ctx.root_id
            JOIN {RAW_EVENT_TABLE} e ON e.event_id = ctx.root_id
            WHERE ctx.serial NOT LIKE '%OEM%'
                AND ($1::text IS NULL OR e.collector_tstamp::text > $1::text)
            ORDER BY ctx.serial, e.derived_tstamp, ae.action"
        );
        let rows = client.query(&query, &[&bookmark]).await?;
        rows.into_iter()
            .map(|row| {
                Ok(RawEvent {
                    serial: row.try_get("serial")?,
                    user_id: row.try_get("user_id")?,
                    action: Action::from_str(row.try_get::<_, &str>("action")?).unwrap(),
                    tstamp: row.try_get("tstamp")?,
                    collector_tstamp: row.try_get("collector_tstamp")?,
                    session_id: row.try_get("session_id")?,
                    session_type: row.try_get("session_type")?,
                })
            })
            .collect()
    }
}

pub struct PgPendingStore {
    client: Mutex<Client>,
}

impl PgPendingStore {
    pub fn new(client: Client) -> Self {
        PgPendingStore { client: Mutex::new(client) }
    }
}

#[async_trait::async_trait]
impl PendingSessionStore for PgPendingStore {
    async fn load_all(&self) -> Result<HashMap<String, PendingSession>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT serial, user_id, raw_session_id, start_time, last_event_time,
                            session_type, last_state, split_counter
                     FROM {PENDING_SESSIONS_TABLE}"
                ),
                &[],
            )
            .await?;

        let mut pending = HashMap::with_capacity(rows.len());
        for row in rows {
            let serial: String = row.try_get("serial")?;
            let last_state: String = row.try_get("last_state")?;
            let session = PendingSession {
                serial: serial.clone(),
                user_id: row.try_get("user_id")?,
                raw_session_id: row.try_get("raw_session_id")?,
                start_time: row.try_get("start_time")?,
                last_event_time: row.try_get("last_event_time")?,
                session_type: row.try_get("session_type")?,
                last_state: LastState::from_str(&last_state).map_err(Error::Config)?,
                split_counter: row.try_get("split_counter")?,
            };
            if pending.insert(serial.clone(), session).is_some() {
                return Err(Error::UnmatchedPendingSession { serial });
            }
        }
        Ok(pending)
    }

    async fn bootstrap(&self) -> Result<()> {
        let client = self.client.lock().await;
        client.batch_execute("CREATE SCHEMA IF NOT EXISTS cros_derived").await?;
        client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {PENDING_SESSIONS_TABLE} (
                    serial          VARCHAR(128)    PRIMARY KEY,
                    user_id         VARCHAR(128)    NOT NULL,
                    raw_session_id  VARCHAR(128)    NOT NULL,
                    start_time      TIMESTAMP       NOT NULL,
                    last_event_time TIMESTAMP       NOT NULL,
                    session_type    VARCHAR(128)    NOT NULL,
                    last_state      VARCHAR(128)    NOT NULL,
                    split_counter   INT             NOT NULL
                )"
            ))
            .await?;
        Ok(())
    }

    async fn drop_table(&self) -> Result<()> {
        let client = self.client.lock().await;
        client.batch_execute(&format!("DROP TABLE IF EXISTS {PENDING_SESSIONS_TABLE}")).await?;
        Ok(())
    }

    async fn apply_mutations(&self, mutations: &[PendingMutation], commit: bool) -> Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        for mutation in mutations {
            match mutation {
                PendingMutation::Upsert(session) => {
                    tx.execute(
                        &format!(
                            "INSERT INTO {PENDING_SESSIONS_TABLE}
                                (serial, user_id, raw_session_id, start_time, last_event_time,
                                 session_type, last_state, split_counter)
                             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                             ON CONFLICT (serial) DO UPDATE SET
                                user_id = EXCLUDED.user_id,
                                raw_session_id = EXCLUDED.raw_session_id,
                                start_time = EXCLUDED.start_time,
                                last_event_time = EXCLUDED.last_event_time,
                                session_type = EXCLUDED.session_type,
                                last_state = EXCLUDED.last_state,
                                split_counter = EXCLUDED.split_counter"
                        ),
                        &[
                            &session.serial,
                            &session.user_id,
                            &session.raw_session_id,
                            &session.start_time,
                            &session.last_event_time,
                            &session.session_type,
                            &session.last_state.as_str(),
                            &session.split_counter,
                        ],
                    )
                    .await?;
                }
                PendingMutation::Delete(serial) => {
                    tx.execute(&format!("DELETE FROM {PENDING_SESSIONS_TABLE} WHERE serial = $1"), &[serial])
                        .await?;
                }
            }
        }
        if commit {
            tx.commit().await?;
        }
        Ok(())
    }
}

pub struct PgDerivedSink {
    client: Mutex<Client>,
}

impl PgDerivedSink {
    pub fn new(client: Client) -> Self {
        PgDerivedSink { client: Mutex::new(client) }
    }
}

#[async_trait::async_trait]
impl DerivedSessionSink for PgDerivedSink {
    async fn bootstrap(&self) -> Result<()> {
        let client = self.client.lock().await;
        client.batch_execute("CREATE SCHEMA IF NOT EXISTS cros_derived").await?;
        // Key-less / append-only: a `serial` primary key on this table
        // would reject every row after a device's first.
        client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {CROS_SESSIONS_TABLE} (
                    serial          VARCHAR(128)    NOT NULL,
                    user_id         VARCHAR(128)    NOT NULL,
                    session_id      VARCHAR(128)    NOT NULL,
                    tstamp          TIMESTAMP       NOT NULL,
                    session_type    VARCHAR(128)    NOT NULL,
                    action          VARCHAR(128)    NOT NULL
                )"
            ))
            .await?;
        Ok(())
    }

    async fn drop_table(&self) -> Result<()> {
        let client = self.client.lock().await;
        client.batch_execute(&format!("DROP TABLE IF EXISTS {CROS_SESSIONS_TABLE}")).await?;
        Ok(())
    }

    async fn insert_rows(&self, rows: &[DerivedSessionRow], commit: bool) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        for row in rows {
            tx.execute(
                &format!(
                    "INSERT INTO {CROS_SESSIONS_TABLE}
                        (serial, user_id, session_id, tstamp, session_type, action)
                     VALUES ($1, $2, $3, $4, $5, $6)"
                ),
                &[&row.serial, &row.user_id, &row.session_id, &row.tstamp, &row.session_type, &row.action.as_str()],
            )
            .await?;
        }
        if commit {
            tx.commit().await?;
        }
        Ok(())
    }
}
