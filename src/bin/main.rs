//! CLI entry point. Single current-thread runtime: this pipeline processes
//! one incremental batch per invocation and is meant to be driven by an
//! external scheduler (cron, Airflow, ...), not to run its own event loop.

use clap::Parser;

use cros_session_deriver::config::{Cli, ConnectionConfig};
use cros_session_deriver::store::postgres::{self, PgDerivedSink, PgEventSource, PgPendingStore};
use cros_session_deriver::store::{run_batch, DerivedSessionSink, EventSource, PendingSessionStore};
use cros_session_deriver::{bookmark, Result};

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_io().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(real_main(cli)) {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn real_main(cli: Cli) -> Result<()> {
    let raw_config = ConnectionConfig::load(&cli.raw)?;
    let cros_config = ConnectionConfig::load(&cli.cros)?;
    let intermediate_config = match &cli.intermediate {
        Some(path) => ConnectionConfig::load(path)?,
        None => cros_config.clone(),
    };

    if cli.drop {
        let pending_store = PgPendingStore::new(postgres::connect(&intermediate_config).await?);
        let derived_sink = PgDerivedSink::new(postgres::connect(&cros_config).await?);
        pending_store.drop_table().await?;
        derived_sink.drop_table().await?;
        log::info!("dropped pending_sessions and cros_sessions");
        return Ok(());
    }

    let event_source = PgEventSource::new(postgres::connect(&raw_config).await?);
    let pending_store = PgPendingStore::new(postgres::connect(&intermediate_config).await?);
    let derived_sink = PgDerivedSink::new(postgres::connect(&cros_config).await?);

    pending_store.bootstrap().await?;
    derived_sink.bootstrap().await?;

    let state = bookmark::load_state(cli.state.as_deref())?;
    let bookmark = bookmark::Bookmark::from_state(state.as_ref());

    let new_bookmark = run_batch(
        &event_source as &dyn EventSource,
        &pending_store as &dyn PendingSessionStore,
        &derived_sink as &dyn DerivedSessionSink,
        bookmark.as_predicate(),
        !cli.debug,
    )
    .await?;

    if !cli.debug {
        let max_raw_event_receiving_time = new_bookmark.or_else(|| bookmark.value().map(str::to_string));
        if let Some(max_raw_event_receiving_time) = max_raw_event_receiving_time {
            bookmark::emit_state(&cros_session_deriver::model::ProcessorState { max_raw_event_receiving_time })?;
        }
    }

    Ok(())
}
