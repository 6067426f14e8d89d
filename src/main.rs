// =============================================================================
// Matrixon Timeline - Main Entry Point
// =============================================================================
//
// Project: Matrixon - Gap-aware room timeline engine
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Command line front end. `replay` drives the engine from a scripted
//   transport on an in-memory database and prints each room's live view;
//   `check-config` validates a configuration file.
//
// =============================================================================

use std::{sync::Arc, time::Instant};

use anyhow::Context;
use matrixon_timeline::{
    config,
    core::{Direction, NoopDecryptor, TimelineConfig},
    database::KeyValueDatabase,
    service::rooms::pagination::PaginationOutcome,
    transport::ReplayTransport,
    Services,
};
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

mod clap;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = clap::parse();

    let config = match config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("It looks like your config is invalid. The following error occurred: {e}");
            std::process::exit(1);
        }
    };

    let filter = args.log_level.as_deref().unwrap_or(&config.log);
    let filter_layer = match EnvFilter::try_new(filter) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("It looks like your log filter is invalid. The following error occurred while parsing it: {e}");
            EnvFilter::try_new("warn")?
        }
    };
    tracing_subscriber::Registry::default()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::Layer::new())
        .try_init()?;

    info!(version = %clap::version(), "🚀 Starting Matrixon Timeline");

    match args.command {
        clap::Commands::Replay { script, paginate } => replay(config, &script, paginate, args.verbose).await,
        clap::Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn replay(config: TimelineConfig, script: &std::path::Path, paginate: u32, verbose: bool) -> anyhow::Result<()> {
    let start_time = Instant::now();

    let transport = Arc::new(
        ReplayTransport::from_path(script).with_context(|| format!("loading {}", script.display()))?,
    );
    let db = Arc::new(KeyValueDatabase::in_memory()?);
    let services = Services::build(db, config, transport.clone(), Arc::new(NoopDecryptor))?;

    while transport.pending_syncs() > 0 {
        for diff in services.sync_once().await? {
            if verbose {
                println!("{}", serde_json::to_string(&diff)?);
            }
        }
    }

    let rooms = services.rooms.timeline.known_rooms().await?;
    for room_id in &rooms {
        for _ in 0..paginate {
            match services.request_page(room_id, Direction::Backward, None).await {
                Ok(PaginationOutcome::ReachedEnd) => break,
                Ok(PaginationOutcome::Applied { inserted, .. }) => {
                    info!(%room_id, inserted = inserted.len(), "Paginated backwards");
                }
                Err(e) if e.is_retryable() => {
                    warn!(%room_id, error = %e, "Pagination failed, moving on");
                    break;
                }
                Err(e) => {
                    error!(%room_id, error = %e, "Pagination failed");
                    return Err(e.into());
                }
            }
        }

        println!("{room_id}");
        for item in services.live_view(room_id).await? {
            let marker = match &item.send_state {
                Some(state) if state.is_confirmed() => "✓",
                Some(state) if state.is_failed() => "✗",
                Some(_) => "…",
                None => " ",
            };
            let kind = item.event.kind.to_string();
            let body = item.event.body().unwrap_or(&kind);
            println!("  {marker} {} {}: {body}", item.event.event_id, item.event.sender);
        }
    }

    info!(rooms = rooms.len(), "🎉 Replay finished in {:?}", start_time.elapsed());
    Ok(())
}
