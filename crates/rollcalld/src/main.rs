use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rollcall_core::{DescriptorRepository, FrameInput};
use rollcall_store::SqliteStore;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use engine::{EngineHandle, FramePacer, PendingFrame};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::load().context("invalid configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        frame_interval_ms = config.frame_interval_ms,
        max_faces = config.session.tracker.max_faces,
        liveness = ?config.session.liveness.mode,
        cutoff = %config.session.decision.cutoff,
        "configuration loaded"
    );

    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("failed to open store at {}", config.db_path.display()))?;
    let repository = DescriptorRepository::new(store, config.session.repository);
    let identities = repository
        .identities()
        .context("failed to read enrolled identities")?;
    tracing::info!(identities = identities.len(), "descriptor repository ready");

    let rng = match config.rng_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let engine = engine::spawn_engine(repository, config.session.clone(), rng)
        .context("failed to start engine")?;

    tracing::info!("rollcalld ready, reading frames from stdin");

    let mut pacer = FramePacer::new(config.frame_interval_ms);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("failed to read stdin")? {
                    Some(line) => {
                        intake(&engine, &mut pacer, &mut in_flight, &line).await?;
                        while in_flight.try_join_next().is_some() {}
                    }
                    None => {
                        tracing::info!("stdin closed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                break;
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "notification task failed");
        }
    }
    engine.stop().await.context("engine did not stop cleanly")?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}

/// Operator commands accepted on stdin alongside frames.
#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum ControlCommand {
    /// Discard tracks and in-progress challenges.
    Reset,
}

#[derive(Deserialize)]
struct Control {
    command: ControlCommand,
}

/// Parse one input line and hand it to the engine if pacing allows.
/// Accepted frames get a reporting task in `in_flight`.
async fn intake(
    engine: &EngineHandle,
    pacer: &mut FramePacer,
    in_flight: &mut JoinSet<()>,
    line: &str,
) -> Result<()> {
    if line.trim().is_empty() {
        return Ok(());
    }
    if let Ok(Control { command }) = serde_json::from_str::<Control>(line) {
        match command {
            ControlCommand::Reset => {
                engine.reset().await.context("engine reset failed")?;
                pacer.reset();
                tracing::info!("session reset");
            }
        }
        return Ok(());
    }
    let input: FrameInput = match serde_json::from_str(line) {
        Ok(input) => input,
        Err(e) => {
            tracing::warn!(error = %e, "skipping malformed frame line");
            return Ok(());
        }
    };
    if !pacer.admit(input.captured_at) {
        tracing::debug!(index = input.index, "frame arrived early, skipped");
        return Ok(());
    }
    if let Some(pending) = engine.try_submit(input)? {
        in_flight.spawn(report(pending));
    }
    Ok(())
}

/// Emit one JSON notification line per decision.
async fn report(pending: PendingFrame) {
    let outcome = match pending.outcome().await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, "frame cycle failed");
            return;
        }
    };
    for decision in &outcome.decisions {
        let notification = decision.notification();
        tracing::info!(
            identity = ?notification.identity_id,
            status = %notification.status,
            confidence = notification.confidence,
            rejection = ?decision.rejection,
            track_id = ?decision.track_id,
            "attendance decision"
        );
        match serde_json::to_string(&notification) {
            Ok(json) => println!("{json}"),
            Err(e) => tracing::error!(error = %e, "failed to encode notification"),
        }
    }
}
