//! flowgated: content filter demo daemon
//!
//! Starts the engine with one simulated filter agent, pushes scripted
//! traffic through it and logs what came out.
//!
//! Usage: `flowgated [config.toml]`

mod agent;
mod config;
mod sim;

use anyhow::{anyhow, Result};
use config::DaemonConfig;
use flowgate_core::{Engine, FrameChannel, StaticPolicy, SystemClock};
use flowgate_proto::{Action, ActionMessage, FlowId};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => DaemonConfig::load(Path::new(&path))?,
        None => DaemonConfig::default(),
    };

    info!("flowgated starting...");
    let policy = Arc::new(StaticPolicy::new(config.agent.policy_unit));
    let engine = Engine::new(config.engine.clone(), Arc::new(SystemClock), policy)?;

    let (channel, rx) = FrameChannel::bounded(config.agent.channel_capacity);
    let handle = engine.connect_filter(config.agent.unit, Arc::new(channel))?;
    engine.set_policy_unit(handle, config.agent.policy_unit)?;
    if let Some(key) = &config.agent.crypto_key {
        engine.handle_action(
            handle,
            ActionMessage::new(FlowId(0), Action::SetCryptoKey { key: key.as_bytes().to_vec() }),
        )?;
    }
    info!("Agent connected on unit {}", handle.unit());

    let running = Arc::new(AtomicBool::new(true));
    let agent = agent::spawn(
        engine.clone(),
        handle,
        rx,
        config.agent.clone(),
        running.clone(),
    )?;
    let mut workers = engine.spawn_workers()?;

    let traffic = sim::run_traffic(&engine, &config.traffic)?;

    running.store(false, Ordering::Relaxed);
    let report = agent.join().map_err(|_| anyhow!("agent thread panicked"))?;
    workers.stop();
    engine.disconnect_filter(handle)?;

    info!("Traffic: {}", serde_json::to_string(&traffic)?);
    info!("Agent: {}", serde_json::to_string(&report)?);
    info!("Engine: {}", serde_json::to_string(&engine.counters())?);
    info!("flowgated shutting down");
    Ok(())
}
