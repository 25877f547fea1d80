mod cli;
mod config;
mod demo_worker;
mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use wexec_engine::{ExecutorConfig, InProcessBus, InProcessTransport, RetryOptions, Transport, WorkerTaskExecutor};

use crate::cli::Cli;
use crate::config::ensure_identity;
use crate::shutdown::{ShutdownController, ShutdownEvent, spawn_ctrl_c_handler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let identity = match ensure_identity() {
        Ok(identity) => identity,
        Err(err) => {
            tracing::warn!(error = %err, "failed to read/write executor identity config, using CLI/env values only");
            config::ExecutorIdentity::default()
        }
    };

    let uuid = cli
        .uuid
        .clone()
        .or(identity.uuid)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let exchange = cli.exchange.clone().or(identity.exchange).unwrap_or_else(|| "tasks".to_string());

    let retry_options = RetryOptions::default();
    let config = ExecutorConfig {
        uuid: uuid.clone(),
        exchange,
        topics: cli.topics.clone(),
        transition_timeout: Duration::from_secs(cli.transition_timeout_secs),
        discovery_period: Duration::from_secs(cli.discovery_period_secs),
        worker_staleness_probes: cli.worker_staleness_probes,
        retry_options,
    };

    let bus = InProcessBus::new();
    let transport: Arc<dyn Transport> = Arc::new(InProcessTransport::new(
        bus.clone(),
        uuid.clone(),
        retry_options,
    ));
    let executor = Arc::new(WorkerTaskExecutor::new(config, transport));

    executor.start().await?;
    tracing::info!(%uuid, "executor started, waiting for a worker");

    let demo_worker = if cli.no_demo_worker {
        None
    } else {
        Some(demo_worker::spawn(bus, cli.topics[0].clone()))
    };

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown, shutdown_tx);

    let shortfall = executor.wait_for_workers(1, Duration::from_secs(5)).await;
    if shortfall > 0 {
        tracing::warn!(shortfall, "submitting the demo task with no worker known yet");
    }

    let task_uuid = Uuid::new_v4();
    let outcome_rx = executor.execute_task(
        "add",
        task_uuid,
        serde_json::json!({"a": 1, "b": 2}),
        None,
    )?;

    tokio::select! {
        outcome = outcome_rx => {
            match outcome {
                Ok(Ok(result)) => println!("task {task_uuid} succeeded: {result}"),
                Ok(Err(failure)) => println!("task {task_uuid} failed: {failure}"),
                Err(_) => println!("task {task_uuid} promise dropped before resolving"),
            }
        }
        Some(event) = shutdown_rx.recv() => {
            tracing::info!(?event, "shutdown requested before the demo task completed");
        }
    }

    if let Some(handle) = demo_worker {
        handle.abort();
    }
    executor.stop().await?;
    Ok(())
}
