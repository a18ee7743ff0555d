use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use playforge_core::validator;
use playforge_pipeline::{Pipeline, PipelineConfig, spawn_cleanup_task};

const USAGE: &str = "usage: playforge [--config=PATH] [run | sweep | health | validate FILE]";

#[tokio::main]
async fn main() -> ExitCode {
    let json_logs = std::env::var("PLAYFORGE_LOG_JSON").is_ok_and(|v| v == "1");
    let subscriber = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env());
    if json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let mut config_path = None;
    let mut args = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.strip_prefix("--config=") {
            Some(path) => config_path = Some(path.to_string()),
            None => args.push(arg),
        }
    }

    // Validation needs no sandbox, so it runs before the pipeline is built.
    if let [cmd, file] = args.as_slice()
        && cmd == "validate"
    {
        return validate_file(file);
    }

    let config = match &config_path {
        Some(path) => PipelineConfig::load_from(path),
        None => PipelineConfig::load(),
    };
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    let pipeline = match Pipeline::new(config).await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            tracing::error!("Failed to start pipeline: {e}");
            return ExitCode::FAILURE;
        },
    };

    match args.first().map(String::as_str) {
        None | Some("run") => run(pipeline).await,
        Some("sweep") => {
            let report = pipeline.cleanup_service().run_sweep().await;
            print_json(&report);
            if report.errors.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        },
        Some("health") => {
            let health = pipeline.health().await;
            print_json(&health);
            ExitCode::SUCCESS
        },
        Some(other) => {
            eprintln!("unknown command `{other}`\n{USAGE}");
            ExitCode::FAILURE
        },
    }
}

/// Sweep periodically until interrupted.
async fn run(pipeline: Pipeline) -> ExitCode {
    let interval = Duration::from_secs(pipeline.config.cleanup.interval_secs);
    let cancel = CancellationToken::new();
    let cleanup = spawn_cleanup_task(
        Arc::new(pipeline.cleanup_service()),
        interval,
        cancel.clone(),
    );

    tracing::info!(
        root = %pipeline.sandbox.root().display(),
        cleanup_interval_secs = interval.as_secs(),
        "Playforge pipeline running"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
    tracing::info!("Shutting down");
    cancel.cancel();
    pipeline.shutdown();
    if let Err(e) = cleanup.await {
        tracing::warn!("Cleanup task ended abnormally: {e}");
    }
    ExitCode::SUCCESS
}

fn validate_file(file: &str) -> ExitCode {
    let content = match std::fs::read_to_string(file) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("cannot read {file}: {e}");
            return ExitCode::FAILURE;
        },
    };
    let document: serde_json::Value = match serde_json::from_str(&content) {
        Ok(doc) => doc,
        Err(e) => {
            print_json(&json!({ "valid": false, "parse_error": e.to_string() }));
            return ExitCode::FAILURE;
        },
    };

    let report = validator::validate(&document);
    let accepted = validator::validate_and_sanitize(document);
    print_json(&json!({
        "valid": report.is_empty(),
        "accepted": accepted.is_ok(),
        "errors": report,
    }));
    if accepted.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("failed to encode output: {e}"),
    }
}
