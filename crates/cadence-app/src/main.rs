//! Cadence application binary - composition root.
//!
//! 1. Load and validate configuration from TOML
//! 2. Build one sender per consumer class
//! 3. Start the dispatch engine
//! 4. Serve the JSON-lines host protocol on stdin/stdout until EOF or ctrl-c

mod cli;
mod protocol;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use cadence_core::config::{CadenceConfig, SenderKind};
use cadence_core::logging;
use cadence_dispatch::{
    ChannelSender, DispatchInstruction, Engine, EngineBuilder, ExecutionStatus, LogSender,
};

use cli::CliArgs;
use protocol::Output;

/// Build the engine with a sender for every configured class.
fn build_engine(
    config: CadenceConfig,
    output: &mpsc::UnboundedSender<Output>,
) -> Result<Engine, cadence_dispatch::EngineError> {
    let mut builder = EngineBuilder::new(config.clone());
    let mut instruction_tx: Option<mpsc::UnboundedSender<DispatchInstruction>> = None;

    for (name, class) in &config.classes {
        match class.sender {
            SenderKind::Log => {
                builder = builder.sender(name.as_str(), Arc::new(LogSender::new()));
            }
            SenderKind::Stdout => {
                let tx = instruction_tx
                    .get_or_insert_with(|| spawn_instruction_forwarder(output.clone()))
                    .clone();
                builder = builder.sender(name.as_str(), Arc::new(ChannelSender::new(name.as_str(), tx)));
            }
        }
        tracing::debug!(class = %name, sender = ?class.sender, "Sender configured");
    }

    builder.start()
}

fn spawn_instruction_forwarder(
    output: mpsc::UnboundedSender<Output>,
) -> mpsc::UnboundedSender<DispatchInstruction> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(instruction) = rx.recv().await {
            if output.send(Output::Instruction(instruction)).is_err() {
                break;
            }
        }
    });
    tx
}

/// Single owner of stdout so lines never interleave.
async fn stdout_writer(mut rx: mpsc::UnboundedReceiver<Output>) {
    let mut stdout = tokio::io::stdout();
    while let Some(output) = rx.recv().await {
        let line = match output.to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize output line");
                continue;
            }
        };
        if let Err(e) = write_line(&mut stdout, &line).await {
            tracing::error!(error = %e, "stdout closed");
            break;
        }
    }
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

/// Read requests until stdin closes.
///
/// Work admitted before EOF still runs; see [`wait_idle`].
async fn serve_stdin(engine: Engine, output: mpsc::UnboundedSender<Output>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("stdin closed");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to read stdin");
                return;
            }
        };

        let response = match protocol::parse_line(&line) {
            None => continue,
            Some(Ok(request)) => protocol::handle(&engine, request),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Malformed request line");
                protocol::Response::malformed(&e)
            }
        };
        if output.send(Output::Response(response)).is_err() {
            return;
        }
    }
}

/// Wait until no class has queued or in-flight work and no execution is running.
async fn wait_idle(engine: &Engine) {
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    loop {
        tick.tick().await;
        let queues_idle = engine
            .classes()
            .iter()
            .all(|class| engine.is_idle(class).unwrap_or(true));
        if queues_idle && engine.executions(Some(ExecutionStatus::Running)).is_empty() {
            return;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    let config_file = args.resolve_config_path();
    let loaded = if config_file.exists() {
        Some(CadenceConfig::load(&config_file))
    } else {
        None
    };

    let config_level = match &loaded {
        Some(Ok(config)) => config.general.log_level.clone(),
        _ => CadenceConfig::default().general.log_level,
    };
    logging::init(&args.resolve_log_level(&config_level));

    tracing::info!("Starting Cadence v{}", env!("CARGO_PKG_VERSION"));

    let config = match loaded {
        Some(Ok(config)) => {
            tracing::info!(path = %config_file.display(), "Configuration loaded");
            config
        }
        Some(Err(e)) if args.check => {
            tracing::error!(path = %config_file.display(), error = %e, "Configuration is invalid");
            return Err(e.into());
        }
        Some(Err(e)) => {
            tracing::warn!(path = %config_file.display(), error = %e, "Failed to load config, using defaults");
            CadenceConfig::default()
        }
        None => {
            tracing::info!(path = %config_file.display(), "No config file, using defaults");
            CadenceConfig::default()
        }
    };

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Configuration is invalid");
        return Err(e.into());
    }
    if args.check {
        tracing::info!(
            classes = config.classes.len(),
            patterns = config.patterns.len(),
            "Configuration OK"
        );
        return Ok(());
    }

    // === Engine ===

    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(stdout_writer(output_rx));

    let engine = build_engine(config, &output_tx)?;

    let mut events = engine.subscribe();
    let event_output = output_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if event_output.send(Output::Event(event)).is_err() {
                break;
            }
        }
    });

    // === Host protocol ===

    let served = async {
        serve_stdin(engine.clone(), output_tx.clone()).await;
        wait_idle(&engine).await;
    };
    tokio::select! {
        _ = served => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
            } else {
                tracing::info!("Interrupted");
            }
        }
    }

    engine.shutdown().await;
    drop(engine);
    drop(output_tx);
    // Flush what is already buffered without waiting on straggling forwarders.
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;

    Ok(())
}
