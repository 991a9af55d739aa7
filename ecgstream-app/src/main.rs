//! `ecgstream`: streams a recorded ECG waveform to the analysis service.
//!
//! Results, status changes and a final summary are printed to stdout as JSON
//! lines; logs go to stderr.

mod cli;
mod output;
mod settings;
mod waveform;

use std::sync::Arc;

use anyhow::Context;
use ecgstream_core::{ChunkResult, StatusEvent, StreamClient};
use output::{render, OutputLine, ResultLine, Summary};
use settings::{default_settings_path, load_settings, save_settings};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ecgstream=info,ecgstream_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = match cli::parse_args(std::env::args().skip(1)) {
        Ok(cli::Invocation::Run(args)) => args,
        Ok(cli::Invocation::Help) => {
            println!("{}", cli::USAGE);
            return Ok(());
        }
        Err(e) => {
            eprintln!("{e}\n\n{}", cli::USAGE);
            std::process::exit(2);
        }
    };

    // ── Settings ──────────────────────────────────────────────────────────
    let settings_path = args.settings.clone().unwrap_or_else(default_settings_path);
    let mut app_settings = load_settings(&settings_path);
    app_settings.apply_env_overrides();
    args.apply_to(&mut app_settings);
    info!(
        settings_path = ?settings_path,
        endpoint = %app_settings.endpoint,
        chunk_duration_secs = app_settings.chunk_duration_secs,
        pending_timeout_ms = ?app_settings.pending_timeout_ms,
        "settings loaded"
    );
    if args.save_settings {
        save_settings(&settings_path, &app_settings)
            .with_context(|| format!("failed to save settings to {}", settings_path.display()))?;
        info!(settings_path = ?settings_path, "settings saved");
    }

    // ── Waveform ──────────────────────────────────────────────────────────
    let waveform = waveform::load_waveform(&args.waveform)?;
    let sampling_rate = args
        .sampling_rate
        .or(waveform.sampling_rate)
        .unwrap_or(app_settings.default_sampling_rate);
    info!(
        path = ?args.waveform,
        samples = waveform.samples.len(),
        sampling_rate,
        "waveform loaded"
    );

    // ── Session ───────────────────────────────────────────────────────────
    let client = StreamClient::spawn_websocket(app_settings.stream_config())?;
    let printer = tokio::spawn(print_events(
        client.subscribe_results(),
        client.subscribe_status(),
    ));

    client.load(waveform.samples, sampling_rate).await?;
    client.connect().await?;
    timeout(args.connect_timeout, client.wait_for_connection())
        .await
        .context("timed out connecting to the analysis service")?
        .context("could not connect to the analysis service")?;
    client.start().await?;

    tokio::select! {
        status = client.wait_until_drained() => {
            let status = status?;
            info!(cursor = status.cursor, results = status.results, "stream drained");
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, stopping stream");
            client.stop().await?;
        }
    }

    let results = client.results();
    let summary = Summary {
        status: client.status(),
        diagnostics: client.diagnostics_snapshot(),
        abnormal_chunks: results.snapshot().iter().filter(|r| r.is_abnormal()).count(),
    };
    client.shutdown().await?;
    drop(client);
    // All senders are gone once the client is dropped; the printer drains and exits.
    printer.await.context("output task panicked")?;
    println!("{}", render(&OutputLine::Summary(summary)));
    Ok(())
}

async fn print_events(
    mut results: broadcast::Receiver<Arc<ChunkResult>>,
    mut status: broadcast::Receiver<StatusEvent>,
) {
    let mut results_open = true;
    let mut status_open = true;
    while results_open || status_open {
        tokio::select! {
            next = results.recv(), if results_open => match next {
                Ok(result) => {
                    println!("{}", render(&OutputLine::Result(ResultLine::new(&result))));
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "output fell behind results"),
                Err(RecvError::Closed) => results_open = false,
            },
            next = status.recv(), if status_open => match next {
                Ok(event) => println!("{}", render(&OutputLine::Status(&event))),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => status_open = false,
            },
        }
    }
}
