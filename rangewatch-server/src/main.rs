use std::time::{Duration, Instant};

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use rangewatch_server::scheduler::RunSummary;
use rangewatch_server::{Cli, Session};
use tokio_graceful_shutdown::{SubsystemHandle, Toplevel};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .parse_default_env()
        .init();

    log::info!("rangewatch-server {}", rangewatch_server::VERSION);

    if args.once {
        let started = Instant::now();
        let session = Session::new_base(args).into_diagnostic()?;
        session.ingest_observation_file().into_diagnostic()?;
        let reports = session.run_once().await;
        let summary = RunSummary::new(&reports, started.elapsed());
        log::info!(
            "Analyzed {} subject(s): {} event(s), {} failure(s)",
            summary.subjects,
            summary.events,
            summary.failures.len()
        );
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).into_diagnostic()?
        );
        return Ok(());
    }

    Toplevel::new(|s: SubsystemHandle| async move {
        match Session::new(&s, args) {
            Ok(_session) => s.on_shutdown_requested().await,
            Err(e) => {
                log::error!("Cannot start: {}", e);
                s.request_shutdown();
            }
        }
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await
    .into_diagnostic()
}
