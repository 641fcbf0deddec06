use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;

use hako2epub::cli::Cli;
use hako2epub::epub::EpubWriter;
use hako2epub::extract::HakoExtractor;
use hako2epub::sync::{self, RunOutcome, SyncReport, Synchronizer};

const EXIT_REJECTED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    match try_main().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main() -> anyhow::Result<ExitCode> {
    hako2epub::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    let config = cli.global.sync_config().context("build config")?;
    let (mode, chooser) = cli.command.into_mode();

    if let Some(raw) = mode.url()
        && let Err(err) = sync::validate_url(&config, raw)
    {
        eprintln!("{err}");
        return Ok(ExitCode::from(EXIT_REJECTED));
    }

    let synchronizer = Synchronizer::connect(
        config,
        Arc::new(HakoExtractor),
        Arc::new(EpubWriter),
        Arc::new(chooser),
    )
    .await
    .context("connect")?;

    let outcome = synchronizer.run(&mode).await.context("sync")?;
    match outcome {
        RunOutcome::Completed(report) => {
            print_report(&report);
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::NothingToDo(report) => {
            print_report(&report);
            println!("nothing to do");
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::Rejected { reason } => {
            eprintln!("{reason}");
            Ok(ExitCode::from(EXIT_REJECTED))
        }
    }
}

fn print_report(report: &SyncReport) {
    for volume in &report.written {
        let verb = if volume.appended { "appended" } else { "wrote" };
        println!(
            "{verb} {} chapter(s): {}",
            volume.chapters_added,
            volume.path.display()
        );
    }
    for failure in &report.chapter_failures {
        println!("failed chapter {}: {}", failure.label, failure.error);
    }
    for failure in &report.failures {
        println!("failed {}: {}", failure.target, failure.error);
    }
    if report.image_failures > 0 {
        println!("{} image(s) could not be embedded", report.image_failures);
    }
    if !report.written.is_empty() {
        println!(
            "done: {} volume(s), {} chapter(s)",
            report.written.len(),
            report.chapters_added()
        );
    }
}
