use std::fs::File;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use colored::*;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hopla::{Config, HoplaError, JobFile, Report, Scheduler};

fn init_logging(cli: &Config) -> Result<(), HoplaError> {
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file_layer = match &cli.logfile {
        Some(path) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(File::create(path)?)),
        ),
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

async fn run(cli: &Config) -> Result<Report, HoplaError> {
    let commands = JobFile::load(&cli.job_file)?.into_commands()?;
    let scheduler = Scheduler::from_config(cli)?;
    scheduler.run(commands).await
}

fn print_summary(report: &Report) {
    for (name, code) in &report.exitcodes {
        let label = if *code == 0 { "done".green() } else { "failed".red() };
        let exitcode = report.status[name].exitcode();
        eprintln!("[Hopla] {} {} ({})", name.bold(), label, exitcode);
    }
    let failures = report.failures();
    let line = format!(
        "[Hopla] {} jobs, {} failed",
        report.exitcodes.len(),
        failures
    );
    if failures == 0 {
        eprintln!("{}", line.green());
    } else {
        eprintln!("{}", line.red());
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Config::parse();
    if let Err(error) = init_logging(&cli) {
        eprintln!("{} {}", "[Hopla]".red(), error);
        return ExitCode::from(2);
    }

    eprintln!("[Hopla] Running in {:?} mode!", cli.mode);
    match run(&cli).await {
        Ok(report) => {
            print_summary(&report);
            if report.failures() == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(error) => {
            eprintln!("{} {}", "[Hopla]".red(), error);
            ExitCode::from(2)
        }
    }
}
