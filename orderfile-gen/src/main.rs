use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use log::LevelFilter;
use orderfile_mobile::{Env, SystemRunner};
use owo_colors::OwoColorize;

mod arch;
mod benchmark;
mod build;
mod config;
mod error;
#[cfg(test)]
mod fake;
mod generator;
mod offsets;
mod orderfile;
mod output;
mod profile;
mod report;
mod verify;

use config::{Cli, Config, Settings};
use error::Error;
use generator::Generator;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let verbosity = cli.total_verbosity();
    init_logging(verbosity);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            output::error(format!("{err:#}"));
            let pipeline_error = err.downcast_ref::<Error>();
            if verbosity > 0 {
                if let Some(captured) = pipeline_error.and_then(Error::captured_output) {
                    output::note("output of the failing command:");
                    eprintln!("{}", captured.trim_end());
                }
            }
            ExitCode::from(pipeline_error.map_or(1, Error::exit_code))
        }
    }
}

/// `RUST_LOG` wins over `--verbosity`.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::from_cli(cli)?;
    let settings = Settings::load(config.settings.as_deref())?;
    let env = if config.needs_device() {
        Some(Env::new(config.adb_path.as_deref()).map_err(Error::from)?)
    } else {
        None
    };
    let runner = SystemRunner::new();

    output::status(
        "Starting",
        format!(
            "{} orderfile for {} ({})",
            config.browser,
            config.arch,
            config.src_dir.display()
        ),
    );
    let mut generator = Generator::new(&config, &settings, &runner, env.as_ref());
    let result = generator.run();
    let mut report = generator.into_report();
    if let Err(err) = &result {
        report.error = Some(err.to_string());
    }

    eprintln!("{}", "Summary".bold());
    eprintln!("{}", report.summary_table());
    println!("{}", report.to_json());
    if let Some(path) = &config.output_json {
        report.write_json(path)?;
    }
    result?;
    Ok(())
}
