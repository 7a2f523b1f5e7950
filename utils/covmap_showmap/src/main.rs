//! Runs a target once with a fresh coverage map and writes out what it covered,
//! in the format `afl-showmap` uses.

use std::{
    ffi::OsString,
    fs::File,
    io::{self, BufWriter},
    path::PathBuf,
    process,
};

use clap::Parser;
use covmap::{
    executors::CoverageExecutor,
    inputs::{ExecutionRequest, InputSource},
    Error,
};
use env_logger::Env;
use log::{error, info, warn};

mod config;
mod report;

use config::{FileConfig, Settings};
use report::{exit_status, write_report, Format};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[command(
    name = "covmap-showmap",
    about,
    long_about = "Runs the target once and writes every covered map offset with its hit count"
)]
pub struct Opt {
    #[arg(short, long, help = "File to write the coverage tuples to")]
    pub output: PathBuf,
    #[arg(
        short,
        long = "timeout",
        env = "COVMAP_TIMEOUT_MS",
        help = "Timeout for the target in milliseconds, 0 to wait forever"
    )]
    pub timeout_ms: Option<u64>,
    #[arg(short, long, help = "Feed this file to the target instead of our stdin")]
    pub input: Option<PathBuf>,
    #[arg(short, long, help = "Only record covered offsets, not their hit counts")]
    pub edges_only: bool,
    #[arg(short, long, help = "Hide the target's output and our banners")]
    pub quiet: bool,
    #[arg(long, help = "Write the full result as JSON instead of tuples")]
    pub json: bool,
    #[arg(long, help = "TOML file with a `timeout_ms` and an `[executor]` table")]
    pub config: Option<PathBuf>,
    #[arg(
        required = true,
        last = true,
        help = "The target to run, followed by its arguments"
    )]
    pub target: Vec<OsString>,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let opts = Opt::parse();

    match run(&opts) {
        Ok(status) => process::exit(status),
        Err(err) => {
            error!("{err}");
            // distinct from the timeout and crash statuses
            process::exit(3);
        }
    }
}

fn run(opts: &Opt) -> Result<i32, Error> {
    let file_config = match &opts.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::layer(file_config, opts.timeout_ms, opts.quiet);

    let mut executor = CoverageExecutor::new(settings.executor)?;

    let stdin = io::stdin();
    let input_file = opts.input.as_deref().map(File::open).transpose()?;
    let input = match &input_file {
        Some(file) => InputSource::from_fd(file),
        None => InputSource::from_fd(&stdin),
    };
    let request = ExecutionRequest::new(&opts.target, input)?
        .with_optional_timeout(settings.timeout);

    if !opts.quiet {
        eprintln!("-- Program output begins --");
    }
    let res = executor.capture(request)?;
    if !opts.quiet {
        eprintln!("-- Program output ends --");
    }
    executor.release();

    if res.timed_out {
        warn!("Target timed out after {:?}", settings.timeout.unwrap_or_default());
    } else if let Some(sig) = res.crashed {
        warn!("Target crashed with signal {sig}");
    }

    let format = if opts.json {
        Format::Json
    } else {
        Format::Tuples {
            edges_only: opts.edges_only,
        }
    };
    let mut out = BufWriter::new(File::create(&opts.output)?);
    let tuples = write_report(&mut out, &res, format)?;

    if tuples == 0 {
        warn!("No instrumentation detected");
    } else {
        info!("Captured {tuples} tuples in {}", opts.output.display());
    }

    Ok(exit_status(&res))
}
