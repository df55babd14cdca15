//! tq - inspect and exercise a persistent telemetry event queue.
//!
//! Commands operate on one user's persisted events under a data directory:
//! - `status` lists the persisted files
//! - `record` persists one event the way an offline queue would
//! - `drain` reads every persisted event back and clears the files
//! - `check` validates the pipeline configuration

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tq_common::{Error, UserId};
use tq_core::commands::Pipeline;
use tq_core::exit_codes::ExitCode;
use tq_core::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use tq_core::output::{
    render_config, render_error, render_events, render_record, render_status, OutputFormat,
};

/// Telemetry queue tool
#[derive(Parser)]
#[command(name = "tq")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Root directory of persisted event files
    #[arg(long, global = true, env = "TQ_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Pipeline configuration file (TOML)
    #[arg(long, global = true, env = "TQ_CONFIG")]
    config: Option<PathBuf>,

    /// User whose queue to operate on
    #[arg(long, global = true, default_value = "0")]
    user: UserId,

    /// Log level; overrides TQ_LOG and RUST_LOG
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,

    /// Log format on stderr; overrides TQ_LOG_FORMAT
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    /// Output format
    #[arg(long, short = 'f', global = true, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the persisted files listed in the user's directory file
    Status,
    /// Validate one event and persist it
    Record(RecordArgs),
    /// Print every persisted event and clear the files it came from
    Drain,
    /// Validate and print the pipeline configuration
    Check,
}

#[derive(Args, Debug)]
struct RecordArgs {
    /// Short event name ([A-Za-z][A-Za-z0-9_]*)
    name: String,

    /// Dimensions as a JSON object
    #[arg(long, default_value = "")]
    dimensions: String,

    /// Measurements as a JSON object
    #[arg(long, default_value = "")]
    measurements: String,
}

fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env(cli.global.log_level, cli.global.log_format);
    init_logging(&log_config);

    let exit_code = match run(&cli) {
        Ok(()) => ExitCode::Clean,
        Err(err) => {
            let exit_code = ExitCode::from(&err);
            tracing::debug!(error = %err, code = err.code(), exit = %exit_code, "command failed");
            eprintln!("{}", render_error(&err, exit_code, cli.global.format));
            exit_code
        }
    };

    std::process::exit(exit_code.as_i32());
}

fn run(cli: &Cli) -> Result<(), Error> {
    let global = &cli.global;
    let pipeline = Pipeline::open(global.config.as_deref(), global.data_dir.clone(), global.user)?;

    let rendered = match &cli.command {
        Commands::Status => render_status(&pipeline.status()?, global.format)?,
        Commands::Record(args) => {
            let report = pipeline.record(&args.name, &args.dimensions, &args.measurements)?;
            render_record(&report, global.format)?
        }
        Commands::Drain => render_events(&pipeline.drain()?, global.format)?,
        Commands::Check => render_config(pipeline.config(), global.format)?,
    };

    print!("{}", rendered);
    if !rendered.is_empty() && !rendered.ends_with('\n') {
        println!();
    }
    Ok(())
}
