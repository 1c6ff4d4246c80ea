//! Data logging daemon.
//!
//! Reads the configuration file, spawns one thread per configured source
//! plus the internal timer, and writes every decoded message to a rotating
//! set of self-describing data files.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use tidelog::config::{IniConfig, LoggerConfig, SourceKind};
use tidelog::sources::{self, timer::TimerSource, Source};
use tidelog::{logging, signals, writer};

#[derive(Parser)]
#[command(name = "tidelogd", version, about = "Multi-source instrument data logger")]
struct Cli {
    /// Configuration file
    config: PathBuf,

    /// Increase console verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn run(cli: Cli) -> tidelog::Result<i32> {
    let ini = IniConfig::parse_file(&cli.config)?;
    let mut cfg = LoggerConfig::from_ini(&ini)?;
    if cli.quiet {
        cfg.console_verbosity = 0;
    } else if cli.verbose > 0 {
        cfg.console_verbosity = cli.verbose;
    }
    logging::init(cfg.console_verbosity, cfg.file_verbosity);

    if cfg.console_verbosity >= 3 {
        log::trace!("Parsed configuration:\n{}", ini.to_ini_string());
    }

    let mut source_list: Vec<Box<dyn Source>> = Vec::new();
    let mut have_timer = false;
    for section in ini.source_sections() {
        let source = sources::from_section(section, &cfg)?;
        have_timer |= section
            .get("type")
            .and_then(|t| t.parse::<SourceKind>().ok())
            .map(|k| k == SourceKind::Timer)
            .unwrap_or(false);
        source_list.push(source);
    }
    if !have_timer {
        // Every log needs the mark channels, configured or not
        source_list.insert(0, Box::new(TimerSource::internal(&cfg)));
    }

    signals::install_handlers()?;
    writer::run(&cfg, source_list)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    // Default logging until the configuration has been read
    logging::init(if cli.quiet { 0 } else { cli.verbose }, 0);

    match run(cli) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{e}");
            logging::flush();
            ExitCode::FAILURE
        }
    }
}
