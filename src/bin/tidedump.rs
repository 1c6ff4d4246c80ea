//! Print the contents of a data file, one line per message.

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use tidelog::framing::FrameError;
use tidelog::mp::MpReader;

#[derive(Parser)]
#[command(name = "tidedump", version, about = "Dump logged messages as text")]
struct Cli {
    /// Data file to read
    file: PathBuf,

    /// Only show messages from this source ID
    #[arg(short, long, value_parser = clap_num_maybe_hex)]
    source: Option<u8>,
}

fn clap_num_maybe_hex(s: &str) -> Result<u8, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut file = match File::open(&cli.file) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Unable to open {}: {e}", cli.file.display());
            return ExitCode::FAILURE;
        }
    };

    let mut reader = MpReader::new();
    let mut count = 0usize;
    loop {
        match reader.read_message(&mut file) {
            Ok(msg) => {
                count += 1;
                if cli.source.map(|s| s == msg.source).unwrap_or(true) {
                    println!("{msg}");
                }
            }
            // Zero bytes read means end of file here
            Err(FrameError::ZeroRead) => break,
            Err(FrameError::NeedMore) | Err(FrameError::Invalid) => continue,
            Err(FrameError::Io(e)) => {
                eprintln!("Read error: {e}");
                return ExitCode::FAILURE;
            }
        }
    }
    eprintln!("{count} messages read");
    ExitCode::SUCCESS
}
