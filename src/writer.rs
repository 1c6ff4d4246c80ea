//! The writer and main orchestration loop.
//!
//! Startup opens a dated, serial-numbered output file (plus a `.log`
//! sibling for diagnostics), spawns the timer and every configured source,
//! then drains the shared queue into the output file until shutdown is
//! requested. Rotation closes the current files, opens the next serial
//! number and replays every source's Name and ChannelMap so each file is
//! self describing. While paused the queue is left to fill; inputs keep
//! running.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::Duration;

use crate::config::LoggerConfig;
use crate::error::{Error, Result};
use crate::logging;
use crate::message::DataValue;
use crate::mp;
use crate::queue::MessageQueue;
use crate::signals;
use crate::sources::{self, Source, SourceHandle};

/// Data file extension.
pub const DATA_EXT: &str = "dat";
/// Diagnostics file extension, sharing the data file's stem.
pub const LOG_EXT: &str = "log";

/// Writer sleep while the queue is empty.
const IDLE_SLEEP: Duration = Duration::from_millis(5);

struct OutputFiles {
    data: BufWriter<File>,
}

fn open_outputs(cfg: &LoggerConfig) -> Result<OutputFiles> {
    let (data, stem) = logging::open_stamped_file(&cfg.prefix, DATA_EXT).map_err(Error::Io)?;
    let log_path = stem.with_extension(LOG_EXT);
    match File::create(&log_path) {
        Ok(log_file) => logging::set_log_file(Some(log_file)),
        Err(e) => {
            log::warn!("Unable to open log file {}: {e}", log_path.display());
            logging::set_log_file(None);
        }
    }
    log::info!("Logging to {}.{DATA_EXT}", stem.display());
    Ok(OutputFiles { data: BufWriter::new(data) })
}

fn write_message(out: &mut OutputFiles, msg: &crate::message::Message) -> Result<()> {
    mp::encode(msg, &mut out.data).map_err(Error::Envelope)?;
    Ok(())
}

/// Re-emit every known source descriptor directly into the output file.
///
/// Called at the head of each rotated file so that it carries the current
/// source names and channel maps before any data records.
fn write_descriptors(out: &mut OutputFiles, handles: &[SourceHandle]) -> Result<()> {
    for handle in handles {
        let desc = match handle.descriptor.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        if let Some(desc) = desc {
            let name = crate::message::Message::new_string(
                desc.source_id,
                crate::message::CHAN_NAME,
                &desc.name,
            );
            let map = crate::message::Message::new_string_array(
                desc.source_id,
                crate::message::CHAN_MAP,
                &desc.channels,
            );
            write_message(out, &name)?;
            write_message(out, &map)?;
        }
    }
    Ok(())
}

/// Drain one message from the queue into the file. Returns false when the
/// queue was empty.
fn drain_one(out: &mut OutputFiles, queue: &MessageQueue) -> Result<bool> {
    match queue.pop() {
        None => Ok(false),
        Some(msg) => {
            // In-band decoder status must never reach the output file
            if let DataValue::ErrorStatus(code) = msg.value {
                log::warn!(
                    "Discarding error-status message (0x{code:02x}) from source 0x{:02x}",
                    msg.source
                );
                return Ok(true);
            }
            write_message(out, &msg)?;
            Ok(true)
        }
    }
}

/// Run the logger: spawn `source_list` plus the timer, drain until a
/// shutdown is requested, then join everything and flush. Returns the
/// process exit code.
pub fn run(cfg: &LoggerConfig, source_list: Vec<Box<dyn Source>>) -> Result<i32> {
    let queue = Arc::new(MessageQueue::new());
    if !queue.init() {
        return Err(Error::source_err("queue initialisation failed"));
    }

    let mut out = open_outputs(cfg)?;

    let mut handles: Vec<SourceHandle> = Vec::with_capacity(source_list.len());
    for source in source_list {
        handles.push(sources::spawn(source, Arc::clone(&queue))?);
    }

    logging::set_phase(logging::Phase::Running);
    log::info!("Startup complete, {} sources running", handles.len());

    let mut exit_code = 0;
    let mut reported_dead: Vec<bool> = vec![false; handles.len()];

    while !signals::shutdown_requested() {
        // Startup failures (code 1) are fatal for the daemon; a source that
        // dies in its logging loop (code 2) is reported and the remaining
        // sources are kept alive for the operator to decide.
        for (ix, handle) in handles.iter().enumerate() {
            if reported_dead[ix] || !handle.is_finished() {
                continue;
            }
            match handle.return_code() {
                0 => continue,
                1 => {
                    log::error!(
                        "[{}:{}] Source failed during startup, shutting down",
                        handle.kind,
                        handle.tag
                    );
                    signals::request_shutdown();
                    exit_code = 1;
                }
                code => {
                    log::error!(
                        "[{}:{}] Source thread exited with code {code}",
                        handle.kind,
                        handle.tag
                    );
                }
            }
            reported_dead[ix] = true;
        }

        if signals::rotate_requested() && !signals::paused() {
            log::info!("Rotating output files");
            out.data.flush().map_err(Error::Io)?;
            logging::set_log_file(None);
            out = open_outputs(cfg)?;
            write_descriptors(&mut out, &handles)?;
            signals::clear_rotate();
        }

        if signals::paused() {
            std::thread::sleep(IDLE_SLEEP);
            continue;
        }

        if !drain_one(&mut out, &queue)? {
            std::thread::sleep(IDLE_SLEEP);
        }
    }

    logging::set_phase(logging::Phase::Shutdown);
    log::info!("Shutdown requested, joining source threads");
    for handle in handles {
        let tag = handle.tag.clone();
        let kind = handle.kind;
        let code = handle.join();
        if code != 0 {
            log::warn!("[{kind}:{tag}] Exited with code {code}");
            exit_code = 1;
        }
    }

    // Producers are gone; drain anything left
    while drain_one(&mut out, &queue)? {}
    out.data.flush().map_err(Error::Io)?;
    logging::flush();
    queue.destroy();

    log::info!("Shutdown complete");
    Ok(exit_code)
}
