//! NMEA-0183 serial source.
//!
//! `II`/`ZDA` sentences are converted to epoch timestamps on channel 4 (and
//! suppressed from the raw channel unless `dumpall` is set); all other
//! sentences are re-serialised and logged as raw bytes.

use std::fs::File;

use crate::config::{IniSection, LoggerConfig};
use crate::error::{Error, Result};
use crate::framing::FrameError;
use crate::message::{self, Message};
use crate::nmea::{zda, NmeaReader};
use crate::serial;
use crate::signals;

use super::{Descriptor, Source, SourceContext};

pub const CHAN_EPOCH: u8 = 0x04;

pub struct NmeaSource {
    tag: String,
    name: String,
    source_num: u8,
    port: String,
    baud: u32,
    dump_all: bool,
    handle: Option<File>,
}

impl NmeaSource {
    pub fn from_section(section: &IniSection, defaults: &LoggerConfig) -> Result<NmeaSource> {
        Ok(NmeaSource {
            tag: section.name.clone(),
            name: super::source_name(section),
            source_num: super::resolve_source_num(section, message::SOURCE_NMEA)?,
            port: section.require("port").map_err(Error::Config)?.to_string(),
            baud: section.get_parsed::<u32>("baud")?.unwrap_or(115200),
            dump_all: section.get_bool("dumpall")?.unwrap_or(defaults.dump_all),
            handle: None,
        })
    }
}

impl Source for NmeaSource {
    fn kind(&self) -> &'static str {
        "NMEA"
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn startup(&mut self) -> Result<()> {
        self.handle = Some(serial::open_serial(&self.port, self.baud)?);
        Ok(())
    }

    fn descriptor(&self) -> Option<Descriptor> {
        Some(Descriptor::new(
            self.source_num,
            &self.name,
            5,
            &[(message::CHAN_RAW, "Raw NMEA"), (CHAN_EPOCH, "Epoch")],
        ))
    }

    fn logging(&mut self, ctx: &SourceContext) -> Result<()> {
        let mut handle = self
            .handle
            .take()
            .ok_or_else(|| Error::source_err("NMEA logging started without a handle"))?;
        let mut reader = NmeaReader::new();

        while !signals::shutdown_requested() {
            match reader.read_message(&mut handle) {
                Ok(msg) => {
                    let mut handled = false;
                    if let Some(epoch) = zda::parse_zda(&msg) {
                        ctx.push(Message::new_timestamp(
                            self.source_num,
                            CHAN_EPOCH,
                            epoch as u32,
                        ))?;
                        handled = true;
                    }
                    if !handled || self.dump_all {
                        ctx.push(Message::new_bytes(
                            self.source_num,
                            message::CHAN_RAW,
                            &msg.to_bytes(),
                        ))?;
                    }
                }
                Err(e) if e.is_recoverable() => {
                    if matches!(e, FrameError::Invalid) {
                        log::debug!("[NMEA:{}] Invalid sentence on stream", self.tag);
                    }
                    std::thread::sleep(super::SERIAL_POLL_SLEEP);
                }
                Err(FrameError::Io(e)) => {
                    self.handle = Some(handle);
                    return Err(Error::Io(e));
                }
                Err(e) => {
                    self.handle = Some(handle);
                    return Err(Error::Frame(e));
                }
            }
        }
        self.handle = Some(handle);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.handle = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IniConfig;

    #[test]
    fn config_and_descriptor() {
        let ini =
            IniConfig::parse_str("[Wind]\ntype = nmea\nport = /dev/ttyS1\nbaud = 4800\n").unwrap();
        let cfg = LoggerConfig::default();
        let src = NmeaSource::from_section(ini.get_section("Wind").unwrap(), &cfg).unwrap();
        assert_eq!(src.baud, 4800);
        assert_eq!(src.source_num, message::SOURCE_NMEA);
        let desc = src.descriptor().unwrap();
        assert_eq!(desc.name, "Wind");
        assert_eq!(desc.channels.get(3).unwrap().as_bytes(), b"Raw NMEA");
        assert_eq!(desc.channels.get(4).unwrap().as_bytes(), b"Epoch");
    }
}
