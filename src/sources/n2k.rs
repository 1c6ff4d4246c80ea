//! NMEA 2000 source via an Actisense serial gateway.
//!
//! Every message is re-serialised and logged raw; position rapid updates
//! additionally populate dedicated latitude and longitude channels.

use std::fs::File;

use crate::config::{IniSection, LoggerConfig};
use crate::error::{Error, Result};
use crate::framing::FrameError;
use crate::message::{self, Message};
use crate::n2k::{pgn, N2kReader};
use crate::serial::open_serial;
use crate::signals;

use super::{Descriptor, Source, SourceContext};

pub const CHAN_LAT: u8 = 0x04;
pub const CHAN_LON: u8 = 0x05;

pub struct N2kSource {
    tag: String,
    name: String,
    source_num: u8,
    port: String,
    baud: u32,
    handle: Option<File>,
}

impl N2kSource {
    pub fn from_section(section: &IniSection, _defaults: &LoggerConfig) -> Result<N2kSource> {
        Ok(N2kSource {
            tag: section.name.clone(),
            name: super::source_name(section),
            source_num: super::resolve_source_num(section, message::SOURCE_N2K)?,
            port: section.require("port").map_err(Error::Config)?.to_string(),
            baud: section.get_parsed::<u32>("baud")?.unwrap_or(115200),
            handle: None,
        })
    }
}

impl Source for N2kSource {
    fn kind(&self) -> &'static str {
        "N2K"
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn startup(&mut self) -> Result<()> {
        self.handle = Some(open_serial(&self.port, self.baud)?);
        log::info!("[N2K:{}] Connected", self.tag);
        Ok(())
    }

    fn descriptor(&self) -> Option<Descriptor> {
        Some(Descriptor::new(
            self.source_num,
            &self.name,
            6,
            &[
                (message::CHAN_RAW, "Raw N2K"),
                (CHAN_LAT, "Latitude"),
                (CHAN_LON, "Longitude"),
            ],
        ))
    }

    fn logging(&mut self, ctx: &SourceContext) -> Result<()> {
        let mut handle = self
            .handle
            .take()
            .ok_or_else(|| Error::source_err("N2K logging started without a handle"))?;
        let mut reader = N2kReader::new();

        while !signals::shutdown_requested() {
            match reader.read_message(&mut handle) {
                Ok(msg) => {
                    if let Some((lat, lon)) = pgn::position(&msg) {
                        ctx.push(Message::new_float(self.source_num, CHAN_LAT, lat as f32))?;
                        ctx.push(Message::new_float(self.source_num, CHAN_LON, lon as f32))?;
                    }
                    ctx.push(Message::new_bytes(
                        self.source_num,
                        message::CHAN_RAW,
                        &msg.to_bytes(),
                    ))?;
                }
                Err(e) if e.is_recoverable() => {
                    if matches!(e, FrameError::Invalid) {
                        log::debug!("[N2K:{}] Dropped invalid frame", self.tag);
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
        let ini = IniConfig::parse_str("[Bus]\ntype = n2k\nport = /dev/ttyACM1\n").unwrap();
        let cfg = LoggerConfig::default();
        let src = N2kSource::from_section(ini.get_section("Bus").unwrap(), &cfg).unwrap();
        assert_eq!(src.source_num, message::SOURCE_N2K);
        let desc = src.descriptor().unwrap();
        assert_eq!(desc.channels.entries(), 6);
        assert_eq!(desc.channels.get(CHAN_LAT as usize).unwrap().as_bytes(), b"Latitude");
        assert_eq!(desc.channels.get(CHAN_LON as usize).unwrap().as_bytes(), b"Longitude");
    }
}
