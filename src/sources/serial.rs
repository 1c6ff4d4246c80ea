//! Generic serial byte stream source.
//!
//! The serial counterpart of the network source: bytes are windowed by
//! `minbytes`/`maxbytes` and logged raw on channel 3.

use std::fs::File;
use std::io::Read;
use std::time::Duration;

use crate::config::{IniSection, LoggerConfig};
use crate::error::{Error, Result};
use crate::message::{self, Message};
use crate::serial::open_serial;
use crate::signals;

use super::{Descriptor, Source, SourceContext};

pub struct SerialSource {
    tag: String,
    name: String,
    source_num: u8,
    port: String,
    baud: u32,
    min_bytes: usize,
    max_bytes: usize,
    handle: Option<File>,
}

impl SerialSource {
    pub fn from_section(section: &IniSection, _defaults: &LoggerConfig) -> Result<SerialSource> {
        let min_bytes = section.get_parsed::<usize>("minbytes")?.unwrap_or(10);
        let max_bytes = section.get_parsed::<usize>("maxbytes")?.unwrap_or(1024);
        if min_bytes == 0 || max_bytes < min_bytes {
            return Err(Error::Config(crate::config::ConfigError::BadValue {
                section: section.name.clone(),
                key: "minbytes".into(),
                reason: format!("window {min_bytes}..{max_bytes} is not usable"),
            }));
        }
        Ok(SerialSource {
            tag: section.name.clone(),
            name: super::source_name(section),
            source_num: super::resolve_source_num(section, message::SOURCE_EXT)?,
            port: section.require("port").map_err(Error::Config)?.to_string(),
            baud: section.get_parsed::<u32>("baud")?.unwrap_or(115200),
            min_bytes,
            max_bytes,
            handle: None,
        })
    }
}

impl Source for SerialSource {
    fn kind(&self) -> &'static str {
        "Serial"
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn startup(&mut self) -> Result<()> {
        self.handle = Some(open_serial(&self.port, self.baud)?);
        log::info!("[Serial:{}] Connected", self.tag);
        Ok(())
    }

    fn descriptor(&self) -> Option<Descriptor> {
        Some(Descriptor::new(
            self.source_num,
            &self.name,
            4,
            &[(message::CHAN_RAW, "Raw Data")],
        ))
    }

    fn logging(&mut self, ctx: &SourceContext) -> Result<()> {
        let mut handle = self
            .handle
            .take()
            .ok_or_else(|| Error::source_err("serial logging started without a handle"))?;
        let mut buf = vec![0u8; self.max_bytes];
        let mut hw = 0usize;

        while !signals::shutdown_requested() {
            if hw < self.max_bytes {
                match handle.read(&mut buf[hw..]) {
                    Ok(n) => hw += n,
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        self.handle = Some(handle);
                        return Err(Error::Io(e));
                    }
                }
            }

            if hw < self.min_bytes {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }

            ctx.push(Message::new_bytes(self.source_num, message::CHAN_RAW, &buf[..hw]))?;
            hw = 0;
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
    fn config_parsing() {
        let ini = IniConfig::parse_str(
            "[Aux]\ntype = serial\nport = /dev/ttyUSB2\nbaud = 19200\nminbytes = 1\nmaxbytes = 32\n",
        )
        .unwrap();
        let cfg = LoggerConfig::default();
        let src = SerialSource::from_section(ini.get_section("Aux").unwrap(), &cfg).unwrap();
        assert_eq!(src.baud, 19200);
        assert_eq!((src.min_bytes, src.max_bytes), (1, 32));
        assert_eq!(src.source_num, message::SOURCE_EXT);
    }
}
