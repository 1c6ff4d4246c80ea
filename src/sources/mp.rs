//! Native MessagePack source.
//!
//! Devices speaking the logger's own envelope (§ [`crate::mp`]) need no
//! re-encoding: every decoded message is forwarded as-is. The device
//! announces its own identity in-stream, so the source caches the Name and
//! ChannelMap messages it sees and publishes them as its descriptor for
//! use at file rotation.

use std::fs::File;

use crate::config::{IniSection, LoggerConfig};
use crate::error::{Error, Result};
use crate::framing::FrameError;
use crate::message::{self, DataValue};
use crate::mp::MpReader;
use crate::serial::open_serial;
use crate::signals;

use super::{Descriptor, Source, SourceContext};

pub struct MpSource {
    tag: String,
    port: String,
    baud: u32,
    handle: Option<File>,
    /// Source ID learned from the stream; zero until seen.
    cached_source: u8,
    cached_name: Option<String>,
    cached_map: Option<crate::strarray::StringArray>,
}

impl MpSource {
    pub fn from_section(section: &IniSection, _defaults: &LoggerConfig) -> Result<MpSource> {
        Ok(MpSource {
            tag: section.name.clone(),
            port: section.require("port").map_err(Error::Config)?.to_string(),
            baud: section.get_parsed::<u32>("baud")?.unwrap_or(115200),
            handle: None,
            cached_source: 0,
            cached_name: None,
            cached_map: None,
        })
    }

    fn note_source(&mut self, source: u8) {
        if self.cached_source != 0 && self.cached_source != source {
            log::warn!(
                "[MP:{}] Received source ID 0x{source:02x} does not match cached value 0x{:02x} - multiple devices on a single input are not supported",
                self.tag,
                self.cached_source
            );
        }
        self.cached_source = source;
    }

    fn publish_descriptor(&self, ctx: &SourceContext) {
        if self.cached_source == 0 {
            return;
        }
        if let (Some(name), Some(map)) = (&self.cached_name, &self.cached_map) {
            if let Ok(mut slot) = ctx.descriptor.lock() {
                *slot = Some(Descriptor {
                    source_id: self.cached_source,
                    name: name.clone(),
                    channels: map.clone(),
                });
            }
        }
    }
}

impl Source for MpSource {
    fn kind(&self) -> &'static str {
        "MP"
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn startup(&mut self) -> Result<()> {
        self.handle = Some(open_serial(&self.port, self.baud)?);
        log::info!("[MP:{}] Connected", self.tag);
        Ok(())
    }

    /// Identity is learned from the stream, so nothing is announced until
    /// the device has sent its own Name and ChannelMap.
    fn descriptor(&self) -> Option<Descriptor> {
        None
    }

    fn logging(&mut self, ctx: &SourceContext) -> Result<()> {
        let mut handle = self
            .handle
            .take()
            .ok_or_else(|| Error::source_err("MP logging started without a handle"))?;
        let mut reader = MpReader::new();

        while !signals::shutdown_requested() {
            match reader.read_message(&mut handle) {
                Ok(msg) => {
                    match (msg.channel, &msg.value) {
                        (message::CHAN_NAME, DataValue::Str(s)) => {
                            self.note_source(msg.source);
                            self.cached_name = Some(s.to_string_lossy().into_owned());
                            self.publish_descriptor(ctx);
                        }
                        (message::CHAN_NAME, _) => {
                            log::warn!(
                                "[MP:{}] Unexpected payload type for source name (source 0x{:02x})",
                                self.tag,
                                msg.source
                            );
                        }
                        (message::CHAN_MAP, DataValue::StrArray(sa)) => {
                            self.note_source(msg.source);
                            self.cached_map = Some(sa.clone());
                            self.publish_descriptor(ctx);
                        }
                        _ => {}
                    }
                    ctx.push(msg)?;
                }
                Err(e) if e.is_recoverable() => {
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
    fn descriptor_is_learned_not_configured() {
        let ini = IniConfig::parse_str("[Native]\ntype = mp\nport = /dev/ttyACM0\n").unwrap();
        let cfg = LoggerConfig::default();
        let src = MpSource::from_section(ini.get_section("Native").unwrap(), &cfg).unwrap();
        assert!(src.descriptor().is_none());
        assert_eq!(src.baud, 115200);
    }
}
