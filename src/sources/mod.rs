//! Acquisition sources.
//!
//! Every input device is a [`Source`]: a state machine with a
//! startup/channels/logging/shutdown lifecycle, run on its own OS thread by
//! [`spawn`]. After a successful startup the source's descriptor (name and
//! channel map) is published both into the queue and into a shared slot so
//! the writer can re-emit it at file rotation.
//!
//! A source's logging loop runs until the global shutdown flag is set,
//! suspending only for bounded reads and short sleeps. Irrecoverable errors
//! set the per-thread return code; the main loop decides what to do about a
//! dead source.

pub mod dw;
pub mod gps;
pub mod i2c;
pub mod lpms;
pub mod mp;
pub mod mqtt;
pub mod n2k;
pub mod net;
pub mod nmea;
pub mod serial;
pub mod timer;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::{ConfigError, IniSection, LoggerConfig, SourceKind};
use crate::error::{Error, Result};
use crate::message::{self, Message};
use crate::queue::MessageQueue;
use crate::signals;
use crate::strarray::StringArray;

/// Sleep between polling iterations when a decoder reports no data.
pub const SERIAL_POLL_SLEEP: Duration = Duration::from_millis(1);

/// A source's self description: emitted at the head of every output file.
#[derive(Clone, Debug, PartialEq)]
pub struct Descriptor {
    pub source_id: u8,
    pub name: String,
    pub channels: StringArray,
}

impl Descriptor {
    /// Build a descriptor whose channel map covers `entries` slots and
    /// already carries the reserved Name/Channels/Timestamp entries plus
    /// the given extras.
    pub fn new(source_id: u8, name: &str, entries: usize, extra: &[(u8, &str)]) -> Descriptor {
        let mut channels = StringArray::new(entries);
        channels.create_entry(message::CHAN_NAME as usize, "Name");
        channels.create_entry(message::CHAN_MAP as usize, "Channels");
        channels.create_entry(message::CHAN_TSTAMP as usize, "Timestamp");
        for (ix, label) in extra {
            channels.create_entry(*ix as usize, label);
        }
        Descriptor { source_id, name: name.to_string(), channels }
    }
}

/// Shared state handed to a source's logging loop.
pub struct SourceContext {
    pub queue: Arc<MessageQueue>,
    pub descriptor: Arc<Mutex<Option<Descriptor>>>,
    pub tag: String,
}

impl SourceContext {
    /// Push a message, mapping queue rejection to a fatal error.
    pub fn push(&self, msg: Message) -> Result<()> {
        if self.queue.push(msg) {
            Ok(())
        } else {
            Err(Error::QueuePush)
        }
    }
}

/// The per-source lifecycle contract.
pub trait Source: Send {
    /// Family label used in diagnostics, e.g. `GPS`.
    fn kind(&self) -> &'static str;

    /// Display tag, usually the configuration section name.
    fn tag(&self) -> &str;

    /// Open handles, allocate buffers, validate configuration. An error is
    /// fatal for the whole daemon.
    fn startup(&mut self) -> Result<()>;

    /// The source's name and channel map, once known. Sources that learn
    /// their identity from the data stream return `None` until they do.
    fn descriptor(&self) -> Option<Descriptor>;

    /// Read and enqueue messages until shutdown is requested.
    fn logging(&mut self, ctx: &SourceContext) -> Result<()>;

    /// Close handles and release per-source resources.
    fn shutdown(&mut self);
}

/// Enqueue a descriptor's Name and ChannelMap messages.
pub fn push_descriptors(queue: &MessageQueue, desc: &Descriptor) -> Result<()> {
    let name = Message::new_string(desc.source_id, message::CHAN_NAME, &desc.name);
    if !queue.push(name) {
        return Err(Error::QueuePush);
    }
    let map = Message::new_string_array(desc.source_id, message::CHAN_MAP, &desc.channels);
    if !queue.push(map) {
        return Err(Error::QueuePush);
    }
    Ok(())
}

/// A running source thread.
pub struct SourceHandle {
    pub tag: String,
    pub kind: &'static str,
    pub descriptor: Arc<Mutex<Option<Descriptor>>>,
    return_code: Arc<AtomicI32>,
    thread: thread::JoinHandle<()>,
}

impl SourceHandle {
    pub fn return_code(&self) -> i32 {
        self.return_code.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn join(self) -> i32 {
        let _ = self.thread.join();
        self.return_code.load(Ordering::Acquire)
    }
}

/// Spawn a source's lifecycle thread: startup, descriptor announcement,
/// logging, shutdown.
pub fn spawn(mut source: Box<dyn Source>, queue: Arc<MessageQueue>) -> Result<SourceHandle> {
    let tag = source.tag().to_string();
    let kind = source.kind();
    let descriptor = Arc::new(Mutex::new(None));
    let return_code = Arc::new(AtomicI32::new(0));

    let ctx = SourceContext {
        queue,
        descriptor: Arc::clone(&descriptor),
        tag: tag.clone(),
    };
    let rc = Arc::clone(&return_code);

    let thread = thread::Builder::new()
        .name(format!("{kind}:{tag}"))
        .spawn(move || {
            signals::block_handled();

            if let Err(e) = source.startup() {
                log::error!("[{}:{}] Startup failed: {e}", source.kind(), ctx.tag);
                rc.store(1, Ordering::Release);
                source.shutdown();
                return;
            }
            log::info!("[{}:{}] Startup complete", source.kind(), ctx.tag);

            if let Some(desc) = source.descriptor() {
                if let Ok(mut slot) = ctx.descriptor.lock() {
                    *slot = Some(desc.clone());
                }
                if let Err(e) = push_descriptors(&ctx.queue, &desc) {
                    log::error!(
                        "[{}:{}] Error pushing channel descriptors: {e}",
                        source.kind(),
                        ctx.tag
                    );
                    rc.store(1, Ordering::Release);
                    source.shutdown();
                    return;
                }
            }

            log::info!("[{}:{}] Logging thread started", source.kind(), ctx.tag);
            if let Err(e) = source.logging(&ctx) {
                log::error!("[{}:{}] Logging thread failed: {e}", source.kind(), ctx.tag);
                rc.store(2, Ordering::Release);
            } else {
                log::info!("[{}:{}] Logging thread exiting", source.kind(), ctx.tag);
            }
            source.shutdown();
        })
        .map_err(Error::Io)?;

    Ok(SourceHandle { tag, kind, descriptor, return_code, thread })
}

/// Resolve the `sourcenum` key against a family base ID: values below ten
/// are offsets into the family range, larger values are used verbatim.
pub fn resolve_source_num(section: &IniSection, base: u8) -> Result<u8> {
    let num = match section.get_parsed::<i64>("sourcenum").map_err(Error::Config)? {
        None => base,
        Some(n) if n < 0 || n > message::ID_MAX as i64 => {
            return Err(Error::Config(ConfigError::BadValue {
                section: section.name.clone(),
                key: "sourcenum".into(),
                reason: format!("{n} outside the valid ID range"),
            }));
        }
        Some(n) if n < 10 => base + n as u8,
        Some(n) => {
            let n = n as u8;
            if n <= base || n > base + 0x0F {
                log::warn!(
                    "[{}] Unexpected source ID 0x{n:02x} for this source family - this may cause analysis problems",
                    section.name
                );
            }
            n
        }
    };
    if num > message::ID_MAX {
        return Err(Error::Config(ConfigError::BadValue {
            section: section.name.clone(),
            key: "sourcenum".into(),
            reason: "resolved ID exceeds 0x7F".into(),
        }));
    }
    if !message::source_in_convention(num) {
        log::warn!("[{}] Source ID 0x{num:02x} is outside the conventional ranges", section.name);
    }
    Ok(num)
}

/// The source's display name: the `name` key, falling back to the section
/// name.
pub fn source_name(section: &IniSection) -> String {
    section
        .get("name")
        .map(|s| s.to_string())
        .unwrap_or_else(|| section.name.clone())
}

/// Construct a source from its configuration section.
pub fn from_section(section: &IniSection, defaults: &LoggerConfig) -> Result<Box<dyn Source>> {
    let kind_raw = section.require("type").map_err(Error::Config)?;
    let kind: SourceKind = kind_raw.parse().map_err(|_| {
        Error::Config(ConfigError::UnknownType {
            section: section.name.clone(),
            value: kind_raw.to_string(),
        })
    })?;
    match kind {
        SourceKind::Gps => Ok(Box::new(gps::GpsSource::from_section(section, defaults)?)),
        SourceKind::Nmea => Ok(Box::new(nmea::NmeaSource::from_section(section, defaults)?)),
        SourceKind::Dw => Ok(Box::new(dw::DwSource::from_section(section, defaults)?)),
        SourceKind::N2k => Ok(Box::new(n2k::N2kSource::from_section(section, defaults)?)),
        SourceKind::Lpms => Ok(Box::new(lpms::LpmsSource::from_section(section, defaults)?)),
        SourceKind::I2c => Ok(Box::new(i2c::I2cSource::from_section(section, defaults)?)),
        SourceKind::Mp => Ok(Box::new(mp::MpSource::from_section(section, defaults)?)),
        SourceKind::Net => Ok(Box::new(net::NetSource::from_section(section, defaults)?)),
        SourceKind::Serial => Ok(Box::new(serial::SerialSource::from_section(section, defaults)?)),
        SourceKind::Timer => Ok(Box::new(timer::TimerSource::from_section(section, defaults)?)),
        SourceKind::Mqtt => Ok(Box::new(mqtt::MqttSource::from_section(section, defaults)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IniConfig;

    fn section(body: &str) -> IniSection {
        let ini = IniConfig::parse_str(&format!("[Test]\n{body}")).unwrap();
        ini.get_section("Test").unwrap().clone()
    }

    #[test]
    fn source_num_resolution() {
        let s = section("");
        assert_eq!(resolve_source_num(&s, 0x10).unwrap(), 0x10);
        let s = section("sourcenum = 3");
        assert_eq!(resolve_source_num(&s, 0x10).unwrap(), 0x13);
        let s = section("sourcenum = 97");
        assert_eq!(resolve_source_num(&s, 0x60).unwrap(), 97);
        let s = section("sourcenum = 200");
        assert!(resolve_source_num(&s, 0x10).is_err());
        let s = section("sourcenum = -1");
        assert!(resolve_source_num(&s, 0x10).is_err());
    }

    #[test]
    fn descriptor_reserved_channels() {
        let desc = Descriptor::new(0x10, "GPS", 7, &[(4, "Position"), (5, "Velocity")]);
        assert_eq!(desc.channels.entries(), 7);
        assert_eq!(desc.channels.get(0).unwrap().as_bytes(), b"Name");
        assert_eq!(desc.channels.get(1).unwrap().as_bytes(), b"Channels");
        assert_eq!(desc.channels.get(2).unwrap().as_bytes(), b"Timestamp");
        assert_eq!(desc.channels.get(4).unwrap().as_bytes(), b"Position");
        assert!(desc.channels.get(6).unwrap().is_empty());
    }

    #[test]
    fn descriptor_messages_precede_data() {
        let q = MessageQueue::new();
        q.init();
        let desc = Descriptor::new(0x02, "Internal", 5, &[(4, "Epoch")]);
        push_descriptors(&q, &desc).unwrap();
        let first = q.pop().unwrap();
        assert_eq!(first.channel, message::CHAN_NAME);
        let second = q.pop().unwrap();
        assert_eq!(second.channel, message::CHAN_MAP);
        assert!(q.pop().is_none());
    }
}
