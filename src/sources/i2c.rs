//! I²C attached sensor source.
//!
//! Sensors are declared with repeatable configuration keys holding
//! colon-delimited descriptors:
//!
//! ```ini
//! [Power]
//! type = i2c
//! bus = /dev/i2c-1
//! frequency = 10
//! ina219 = 0x40:4
//! ads1015 = 0x48:8:0.001:0:-1:1
//! ```
//!
//! Each INA219 claims four channels from its base message ID (shunt
//! voltage, bus voltage, current, power); each ADS1015 claims four
//! single-ended inputs. The resulting channel map is validated against the
//! reserved channel IDs before the bus is opened.

use crate::config::{ConfigError, IniSection, LoggerConfig};
use crate::error::{Error, Result};
use crate::i2c::{self, I2cBus, ReadFn, ReadOptions};
use crate::message::{self, Message};
use crate::signals;
use crate::clock;

use super::{Descriptor, Source, SourceContext};

/// One registered sensor channel.
struct I2cChannel {
    device: u16,
    channel: u8,
    label: String,
    func: ReadFn,
    opts: ReadOptions,
}

pub struct I2cSource {
    tag: String,
    name: String,
    source_num: u8,
    bus_path: String,
    frequency: u32,
    chanmap: Vec<I2cChannel>,
    /// Device addresses needing INA219 calibration at startup.
    ina219_devices: Vec<u16>,
    bus: Option<I2cBus>,
}

fn bad_value(section: &IniSection, key: &str, reason: String) -> Error {
    Error::Config(ConfigError::BadValue {
        section: section.name.clone(),
        key: key.to_string(),
        reason,
    })
}

/// Parse `addr:msgid[:scale:offset:min:max]`.
fn parse_descriptor(
    section: &IniSection,
    key: &str,
    value: &str,
) -> Result<(u16, u8, ReadOptions)> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 2 && parts.len() != 6 {
        return Err(bad_value(
            section,
            key,
            format!("{value:?} is not addr:msgid[:scale:offset:min:max]"),
        ));
    }
    let parse_u16 = |s: &str| -> Option<u16> {
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u16::from_str_radix(hex, 16).ok()
        } else {
            s.parse().ok()
        }
    };
    let addr = parse_u16(parts[0])
        .ok_or_else(|| bad_value(section, key, format!("bad device address {:?}", parts[0])))?;
    let msgid = parse_u16(parts[1])
        .filter(|&m| m <= message::ID_MAX as u16)
        .ok_or_else(|| bad_value(section, key, format!("bad message ID {:?}", parts[1])))?;

    let mut opts = ReadOptions::default();
    if parts.len() == 6 {
        let parse_f = |s: &str, what: &str| -> Result<f32> {
            s.parse::<f32>()
                .map_err(|e| bad_value(section, key, format!("bad {what} {s:?}: {e}")))
        };
        opts.scale = parse_f(parts[2], "scale")?;
        opts.offset = parse_f(parts[3], "offset")?;
        opts.min = parse_f(parts[4], "minimum")?;
        opts.max = parse_f(parts[5], "maximum")?;
    }
    Ok((addr, msgid as u8, opts))
}

/// No channel may collide with another or with a reserved slot.
fn validate_chanmap(chanmap: &[I2cChannel]) -> bool {
    let mut seen = [false; 128];
    for reserved in [
        message::CHAN_NAME,
        message::CHAN_MAP,
        message::CHAN_TSTAMP,
        message::CHAN_RAW,
        message::CHAN_LOG_INFO,
        message::CHAN_LOG_WARN,
        message::CHAN_LOG_ERR,
    ] {
        seen[reserved as usize] = true;
    }
    for entry in chanmap {
        if entry.channel > message::ID_MAX || seen[entry.channel as usize] {
            return false;
        }
        seen[entry.channel as usize] = true;
    }
    true
}

impl I2cSource {
    pub fn from_section(section: &IniSection, _defaults: &LoggerConfig) -> Result<I2cSource> {
        let mut chanmap = Vec::new();
        let mut ina219_devices = Vec::new();

        for value in section.get_all("ina219") {
            let (addr, base, opts) = parse_descriptor(section, "ina219", value)?;
            ina219_devices.push(addr);
            let channels: [(&str, ReadFn); 4] = [
                ("Shunt Voltage", i2c::ina219_read_shunt_voltage),
                ("Bus Voltage", i2c::ina219_read_bus_voltage),
                ("Current", i2c::ina219_read_current),
                ("Power", i2c::ina219_read_power),
            ];
            for (ix, (what, func)) in channels.into_iter().enumerate() {
                chanmap.push(I2cChannel {
                    device: addr,
                    channel: base + ix as u8,
                    label: format!("0x{addr:02x}:{what}"),
                    func,
                    opts,
                });
            }
        }

        for value in section.get_all("ads1015") {
            let (addr, base, opts) = parse_descriptor(section, "ads1015", value)?;
            let channels: [(&str, ReadFn); 4] = [
                ("A0", i2c::ads1015_read_ch0),
                ("A1", i2c::ads1015_read_ch1),
                ("A2", i2c::ads1015_read_ch2),
                ("A3", i2c::ads1015_read_ch3),
            ];
            for (ix, (what, func)) in channels.into_iter().enumerate() {
                chanmap.push(I2cChannel {
                    device: addr,
                    channel: base + ix as u8,
                    label: format!("0x{addr:02x}:{what}"),
                    func,
                    opts,
                });
            }
        }

        if chanmap.is_empty() {
            return Err(bad_value(section, "ina219", "no sensors configured".into()));
        }
        if !validate_chanmap(&chanmap) {
            return Err(bad_value(
                section,
                "ina219",
                "channel map collides with reserved or duplicate IDs".into(),
            ));
        }

        Ok(I2cSource {
            tag: section.name.clone(),
            name: super::source_name(section),
            source_num: super::resolve_source_num(section, message::SOURCE_I2C)?,
            bus_path: section.require("bus").map_err(Error::Config)?.to_string(),
            frequency: section.get_parsed::<u32>("frequency")?.unwrap_or(10).max(1),
            chanmap,
            ina219_devices,
            bus: None,
        })
    }
}

impl Source for I2cSource {
    fn kind(&self) -> &'static str {
        "I2C"
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn startup(&mut self) -> Result<()> {
        let mut bus = I2cBus::open(&self.bus_path)?;
        for &dev in &self.ina219_devices {
            i2c::ina219_configure(&mut bus, dev)?;
        }
        self.bus = Some(bus);
        log::info!("[I2C:{}] Connected", self.tag);
        Ok(())
    }

    fn descriptor(&self) -> Option<Descriptor> {
        let max_id = self.chanmap.iter().map(|c| c.channel).max().unwrap_or(3);
        let extra: Vec<(u8, &str)> = self
            .chanmap
            .iter()
            .map(|c| (c.channel, c.label.as_str()))
            .collect();
        Some(Descriptor::new(
            self.source_num,
            &self.name,
            max_id as usize + 1,
            &extra,
        ))
    }

    fn logging(&mut self, ctx: &SourceContext) -> Result<()> {
        let mut bus = self
            .bus
            .take()
            .ok_or_else(|| Error::source_err("I2C logging started without a bus"))?;
        let incr_ns = 1_000_000_000u64 / self.frequency as u64;

        while !signals::shutdown_requested() {
            let start = clock::monotonic_ns();
            for entry in &self.chanmap {
                match (entry.func)(&mut bus, entry.device, &entry.opts) {
                    Ok(value) => {
                        ctx.push(Message::new_float(self.source_num, entry.channel, value))?;
                    }
                    Err(e) => {
                        log::warn!(
                            "[I2C:{}] Read failed for {} (channel 0x{:02x}): {e}",
                            self.tag,
                            entry.label,
                            entry.channel
                        );
                    }
                }
            }
            let next = start + incr_ns;
            let now = clock::monotonic_ns();
            if next <= now {
                log::warn!("[I2C:{}] Deadline missed", self.tag);
                continue;
            }
            std::thread::sleep(std::time::Duration::from_nanos(next - now));
        }
        self.bus = Some(bus);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.bus = None;
    }
}
