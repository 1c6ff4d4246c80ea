//! Datawell wave buoy source (HXV over TCP).
//!
//! Each received line yields a signal quality value and, when the line is
//! usable, three displacement components. Cyclic data words are accumulated
//! until the sync word allows a spectrum block to be decoded; the system
//! words carried by the spectra are collected by sequence number and decoded
//! into a system record once all sixteen are present.

use std::io::Read;
use std::net::TcpStream;
use std::time::{Duration, Instant};

use crate::config::{IniSection, LoggerConfig};
use crate::dw;
use crate::error::{Error, Result};
use crate::message::{self, Message};
use crate::signals;

use super::net::net_connect;
use super::{Descriptor, Source, SourceContext};

pub const CHAN_SIGNAL: u8 = 0x04;
pub const CHAN_DISP_N: u8 = 0x05;
pub const CHAN_DISP_W: u8 = 0x06;
pub const CHAN_DISP_V: u8 = 0x07;
pub const CHAN_LAT: u8 = 0x08;
pub const CHAN_LON: u8 = 0x09;
pub const CHAN_ORIENT: u8 = 0x0A;
pub const CHAN_INCLIN: u8 = 0x0B;
pub const CHAN_GPSFIX: u8 = 0x0C;
pub const CHAN_HRMS: u8 = 0x0D;
pub const CHAN_TREF: u8 = 0x0E;
pub const CHAN_TWTR: u8 = 0x0F;
pub const CHAN_WEEKS: u8 = 0x10;
pub const CHAN_SP_FREQ: u8 = 0x11;
pub const CHAN_SP_DIRN: u8 = 0x12;
pub const CHAN_SP_SPREAD: u8 = 0x13;
pub const CHAN_SP_M2: u8 = 0x14;
pub const CHAN_SP_N2: u8 = 0x15;
pub const CHAN_SP_RPSD: u8 = 0x16;
pub const CHAN_SP_K: u8 = 0x17;

/// Warn when nothing usable has arrived for this long.
const GOOD_SIGNAL_WINDOW: Duration = Duration::from_secs(300);

pub struct DwSource {
    tag: String,
    name: String,
    source_num: u8,
    host: String,
    port: u16,
    timeout: u64,
    record_raw: bool,
    parse_spectrum: bool,
    handle: Option<TcpStream>,
}

impl DwSource {
    pub fn from_section(section: &IniSection, _defaults: &LoggerConfig) -> Result<DwSource> {
        Ok(DwSource {
            tag: section.name.clone(),
            name: super::source_name(section),
            source_num: super::resolve_source_num(section, message::SOURCE_EXT)?,
            host: section.require("host").map_err(Error::Config)?.to_string(),
            port: section.get_parsed::<u16>("port")?.unwrap_or(1180),
            timeout: section.get_parsed::<u64>("timeout")?.unwrap_or(60),
            record_raw: section.get_bool("raw")?.unwrap_or(true),
            parse_spectrum: section.get_bool("spectrum")?.unwrap_or(false),
            handle: None,
        })
    }

    fn push_value(&self, ctx: &SourceContext, channel: u8, value: f32) -> Result<()> {
        ctx.push(Message::new_float(self.source_num, channel, value))
    }
}

impl Source for DwSource {
    fn kind(&self) -> &'static str {
        "DW"
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn startup(&mut self) -> Result<()> {
        self.handle = Some(net_connect(&self.host, self.port)?);
        log::info!("[DW:{}] Connected", self.tag);
        Ok(())
    }

    fn descriptor(&self) -> Option<Descriptor> {
        let entries = if self.parse_spectrum { 24 } else { 17 };
        let mut extra: Vec<(u8, &str)> = vec![
            (message::CHAN_RAW, "Raw Data"),
            (CHAN_SIGNAL, "Signal"),
            (CHAN_DISP_N, "Displacement N"),
            (CHAN_DISP_W, "Displacement W"),
            (CHAN_DISP_V, "Displacement V"),
            (CHAN_LAT, "Latitude"),
            (CHAN_LON, "Longitude"),
            (CHAN_ORIENT, "Orientation"),
            (CHAN_INCLIN, "Inclination"),
            (CHAN_GPSFIX, "GPS Status"),
            (CHAN_HRMS, "RMS Height"),
            (CHAN_TREF, "Ref. Temperature"),
            (CHAN_TWTR, "Water Temperature"),
            (CHAN_WEEKS, "Weeks Remaining"),
        ];
        if self.parse_spectrum {
            extra.extend_from_slice(&[
                (CHAN_SP_FREQ, "Sp-FrequencyBin"),
                (CHAN_SP_DIRN, "Sp-Direction"),
                (CHAN_SP_SPREAD, "Sp-Spread"),
                (CHAN_SP_M2, "Sp-m2"),
                (CHAN_SP_N2, "Sp-n2"),
                (CHAN_SP_RPSD, "Sp-RPSD"),
                (CHAN_SP_K, "Sp-K"),
            ]);
        }
        Some(Descriptor::new(self.source_num, &self.name, entries, &extra))
    }

    fn logging(&mut self, ctx: &SourceContext) -> Result<()> {
        let mut buf = vec![0u8; 1024];
        let mut hw = 0usize;
        let mut last_read = Instant::now();
        let mut last_good_signal = Instant::now();

        // Cyclic word accumulator, aligned so the sync word sits at index 0
        let mut cycdata = [0u16; 20];
        let mut ccount = 0usize;

        let mut sysdata = [0u16; 16];
        let mut sdset = [false; 16];

        while !signals::shutdown_requested() {
            if last_read.elapsed().as_secs() > self.timeout {
                log::warn!("[DW:{}] Network timeout, reconnecting", self.tag);
                self.handle = Some(net_connect(&self.host, self.port)?);
                log::info!("[DW:{}] Reconnected", self.tag);
                last_read = Instant::now();
            }

            let handle = self
                .handle
                .as_mut()
                .ok_or_else(|| Error::source_err("DW logging without a connection"))?;
            if hw < buf.len() {
                match handle.read(&mut buf[hw..]) {
                    Ok(0) => {}
                    Ok(n) => {
                        hw += n;
                        last_read = Instant::now();
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(Error::Io(e)),
                }
            }

            if hw < dw::MIN_LINE {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }

            if let Some((line, used)) = dw::parse_line(&buf[..hw]) {
                if self.record_raw {
                    ctx.push(Message::new_bytes(
                        self.source_num,
                        message::CHAN_RAW,
                        &buf[..used],
                    ))?;
                }
                self.push_value(ctx, CHAN_SIGNAL, line.status as f32)?;
                if line.status < 2 {
                    last_good_signal = Instant::now();
                    self.push_value(ctx, CHAN_DISP_N, line.north() as f32)?;
                    self.push_value(ctx, CHAN_DISP_W, line.west() as f32)?;
                    self.push_value(ctx, CHAN_DISP_V, line.vertical() as f32)?;
                    if ccount < cycdata.len() {
                        cycdata[ccount] = line.cycdat();
                        ccount += 1;
                    }
                }
                buf.copy_within(used..hw, 0);
                hw -= used;
            } else {
                // No complete line; drop data ahead of any CR to bound the
                // buffer
                if hw == buf.len() {
                    hw = 0;
                }
                std::thread::sleep(Duration::from_millis(50));
            }

            if last_good_signal.elapsed() > GOOD_SIGNAL_WINDOW {
                log::warn!("[DW:{}] No valid data received from buoy", self.tag);
                last_good_signal = Instant::now();
            }

            if ccount > 18 {
                // Align to the sync word
                let sync_at = cycdata[..ccount].iter().position(|&w| w == dw::SYNC_WORD);
                match sync_at {
                    None => {
                        ccount = 0;
                        cycdata = [0u16; 20];
                        continue;
                    }
                    Some(at) if at > 0 => {
                        cycdata.copy_within(at..ccount, 0);
                        ccount -= at;
                        if ccount < 19 {
                            continue;
                        }
                    }
                    Some(_) => {}
                }

                match dw::spectrum_from_words(&cycdata[..ccount]) {
                    None => {
                        log::info!("[DW:{}] Invalid spectrum data", self.tag);
                    }
                    Some(spectrum) => {
                        sysdata[spectrum.sysseq as usize] = spectrum.sysword;
                        sdset[spectrum.sysseq as usize] = true;
                        if self.parse_spectrum {
                            for n in 0..4 {
                                self.push_value(ctx, CHAN_SP_FREQ, spectrum.frequency_bin[n] as f32)?;
                                self.push_value(ctx, CHAN_SP_DIRN, spectrum.direction[n])?;
                                self.push_value(ctx, CHAN_SP_SPREAD, spectrum.spread[n])?;
                                self.push_value(ctx, CHAN_SP_M2, spectrum.m2[n])?;
                                self.push_value(ctx, CHAN_SP_N2, spectrum.n2[n])?;
                                self.push_value(ctx, CHAN_SP_RPSD, spectrum.rpsd[n])?;
                                self.push_value(ctx, CHAN_SP_K, spectrum.k[n])?;
                            }
                        }
                    }
                }

                if sdset.iter().all(|&s| s) {
                    let sys = dw::system_from_words(&sysdata);
                    self.push_value(ctx, CHAN_LAT, sys.lat)?;
                    self.push_value(ctx, CHAN_LON, sys.lon)?;
                    self.push_value(ctx, CHAN_ORIENT, sys.orient)?;
                    self.push_value(ctx, CHAN_INCLIN, sys.incl)?;
                    self.push_value(ctx, CHAN_GPSFIX, if sys.gps_fix { 1.0 } else { 0.0 })?;
                    self.push_value(ctx, CHAN_HRMS, sys.h_rms)?;
                    self.push_value(ctx, CHAN_TREF, sys.ref_temp)?;
                    self.push_value(ctx, CHAN_TWTR, sys.water_temp)?;
                    self.push_value(ctx, CHAN_WEEKS, sys.op_time as f32)?;
                    sysdata = [0u16; 16];
                    sdset = [false; 16];
                }

                // Keep the trailing words beyond the decoded block
                cycdata[0] = cycdata[18];
                cycdata[1] = cycdata[19];
                cycdata[2..].fill(0);
                ccount = 2;
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(stream) = self.handle.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IniConfig;

    #[test]
    fn descriptor_channel_layout() {
        let ini = IniConfig::parse_str(
            "[Buoy]\ntype = dw\nhost = buoy.local\nspectrum = yes\n",
        )
        .unwrap();
        let cfg = LoggerConfig::default();
        let src = DwSource::from_section(ini.get_section("Buoy").unwrap(), &cfg).unwrap();
        let desc = src.descriptor().unwrap();
        assert_eq!(desc.channels.entries(), 24);
        assert_eq!(desc.channels.get(CHAN_SIGNAL as usize).unwrap().as_bytes(), b"Signal");
        assert_eq!(desc.channels.get(CHAN_WEEKS as usize).unwrap().as_bytes(), b"Weeks Remaining");
        assert_eq!(desc.channels.get(CHAN_SP_K as usize).unwrap().as_bytes(), b"Sp-K");
    }

    #[test]
    fn spectrum_channels_absent_by_default() {
        let ini = IniConfig::parse_str("[Buoy]\ntype = dw\nhost = buoy.local\n").unwrap();
        let cfg = LoggerConfig::default();
        let src = DwSource::from_section(ini.get_section("Buoy").unwrap(), &cfg).unwrap();
        let desc = src.descriptor().unwrap();
        assert_eq!(desc.channels.entries(), 17);
        assert!(!src.parse_spectrum);
        assert!(src.record_raw);
    }
}
