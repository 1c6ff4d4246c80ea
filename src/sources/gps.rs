//! u-blox GPS source.
//!
//! Startup opens the receiver at its boot rate, commands a switch to the
//! target rate with UBX-only output, then configures the constellation and
//! message rates. The logging loop decodes NAV-TIMEUTC into the timestamp
//! channel, NAV-PVT into position/velocity/datetime float arrays, and
//! passes everything else through as raw frames.

use std::fs::File;
use std::thread::sleep;
use std::time::Duration;

use crate::config::{IniSection, LoggerConfig};
use crate::error::{Error, Result};
use crate::framing::FrameError;
use crate::message::{self, Message};
use crate::serial;
use crate::signals;
use crate::ubx::{self, commands, nav, UbxReader};

use super::{Descriptor, Source, SourceContext};

pub const CHAN_POSITION: u8 = 0x04;
pub const CHAN_VELOCITY: u8 = 0x05;
pub const CHAN_DATETIME: u8 = 0x06;

pub struct GpsSource {
    tag: String,
    name: String,
    source_num: u8,
    port: String,
    initial_baud: u32,
    target_baud: u32,
    dump_all: bool,
    handle: Option<File>,
}

impl GpsSource {
    pub fn from_section(section: &IniSection, defaults: &LoggerConfig) -> Result<GpsSource> {
        Ok(GpsSource {
            tag: section.name.clone(),
            name: super::source_name(section),
            source_num: super::resolve_source_num(section, message::SOURCE_GPS)?,
            port: section.require("port").map_err(Error::Config)?.to_string(),
            initial_baud: section.get_parsed::<u32>("initialbaud")?.unwrap_or(9600),
            target_baud: section.get_parsed::<u32>("baud")?.unwrap_or(115200),
            dump_all: section.get_bool("dumpall")?.unwrap_or(defaults.dump_all),
            handle: None,
        })
    }

    /// Open the connection and move the module to the target baud rate.
    ///
    /// If the module was already at the target rate it stops listening for
    /// about a second after receiving commands at the wrong rate, so the
    /// rate change is commanded twice with a settling delay in between.
    fn open_connection(&mut self) -> Result<File> {
        let mut handle = serial::open_serial(&self.port, self.initial_baud)?;
        commands::set_baud_rate(&mut handle, self.target_baud)?;
        handle.sync_all().ok();
        sleep(Duration::from_millis(50));

        serial::set_baud(&handle, self.target_baud)?;
        sleep(Duration::from_secs(1));

        commands::set_baud_rate(&mut handle, self.target_baud)?;
        sleep(Duration::from_millis(50));
        Ok(handle)
    }

    fn configure(&mut self) -> Result<()> {
        let handle = self.handle.as_mut().ok_or_else(|| Error::source_err("no GPS handle"))?;
        let pause = Duration::from_millis(5);

        log::info!("[GPS:{}] Enabling log messages", self.tag);
        commands::enable_log_messages(handle)?;
        sleep(pause);

        log::info!("[GPS:{}] Enabling Galileo (GNSS reset)", self.tag);
        commands::enable_galileo(handle)?;
        // Enabling Galileo can trigger a GNSS subsystem reset
        sleep(Duration::from_secs(3));

        commands::set_navigation_rate(handle, 500, 1)?;
        sleep(pause);
        commands::set_i2c_address(handle, 0x0A)?;
        sleep(pause);

        log::info!("[GPS:{}] Configuring message rates", self.tag);
        commands::set_message_rate(handle, ubx::CLASS_NAV, ubx::NAV_PVT, 1)?;
        sleep(pause);
        commands::set_message_rate(handle, ubx::CLASS_NAV, ubx::NAV_SAT, 120)?;
        sleep(pause);
        commands::set_message_rate(handle, ubx::CLASS_NAV, ubx::NAV_TIMEUTC, 1)?;
        sleep(pause);

        log::info!("[GPS:{}] Polling for status information", self.tag);
        commands::poll_message(handle, ubx::CLASS_MON, 0x04)?;
        sleep(pause);
        commands::poll_message(handle, ubx::CLASS_MON, 0x28)?;
        sleep(pause);
        commands::poll_message(handle, ubx::CLASS_CFG, 0x3E)?;
        sleep(pause);

        // Messages consumed while waiting are discarded; the stream proper
        // starts with the logging loop
        let mut reader = UbxReader::new();
        match commands::wait_for_message(
            &mut reader,
            handle,
            ubx::CLASS_ACK,
            0x01,
            Duration::from_secs(2),
        )? {
            Some(_) => log::debug!("[GPS:{}] Configuration acknowledged", self.tag),
            None => log::warn!("[GPS:{}] No configuration acknowledgement seen", self.tag),
        }
        Ok(())
    }
}

impl Source for GpsSource {
    fn kind(&self) -> &'static str {
        "GPS"
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn startup(&mut self) -> Result<()> {
        let handle = self.open_connection()?;
        self.handle = Some(handle);
        log::info!("[GPS:{}] Configuring receiver", self.tag);
        self.configure()?;
        log::info!("[GPS:{}] Configuration completed", self.tag);
        Ok(())
    }

    fn descriptor(&self) -> Option<Descriptor> {
        Some(Descriptor::new(
            self.source_num,
            &self.name,
            7,
            &[
                (message::CHAN_RAW, "Raw UBX"),
                (CHAN_POSITION, "Position"),
                (CHAN_VELOCITY, "Velocity"),
                (CHAN_DATETIME, "DateTime"),
            ],
        ))
    }

    fn logging(&mut self, ctx: &SourceContext) -> Result<()> {
        let mut handle = self
            .handle
            .take()
            .ok_or_else(|| Error::source_err("GPS logging started without a handle"))?;
        let mut reader = UbxReader::new();

        while !signals::shutdown_requested() {
            match reader.read_frame(&mut handle) {
                Ok(frame) => {
                    let mut handled = false;
                    if let Some(tow) = nav::timeutc_tow(&frame) {
                        ctx.push(Message::new_timestamp(
                            self.source_num,
                            message::CHAN_TSTAMP,
                            tow,
                        ))?;
                        handled = true;
                    } else if frame.class == ubx::CLASS_NAV && frame.id == ubx::NAV_PVT {
                        match nav::NavPvt::decode(&frame) {
                            None => {
                                log::error!("[GPS:{}] Unable to decode NAV-PVT message", self.tag)
                            }
                            Some(pvt) => {
                                let pos = [
                                    pvt.longitude,
                                    pvt.latitude,
                                    pvt.height as f32 * 1e-3,
                                    pvt.asl as f32 * 1e-3,
                                    pvt.horiz_acc as f32 * 1e-3,
                                    pvt.vert_acc as f32 * 1e-3,
                                ];
                                let vel = [
                                    pvt.north_v as f32 * 1e-3,
                                    pvt.east_v as f32 * 1e-3,
                                    pvt.down_v as f32 * 1e-3,
                                    pvt.ground_speed as f32 * 1e-3,
                                    pvt.heading,
                                    pvt.speed_acc as f32 * 1e-3,
                                    pvt.heading_acc,
                                ];
                                let dt = [
                                    pvt.year as f32,
                                    pvt.month as f32,
                                    pvt.day as f32,
                                    pvt.hour as f32,
                                    pvt.minute as f32,
                                    pvt.second as f32,
                                    pvt.nanosecond as f32,
                                    pvt.accuracy as f32,
                                ];
                                ctx.push(Message::new_float_array(
                                    self.source_num,
                                    CHAN_POSITION,
                                    &pos,
                                ))?;
                                ctx.push(Message::new_float_array(
                                    self.source_num,
                                    CHAN_VELOCITY,
                                    &vel,
                                ))?;
                                ctx.push(Message::new_float_array(
                                    self.source_num,
                                    CHAN_DATETIME,
                                    &dt,
                                ))?;
                                handled = true;
                            }
                        }
                    }
                    if !handled || self.dump_all {
                        ctx.push(Message::new_bytes(
                            self.source_num,
                            message::CHAN_RAW,
                            &frame.to_bytes(),
                        ))?;
                    }
                }
                Err(e) if e.is_recoverable() => {
                    if matches!(e, FrameError::Invalid) {
                        log::debug!("[GPS:{}] Invalid message on stream", self.tag);
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
