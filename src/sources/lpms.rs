//! LPMS inertial measurement unit source.
//!
//! Startup switches the unit to command mode, queries its identity, sets
//! the streaming rate and the set of transmitted outputs, then the logging
//! loop switches to stream mode. Data packets cannot be interpreted until
//! the unit has confirmed its outputs bitmask, so packets that arrive
//! before the GET_OUTPUTS reply are dropped (with a periodic warning and a
//! re-request).

use std::fs::File;
use std::io::Write;
use std::thread::sleep;
use std::time::Duration;

use crate::config::{IniSection, LoggerConfig};
use crate::error::{Error, Result};
use crate::framing::FrameError;
use crate::lpms::{self, ImuOutputs, LpmsReader};
use crate::message::{self, Message};
use crate::serial::open_serial;
use crate::signals;

use super::{Descriptor, Source, SourceContext};

pub const CHAN_ACC_RAW_X: u8 = 4;
pub const CHAN_ACC_CAL_X: u8 = 7;
pub const CHAN_GYRO_RAW_X: u8 = 10;
pub const CHAN_GYRO_CAL_X: u8 = 13;
pub const CHAN_GYRO_ALIGN_X: u8 = 16;
pub const CHAN_OMEGA_X: u8 = 19;
pub const CHAN_ROLL: u8 = 22;
pub const CHAN_PITCH: u8 = 23;
pub const CHAN_YAW: u8 = 24;
pub const CHAN_ACC_LIN_X: u8 = 25;
pub const CHAN_ALTITUDE: u8 = 28;

/// Outputs requested from the unit at startup.
fn requested_outputs() -> ImuOutputs {
    ImuOutputs::ACCEL_RAW
        | ImuOutputs::ACCEL_CAL
        | ImuOutputs::GYRO_RAW
        | ImuOutputs::GYRO_CAL
        | ImuOutputs::GYRO_ALIGNED
        | ImuOutputs::OMEGA
        | ImuOutputs::EULER
        | ImuOutputs::ACCEL_LINEAR
        | ImuOutputs::ALTITUDE
}

pub struct LpmsSource {
    tag: String,
    name: String,
    source_num: u8,
    port: String,
    baud: u32,
    unit_id: u16,
    poll_freq: u32,
    handle: Option<File>,
}

impl LpmsSource {
    pub fn from_section(section: &IniSection, _defaults: &LoggerConfig) -> Result<LpmsSource> {
        Ok(LpmsSource {
            tag: section.name.clone(),
            name: super::source_name(section),
            source_num: super::resolve_source_num(section, message::SOURCE_ADC)?,
            port: section.require("port").map_err(Error::Config)?.to_string(),
            baud: section.get_parsed::<u32>("baud")?.unwrap_or(921600),
            unit_id: section.get_parsed::<u16>("unit")?.unwrap_or(1),
            poll_freq: section.get_parsed::<u32>("frequency")?.unwrap_or(10),
            handle: None,
        })
    }

    fn send(&self, handle: &mut File, frame: &lpms::LpmsFrame) -> Result<()> {
        handle.write_all(&frame.to_bytes())?;
        Ok(())
    }

    fn push_triplet(
        &self,
        ctx: &SourceContext,
        base: u8,
        values: Option<[f32; 3]>,
    ) -> Result<()> {
        if let Some(v) = values {
            for (ix, value) in v.iter().enumerate() {
                ctx.push(Message::new_float(self.source_num, base + ix as u8, *value))?;
            }
        }
        Ok(())
    }
}

impl Source for LpmsSource {
    fn kind(&self) -> &'static str {
        "LPMS"
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn startup(&mut self) -> Result<()> {
        let mut handle = open_serial(&self.port, self.baud)?;

        self.send(&mut handle, &lpms::command_mode(self.unit_id))?;
        sleep(Duration::from_millis(250));
        self.send(&mut handle, &lpms::LpmsFrame::new(self.unit_id, lpms::CMD_GET_SENSORMODEL, Vec::new()))?;
        sleep(Duration::from_millis(10));
        self.send(&mut handle, &lpms::LpmsFrame::new(self.unit_id, lpms::CMD_GET_FIRMWAREVER, Vec::new()))?;
        sleep(Duration::from_millis(10));
        self.send(&mut handle, &lpms::LpmsFrame::new(self.unit_id, lpms::CMD_GET_SERIALNUM, Vec::new()))?;
        sleep(Duration::from_millis(10));

        self.send(&mut handle, &lpms::set_rate(self.unit_id, self.poll_freq))?;
        sleep(Duration::from_millis(125));
        self.send(&mut handle, &lpms::LpmsFrame::new(self.unit_id, lpms::CMD_GET_FREQ, Vec::new()))?;
        sleep(Duration::from_millis(10));

        self.send(&mut handle, &lpms::set_outputs(self.unit_id, requested_outputs()))?;
        sleep(Duration::from_millis(125));
        self.send(&mut handle, &lpms::get_outputs(self.unit_id))?;
        sleep(Duration::from_millis(10));

        log::info!("[LPMS:{}] Initial setup commands sent", self.tag);
        self.handle = Some(handle);
        Ok(())
    }

    fn descriptor(&self) -> Option<Descriptor> {
        Some(Descriptor::new(
            self.source_num,
            &self.name,
            29,
            &[
                (message::CHAN_RAW, "Raw Data"),
                (CHAN_ACC_RAW_X, "AccelerationRaw_X"),
                (CHAN_ACC_RAW_X + 1, "AccelerationRaw_Y"),
                (CHAN_ACC_RAW_X + 2, "AccelerationRaw_Z"),
                (CHAN_ACC_CAL_X, "AccelerationCal_X"),
                (CHAN_ACC_CAL_X + 1, "AccelerationCal_Y"),
                (CHAN_ACC_CAL_X + 2, "AccelerationCal_Z"),
                (CHAN_GYRO_RAW_X, "GyroRaw_X"),
                (CHAN_GYRO_RAW_X + 1, "GyroRaw_Y"),
                (CHAN_GYRO_RAW_X + 2, "GyroRaw_Z"),
                (CHAN_GYRO_CAL_X, "GyroCal_X"),
                (CHAN_GYRO_CAL_X + 1, "GyroCal_Y"),
                (CHAN_GYRO_CAL_X + 2, "GyroCal_Z"),
                (CHAN_GYRO_ALIGN_X, "GyroAlign_X"),
                (CHAN_GYRO_ALIGN_X + 1, "GyroAlign_Y"),
                (CHAN_GYRO_ALIGN_X + 2, "GyroAlign_Z"),
                (CHAN_OMEGA_X, "AngularVel_X"),
                (CHAN_OMEGA_X + 1, "AngularVel_Y"),
                (CHAN_OMEGA_X + 2, "AngularVel_Z"),
                (CHAN_ROLL, "Roll"),
                (CHAN_PITCH, "Pitch"),
                (CHAN_YAW, "Yaw"),
                (CHAN_ACC_LIN_X, "AccelerationLin_X"),
                (CHAN_ACC_LIN_X + 1, "AccelerationLin_Y"),
                (CHAN_ACC_LIN_X + 2, "AccelerationLin_Z"),
                (CHAN_ALTITUDE, "Altitude"),
            ],
        ))
    }

    fn logging(&mut self, ctx: &SourceContext) -> Result<()> {
        let mut handle = self
            .handle
            .take()
            .ok_or_else(|| Error::source_err("LPMS logging started without a handle"))?;
        self.send(&mut handle, &lpms::stream_mode(self.unit_id))?;

        let mut reader = LpmsReader::new();
        let mut outputs: Option<ImuOutputs> = None;
        let mut unit_mismatch_warned = false;
        let mut pending = 0u32;

        while !signals::shutdown_requested() {
            match reader.read_frame(&mut handle) {
                Ok(frame) => {
                    if !frame.checksum_ok() {
                        continue;
                    }
                    if frame.id != self.unit_id && !unit_mismatch_warned {
                        log::warn!(
                            "[LPMS:{}] Unexpected unit ID (got 0x{:02x}, expected 0x{:02x})",
                            self.tag,
                            frame.id,
                            self.unit_id
                        );
                        unit_mismatch_warned = true;
                    }
                    match frame.command {
                        lpms::CMD_GET_OUTPUTS => {
                            if frame.data.len() >= 4 {
                                let bits = u32::from_le_bytes([
                                    frame.data[0],
                                    frame.data[1],
                                    frame.data[2],
                                    frame.data[3],
                                ]);
                                outputs = Some(ImuOutputs::from_bits_truncate(bits));
                                log::info!(
                                    "[LPMS:{}] Outputs bitmask confirmed: 0x{bits:08x}",
                                    self.tag
                                );
                            }
                        }
                        lpms::CMD_GET_IMUDATA => match outputs {
                            None => {
                                pending += 1;
                                if pending % 100 == 1 {
                                    log::warn!(
                                        "[LPMS:{}] Data received before outputs confirmed - dropping",
                                        self.tag
                                    );
                                    self.send(&mut handle, &lpms::get_outputs(self.unit_id))?;
                                }
                            }
                            Some(mask) => {
                                if let Some(data) = lpms::parse_imu_data(&frame, mask) {
                                    ctx.push(Message::new_timestamp(
                                        self.source_num,
                                        message::CHAN_TSTAMP,
                                        data.timestamp.wrapping_mul(2),
                                    ))?;
                                    self.push_triplet(ctx, CHAN_ACC_RAW_X, data.accel_raw)?;
                                    self.push_triplet(ctx, CHAN_ACC_CAL_X, data.accel_cal)?;
                                    self.push_triplet(ctx, CHAN_GYRO_RAW_X, data.gyro_raw)?;
                                    self.push_triplet(ctx, CHAN_GYRO_CAL_X, data.gyro_cal)?;
                                    self.push_triplet(ctx, CHAN_GYRO_ALIGN_X, data.gyro_aligned)?;
                                    self.push_triplet(ctx, CHAN_OMEGA_X, data.omega)?;
                                    if let Some(euler) = data.euler {
                                        ctx.push(Message::new_float(self.source_num, CHAN_ROLL, euler[0]))?;
                                        ctx.push(Message::new_float(self.source_num, CHAN_PITCH, euler[1]))?;
                                        ctx.push(Message::new_float(self.source_num, CHAN_YAW, euler[2]))?;
                                    }
                                    self.push_triplet(ctx, CHAN_ACC_LIN_X, data.accel_linear)?;
                                    if let Some(alt) = data.altitude {
                                        ctx.push(Message::new_float(self.source_num, CHAN_ALTITUDE, alt))?;
                                    }
                                } else {
                                    log::debug!("[LPMS:{}] Undecodable data packet", self.tag);
                                }
                            }
                        },
                        lpms::CMD_GET_SENSORMODEL
                        | lpms::CMD_GET_FIRMWAREVER
                        | lpms::CMD_GET_SERIALNUM => {
                            let text = String::from_utf8_lossy(&frame.data);
                            log::info!(
                                "[LPMS:{}] Unit info (0x{:02x}): {}",
                                self.tag,
                                frame.command,
                                text.trim_end_matches('\0')
                            );
                        }
                        _ => {
                            log::debug!(
                                "[LPMS:{}] Unhandled response 0x{:02x}",
                                self.tag,
                                frame.command
                            );
                        }
                    }
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
    fn config_defaults() {
        let ini = IniConfig::parse_str("[Motion]\ntype = lpms\nport = /dev/ttyUSB1\n").unwrap();
        let cfg = LoggerConfig::default();
        let src = LpmsSource::from_section(ini.get_section("Motion").unwrap(), &cfg).unwrap();
        assert_eq!(src.baud, 921600);
        assert_eq!(src.unit_id, 1);
        assert_eq!(src.poll_freq, 10);
        assert_eq!(src.source_num, message::SOURCE_ADC);
    }

    #[test]
    fn descriptor_covers_all_imu_channels() {
        let ini = IniConfig::parse_str("[Motion]\ntype = lpms\nport = /dev/ttyUSB1\n").unwrap();
        let cfg = LoggerConfig::default();
        let src = LpmsSource::from_section(ini.get_section("Motion").unwrap(), &cfg).unwrap();
        let desc = src.descriptor().unwrap();
        assert_eq!(desc.channels.entries(), 29);
        assert_eq!(desc.channels.get(CHAN_ROLL as usize).unwrap().as_bytes(), b"Roll");
        assert_eq!(desc.channels.get(CHAN_ALTITUDE as usize).unwrap().as_bytes(), b"Altitude");
        // No gaps in the decoded range
        for ch in 4..=28usize {
            assert!(!desc.channels.get(ch).unwrap().is_empty(), "channel {ch} unnamed");
        }
    }

    #[test]
    fn requested_outputs_match_decoded_sections() {
        let mask = requested_outputs();
        assert!(mask.contains(ImuOutputs::EULER));
        assert!(mask.contains(ImuOutputs::ALTITUDE));
        assert!(!mask.contains(ImuOutputs::PRESSURE));
        assert!(!mask.contains(ImuOutputs::QUATERNION));
    }
}
