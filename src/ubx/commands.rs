//! UBX CFG command messages sent to the receiver during setup.
//!
//! Each helper builds a complete frame and writes it to the supplied handle.
//! Short writes are errors: a partially transmitted CFG message leaves the
//! receiver in an unknown state.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use super::{UbxFrame, UbxReader, CLASS_CFG};
use crate::error::{Error, Result};
use crate::framing::FrameError;

fn send(handle: &mut impl Write, frame: &UbxFrame) -> Result<()> {
    let bytes = frame.to_bytes();
    handle.write_all(&bytes)?;
    handle.flush()?;
    Ok(())
}

/// CFG-PRT: configure UART 1 for `baud` with all protocols permitted as
/// input and only UBX messages as output.
pub fn set_baud_rate(handle: &mut impl Write, baud: u32) -> Result<()> {
    let mut payload = vec![
        0x01, // Port 1 (UART)
        0x00, // Reserved
        0x00, 0x00, // No ready pin
        0xd0, 0x08, 0x00, 0x00, // UART mode: 8N1
        0x00, 0x00, 0x00, 0x00, // Baud rate, set below
        0x07, 0x00, // All protocols allowed as input
        0x01, 0x00, // UBX protocol only as output
        0x00, 0x00, // Flags
        0x00, 0x00, // Reserved
    ];
    payload[8..12].copy_from_slice(&baud.to_le_bytes());
    send(handle, &UbxFrame::new(CLASS_CFG, 0x00, payload))
}

/// CFG-PRT for the I²C/DDC port: sets the module address, leaves protocols
/// at their permissive defaults.
pub fn set_i2c_address(handle: &mut impl Write, addr: u8) -> Result<()> {
    let payload = vec![
        0x00, // I2C/DDC port
        0x00, // Reserved
        0x00, 0x00, // TX ready disabled
        addr << 1,
        0x00,
        0x00,
        0x00, // Mode: slave address
        0x00, 0x00, 0x00, 0x00, // Reserved
        0x07, 0x00, // All protocols in
        0x01, 0x00, // UBX out
        0x00, 0x00, // Flags
        0x00, 0x00, // Reserved
    ];
    send(handle, &UbxFrame::new(CLASS_CFG, 0x00, payload))
}

/// CFG-MSG: request `rate` on UART 1 and USB, disabled on all other ports.
pub fn set_message_rate(handle: &mut impl Write, class: u8, id: u8, rate: u8) -> Result<()> {
    let payload = vec![
        class, id, 0x00, // Disabled on I2C
        rate, // Every `rate` updates on UART 1
        0x00, // Disabled on UART 2
        rate, // Also enabled on USB
        0x00, // Disabled on SPI
        0x00, // Disabled on port 5
    ];
    send(handle, &UbxFrame::new(CLASS_CFG, 0x01, payload))
}

/// CFG-RATE: navigation solutions every `interval` milliseconds with one
/// output message every `output_rate` solutions, aligned to UTC.
pub fn set_navigation_rate(handle: &mut impl Write, interval: u16, output_rate: u16) -> Result<()> {
    let mut payload = vec![0u8; 6];
    payload[0..2].copy_from_slice(&interval.to_le_bytes());
    payload[2..4].copy_from_slice(&output_rate.to_le_bytes());
    // Bytes 4-5: align to UTC
    send(handle, &UbxFrame::new(CLASS_CFG, 0x08, payload))
}

/// CFG-GNSS: enable the Galileo constellation alongside the defaults.
///
/// The receiver performs a GNSS subsystem reset when this is applied, so the
/// caller must allow at least 3 seconds before sending further commands.
pub fn enable_galileo(handle: &mut impl Write) -> Result<()> {
    let payload = vec![
        0x00, 0x20, 0x20, 0x07, // Header: 7 config blocks follow
        0x00, 0x08, 0x10, 0x00, 0x01, 0x00, 0x01, 0x01, // GPS
        0x01, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x01, // SBAS
        0x02, 0x04, 0x08, 0x00, 0x01, 0x00, 0x01, 0x01, // Galileo (enabled)
        0x03, 0x08, 0x10, 0x00, 0x00, 0x00, 0x01, 0x01, // BeiDou
        0x04, 0x00, 0x08, 0x00, 0x00, 0x00, 0x01, 0x03, // IMES
        0x05, 0x00, 0x03, 0x00, 0x01, 0x00, 0x01, 0x05, // QZSS
        0x06, 0x08, 0x0E, 0x00, 0x01, 0x00, 0x01, 0x01, // GLONASS
    ];
    send(handle, &UbxFrame::new(CLASS_CFG, 0x3E, payload))
}

/// CFG-INF: enable error, warning and information messages on UART 1 and
/// disable them everywhere else.
pub fn enable_log_messages(handle: &mut impl Write) -> Result<()> {
    let payload = vec![
        0x00, // UBX protocol
        0x00, 0x00, 0x00, // Reserved
        0x00, 0x07, 0x00, 0x00, 0x00, 0x00, // Error/warning/info on UART 1 only
    ];
    send(handle, &UbxFrame::new(CLASS_CFG, 0x02, payload))
}

/// CFG-INF: disable the messages enabled by [`enable_log_messages`].
pub fn disable_log_messages(handle: &mut impl Write) -> Result<()> {
    let payload = vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    send(handle, &UbxFrame::new(CLASS_CFG, 0x02, payload))
}

/// Poll a message by sending its class and ID with an empty payload.
///
/// Not valid for every message type; consult the interface manual.
pub fn poll_message(handle: &mut impl Write, class: u8, id: u8) -> Result<()> {
    send(handle, &UbxFrame::new(class, id, Vec::new()))
}

/// Read and discard messages until one matches `class`/`id` or `max_delay`
/// elapses.
pub fn wait_for_message(
    reader: &mut UbxReader,
    handle: &mut impl Read,
    class: u8,
    id: u8,
    max_delay: Duration,
) -> Result<Option<UbxFrame>> {
    let deadline = Instant::now() + max_delay;
    while Instant::now() < deadline {
        match reader.read_frame(handle) {
            Ok(frame) => {
                if frame.class == class && frame.id == id {
                    return Ok(Some(frame));
                }
            }
            Err(e) if e.is_recoverable() => {
                std::thread::sleep(Duration::from_micros(50));
            }
            Err(FrameError::Io(e)) => return Err(Error::Io(e)),
            Err(e) => return Err(Error::Frame(e)),
        }
    }
    Ok(None)
}
