//! Multi-source instrument data logger.
//!
//! The crate is organised in three layers:
//!
//! - Base types shared by every component: [`strarray`], [`message`],
//!   [`queue`], [`error`], [`clock`], [`logging`] and [`signals`].
//! - Wire protocol support, one module per instrument family: [`ubx`],
//!   [`nmea`], [`dw`], [`n2k`], [`lpms`] and the native [`mp`] envelope.
//!   These share the rolling-buffer discipline in [`framing`].
//! - The acquisition layer: [`config`] maps an INI file onto typed source
//!   parameters, [`sources`] hosts one state machine per input device, and
//!   [`writer`] drains the shared queue into rotated MessagePack files.

pub mod clock;
pub mod config;
pub mod dw;
pub mod error;
pub mod framing;
pub mod i2c;
pub mod logging;
pub mod lpms;
pub mod message;
pub mod mp;
pub mod n2k;
pub mod nmea;
pub mod queue;
pub mod serial;
pub mod signals;
pub mod sources;
pub mod strarray;
pub mod ubx;
pub mod writer;

pub use error::{Error, Result};
