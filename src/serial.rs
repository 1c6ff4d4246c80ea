//! Serial port setup.
//!
//! Ports are opened read-write in raw mode with `VMIN = 0` and `VTIME = 1`,
//! so reads return whatever is available after at most 100 ms. Together with
//! the rolling decode buffers this gives every source a bounded blocking
//! time without per-byte polling.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::io::FromRawFd;

use crate::error::{Error, Result};

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Map a numeric baud rate onto the termios speed constant.
pub fn baud_to_flag(rate: u32) -> Option<libc::speed_t> {
    let flag = match rate {
        0 => libc::B0,
        1200 => libc::B1200,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        460800 => libc::B460800,
        500000 => libc::B500000,
        576000 => libc::B576000,
        921600 => libc::B921600,
        1000000 => libc::B1000000,
        1152000 => libc::B1152000,
        1500000 => libc::B1500000,
        2000000 => libc::B2000000,
        _ => return None,
    };
    Some(flag)
}

/// Reverse of [`baud_to_flag`], for diagnostics.
pub fn flag_to_baud(flag: libc::speed_t) -> Option<u32> {
    let rate = match flag {
        libc::B0 => 0,
        libc::B1200 => 1200,
        libc::B2400 => 2400,
        libc::B4800 => 4800,
        libc::B9600 => 9600,
        libc::B19200 => 19200,
        libc::B38400 => 38400,
        libc::B57600 => 57600,
        libc::B115200 => 115200,
        libc::B230400 => 230400,
        libc::B460800 => 460800,
        libc::B500000 => 500000,
        libc::B576000 => 576000,
        libc::B921600 => 921600,
        libc::B1000000 => 1000000,
        libc::B1152000 => 1152000,
        libc::B1500000 => 1500000,
        libc::B2000000 => 2000000,
        _ => return None,
    };
    Some(rate)
}

/// Open `port` at `baud` as a raw byte handle.
///
/// The port is not made our controlling terminal, post processing and flow
/// control are disabled, and the applied input rate is read back and
/// verified.
pub fn open_serial(port: &str, baud: u32) -> Result<File> {
    let rate = baud_to_flag(baud)
        .ok_or_else(|| Error::Serial(format!("unsupported baud rate {baud} for {port}")))?;

    let cpath = CString::new(port)
        .map_err(|_| Error::Serial(format!("invalid port path {port:?}")))?;
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_NOCTTY | libc::O_NDELAY) };
    if fd < 0 {
        return Err(Error::Serial(format!(
            "unable to open {port}: {}",
            io::Error::last_os_error()
        )));
    }
    // Ownership of the descriptor transfers to the File; any error path
    // below closes it on drop.
    let file = unsafe { File::from_raw_fd(fd) };

    unsafe {
        let mut options: libc::termios = std::mem::zeroed();
        cvt(libc::tcgetattr(fd, &mut options)).map_err(Error::Io)?;

        libc::cfsetispeed(&mut options, rate);
        libc::cfsetospeed(&mut options, rate);
        options.c_oflag &= !libc::OPOST;
        options.c_cflag &= !(libc::PARENB | libc::CSTOPB | libc::CSIZE);
        options.c_cflag |= libc::CLOCAL | libc::CREAD | libc::CS8;
        options.c_iflag &= !(libc::IGNBRK
            | libc::BRKINT
            | libc::PARMRK
            | libc::ISTRIP
            | libc::INLCR
            | libc::IGNCR
            | libc::ICRNL
            | libc::IXON);
        options.c_lflag &=
            !(libc::ECHO | libc::ECHONL | libc::ICANON | libc::ISIG | libc::IEXTEN);
        options.c_cc[libc::VTIME] = 1;
        options.c_cc[libc::VMIN] = 0;
        cvt(libc::tcsetattr(fd, libc::TCSANOW, &options)).map_err(Error::Io)?;
        libc::tcdrain(fd);

        let mut check: libc::termios = std::mem::zeroed();
        cvt(libc::tcgetattr(fd, &mut check)).map_err(Error::Io)?;
        if libc::cfgetispeed(&check) != rate {
            let got = flag_to_baud(libc::cfgetispeed(&check));
            return Err(Error::Serial(format!(
                "unable to set baud rate on {port}: wanted {baud}, got {got:?}"
            )));
        }
    }

    Ok(file)
}

/// Change the rate of an already open port, draining pending output first.
///
/// Used when a device is reconfigured to a faster rate after the initial
/// commands have been sent at its boot rate.
pub fn set_baud(file: &File, baud: u32) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let rate = baud_to_flag(baud)
        .ok_or_else(|| Error::Serial(format!("unsupported baud rate {baud}")))?;
    let fd = file.as_raw_fd();
    unsafe {
        let mut options: libc::termios = std::mem::zeroed();
        cvt(libc::tcgetattr(fd, &mut options)).map_err(Error::Io)?;
        libc::cfsetispeed(&mut options, rate);
        libc::cfsetospeed(&mut options, rate);
        cvt(libc::tcsetattr(fd, libc::TCSADRAIN, &options)).map_err(Error::Io)?;

        let mut check: libc::termios = std::mem::zeroed();
        cvt(libc::tcgetattr(fd, &mut check)).map_err(Error::Io)?;
        if libc::cfgetispeed(&check) != rate {
            return Err(Error::Serial(format!(
                "unable to change baud rate: wanted {baud}, got {:?}",
                flag_to_baud(libc::cfgetispeed(&check))
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_flag_round_trip() {
        for rate in [1200u32, 9600, 115200, 921600] {
            let flag = baud_to_flag(rate).unwrap();
            assert_eq!(flag_to_baud(flag), Some(rate));
        }
        assert!(baud_to_flag(12345).is_none());
    }

    #[test]
    fn open_missing_device_fails() {
        assert!(open_serial("/dev/tty-does-not-exist", 9600).is_err());
    }
}
