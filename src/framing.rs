//! Shared state for the framed protocol decoders.
//!
//! All of the serial protocols are decoded the same way: bytes are appended
//! to a rolling buffer at the high water mark, a search cursor scans forward
//! for a sync byte, and consumed or discarded bytes are compacted off the
//! front after each attempt. The per-protocol modules implement the framing
//! itself; this module owns the buffer plumbing and the status codes they
//! report when no complete message is available.

use std::io::{ErrorKind, Read};

/// Decoder status for an attempt that did not produce a message.
///
/// The numeric codes are stable and appear in diagnostics: they match the
/// values written into partially decoded messages on the wire-facing side.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Not enough data buffered for a complete message. Retry later.
    #[error("incomplete message, more data required")]
    NeedMore,
    /// As [`FrameError::NeedMore`], but the last read returned zero bytes.
    /// Streaming consumers can ignore this; file consumers treat it as EOF.
    #[error("no data read from source")]
    ZeroRead,
    /// Sync bytes were found but the message failed validation. The cursor
    /// has been advanced one byte to resynchronise.
    #[error("invalid message following sync")]
    Invalid,
    /// The underlying read failed.
    #[error("read error: {0}")]
    Io(#[source] std::io::Error),
}

impl FrameError {
    /// Diagnostic status byte for this condition.
    pub fn code(&self) -> u8 {
        match self {
            FrameError::NeedMore => 0xFF,
            FrameError::ZeroRead => 0xFD,
            FrameError::Invalid => 0xEE,
            FrameError::Io(_) => 0xAA,
        }
    }

    /// True for conditions that a polling loop should retry after a short
    /// sleep rather than treat as fatal.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FrameError::Io(_))
    }
}

/// Rolling decode buffer with a search cursor and high water mark.
pub struct FrameBuffer {
    buf: Vec<u8>,
    /// Current search position.
    index: usize,
    /// End of valid data.
    hw: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        FrameBuffer {
            buf: vec![0u8; capacity],
            index: 0,
            hw: 0,
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes available between the cursor and the high water mark.
    #[inline(always)]
    pub fn available(&self) -> usize {
        self.hw - self.index
    }

    /// View of the unconsumed data.
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.buf[self.index..self.hw]
    }

    /// Top up the buffer from `source`. Returns the number of bytes read.
    ///
    /// A would-block condition from a non-blocking source is reported as a
    /// zero byte read, matching the behaviour of a VTIME-expired serial read.
    pub fn fill(&mut self, source: &mut impl Read) -> Result<usize, FrameError> {
        if self.hw >= self.buf.len() - 1 {
            return Ok(0);
        }
        match source.read(&mut self.buf[self.hw..]) {
            Ok(n) => {
                self.hw += n;
                Ok(n)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                Ok(0)
            }
            Err(e) => Err(FrameError::Io(e)),
        }
    }

    /// Advance the cursor until `pred` matches or data runs out. Returns
    /// true if positioned on a matching byte.
    pub fn seek_sync(&mut self, pred: impl Fn(u8) -> bool) -> bool {
        while self.index < self.hw {
            if pred(self.buf[self.index]) {
                return true;
            }
            self.index += 1;
        }
        false
    }

    /// Consume `n` bytes from the front of the unread region.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        self.index = (self.index + n).min(self.hw);
    }

    /// Skip a single byte, used to resynchronise after an invalid message.
    #[inline(always)]
    pub fn skip_byte(&mut self) {
        self.consume(1);
    }

    /// Move the unread region back to the start of the buffer.
    pub fn compact(&mut self) {
        if self.index == 0 {
            return;
        }
        self.buf.copy_within(self.index..self.hw, 0);
        self.hw -= self.index;
        self.index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn fill_seek_consume_compact() {
        let mut fb = FrameBuffer::new(32);
        let mut src = Cursor::new(vec![0u8, 0, 0xB5, 0x62, 1, 2]);
        assert_eq!(fb.fill(&mut src).unwrap(), 6);
        assert!(fb.seek_sync(|b| b == 0xB5));
        assert_eq!(fb.data()[0], 0xB5);
        assert_eq!(fb.available(), 4);
        fb.consume(4);
        fb.compact();
        assert_eq!(fb.available(), 0);
        // Subsequent fills append at the compacted high water mark
        let mut more = Cursor::new(vec![9u8]);
        assert_eq!(fb.fill(&mut more).unwrap(), 1);
        assert_eq!(fb.data(), &[9]);
    }

    #[test]
    fn status_codes() {
        assert_eq!(FrameError::NeedMore.code(), 0xFF);
        assert_eq!(FrameError::ZeroRead.code(), 0xFD);
        assert_eq!(FrameError::Invalid.code(), 0xEE);
        assert!(FrameError::Invalid.is_recoverable());
        let io = FrameError::Io(std::io::Error::new(ErrorKind::Other, "x"));
        assert_eq!(io.code(), 0xAA);
        assert!(!io.is_recoverable());
    }
}
