//! Timestamp generator source.
//!
//! Emits a monotonic millisecond timestamp on channel 2 at the configured
//! frequency, and an epoch-seconds timestamp on channel 4 whenever the wall
//! clock second changes. Downstream tooling aligns all other sources
//! against these marks.

use crate::clock;
use crate::config::{IniSection, LoggerConfig};
use crate::error::Result;
use crate::message::{self, Message};
use crate::signals;

use super::{Descriptor, Source, SourceContext};

/// Channel carrying the epoch-seconds marks.
pub const CHAN_EPOCH: u8 = 0x04;

pub struct TimerSource {
    tag: String,
    name: String,
    source_num: u8,
    /// Marks per second.
    frequency: u32,
}

impl TimerSource {
    pub fn from_section(section: &IniSection, defaults: &LoggerConfig) -> Result<TimerSource> {
        let source_num = super::resolve_source_num(section, message::SOURCE_TIMER)?;
        let name = match section.get("name") {
            Some(name) => name.to_string(),
            // The default clock gets a fixed name; secondary timers use
            // their section tag
            None if source_num == message::SOURCE_TIMER => "Internal".to_string(),
            None => section.name.clone(),
        };
        let frequency = match section.get_parsed::<u32>("frequency")? {
            Some(0) => {
                return Err(crate::error::Error::Config(
                    crate::config::ConfigError::BadValue {
                        section: section.name.clone(),
                        key: "frequency".into(),
                        reason: "must be positive and non-zero".into(),
                    },
                ))
            }
            Some(f) => f,
            None => defaults.frequency,
        };
        Ok(TimerSource { tag: section.name.clone(), name, source_num, frequency })
    }

    /// The default internal timer, used when no timer section is present.
    pub fn internal(defaults: &LoggerConfig) -> TimerSource {
        TimerSource {
            tag: "Timer".to_string(),
            name: "Internal".to_string(),
            source_num: message::SOURCE_TIMER,
            frequency: defaults.frequency,
        }
    }
}

impl Source for TimerSource {
    fn kind(&self) -> &'static str {
        "Timer"
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn startup(&mut self) -> Result<()> {
        Ok(())
    }

    fn descriptor(&self) -> Option<Descriptor> {
        Some(Descriptor::new(
            self.source_num,
            &self.name,
            5,
            &[(CHAN_EPOCH, "Epoch")],
        ))
    }

    fn logging(&mut self, ctx: &SourceContext) -> Result<()> {
        let incr_ns = 1_000_000_000u64 / self.frequency as u64;
        let mut last_epoch: i64 = 0;

        while !signals::shutdown_requested() {
            let now_ns = clock::monotonic_ns();
            ctx.push(Message::new_timestamp(
                self.source_num,
                message::CHAN_TSTAMP,
                clock::monotonic_ms(),
            ))?;

            let epoch = clock::epoch();
            if epoch != last_epoch {
                ctx.push(Message::new_timestamp(self.source_num, CHAN_EPOCH, epoch as u32))?;
                last_epoch = epoch;
            }

            // Align the next deadline to the tick grid
            let mut next = now_ns + incr_ns;
            next -= next % incr_ns;
            let after = clock::monotonic_ns();
            if next <= after {
                log::warn!("[Timer:{}] Deadline missed", self.tag);
                continue;
            }
            std::thread::sleep(std::time::Duration::from_nanos(next - after));
        }
        Ok(())
    }

    fn shutdown(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IniConfig;
    use crate::message::DataValue;
    use crate::queue::MessageQueue;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    fn run_briefly(mut src: TimerSource, millis: u64) -> Vec<Message> {
        let _guard = crate::signals::TEST_FLAG_LOCK.lock().unwrap();
        let queue = Arc::new(MessageQueue::new());
        queue.init();
        let ctx = SourceContext {
            queue: Arc::clone(&queue),
            descriptor: Arc::new(Mutex::new(None)),
            tag: src.tag().to_string(),
        };
        crate::signals::SHUTDOWN.store(false, Ordering::Release);
        let handle = std::thread::spawn(move || {
            let _ = src.logging(&ctx);
        });
        std::thread::sleep(std::time::Duration::from_millis(millis));
        crate::signals::SHUTDOWN.store(true, Ordering::Release);
        handle.join().unwrap();
        crate::signals::SHUTDOWN.store(false, Ordering::Release);
        let mut out = Vec::new();
        while let Some(m) = queue.pop() {
            out.push(m);
        }
        out
    }

    #[test]
    fn ticks_are_monotonic_and_paced() {
        let cfg = LoggerConfig::default();
        let ini = IniConfig::parse_str("[Tick]\ntype = timer\nfrequency = 50\n").unwrap();
        let src = TimerSource::from_section(ini.get_section("Tick").unwrap(), &cfg).unwrap();
        let msgs = run_briefly(src, 250);

        let ticks: Vec<u32> = msgs
            .iter()
            .filter(|m| m.channel == message::CHAN_TSTAMP)
            .filter_map(|m| match m.value {
                DataValue::Timestamp(t) => Some(t),
                _ => None,
            })
            .collect();
        // 250 ms at 50 Hz: allow generous scheduling slack
        assert!(ticks.len() >= 5, "expected ticks, got {}", ticks.len());
        assert!(ticks.windows(2).all(|w| w[0] <= w[1]), "ticks regressed");

        // Epoch marks move by exactly one second at a time
        let epochs: Vec<u32> = msgs
            .iter()
            .filter(|m| m.channel == CHAN_EPOCH)
            .filter_map(|m| match m.value {
                DataValue::Timestamp(t) => Some(t),
                _ => None,
            })
            .collect();
        assert!(!epochs.is_empty());
        assert!(epochs.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn default_timer_naming() {
        let cfg = LoggerConfig::default();
        let ini = IniConfig::parse_str("[Clock]\ntype = timer\n").unwrap();
        let src = TimerSource::from_section(ini.get_section("Clock").unwrap(), &cfg).unwrap();
        let desc = src.descriptor().unwrap();
        assert_eq!(desc.name, "Internal");
        assert_eq!(desc.source_id, message::SOURCE_TIMER);
        assert_eq!(desc.channels.get(4).unwrap().as_bytes(), b"Epoch");

        let ini = IniConfig::parse_str("[Clock2]\ntype = timer\nsourcenum = 3\n").unwrap();
        let src = TimerSource::from_section(ini.get_section("Clock2").unwrap(), &cfg).unwrap();
        let desc = src.descriptor().unwrap();
        assert_eq!(desc.name, "Clock2");
        assert_eq!(desc.source_id, message::SOURCE_TIMER + 3);
    }
}
