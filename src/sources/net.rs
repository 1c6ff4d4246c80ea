//! Generic TCP byte stream source.
//!
//! Bytes are collected into a window bounded by `minbytes`/`maxbytes` and
//! logged as raw chunks. No interpretation is attempted. The link is
//! considered dead and reconnected when nothing has been read for the
//! configured timeout.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::config::{IniSection, LoggerConfig};
use crate::error::{Error, Result};
use crate::message::{self, Message};
use crate::signals;

use super::{Descriptor, Source, SourceContext};

/// Connect to `host:port` and switch the socket to non-blocking reads.
pub fn net_connect(host: &str, port: u16) -> Result<TcpStream> {
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::source_err(format!("unable to resolve {host}: {e}")))?
        .collect();
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, Duration::from_secs(10)) {
            Ok(stream) => {
                stream.set_nonblocking(true).map_err(Error::Io)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) => Error::Io(e),
        None => Error::source_err(format!("no addresses found for {host}")),
    })
}

pub struct NetSource {
    tag: String,
    name: String,
    source_num: u8,
    host: String,
    port: u16,
    min_bytes: usize,
    max_bytes: usize,
    /// Idle seconds before the connection is re-established.
    timeout: u64,
    handle: Option<TcpStream>,
}

impl NetSource {
    pub fn from_section(section: &IniSection, _defaults: &LoggerConfig) -> Result<NetSource> {
        let min_bytes = section.get_parsed::<usize>("minbytes")?.unwrap_or(10);
        let max_bytes = section.get_parsed::<usize>("maxbytes")?.unwrap_or(1024);
        if min_bytes == 0 || max_bytes < min_bytes {
            return Err(Error::Config(crate::config::ConfigError::BadValue {
                section: section.name.clone(),
                key: "minbytes".into(),
                reason: format!("window {min_bytes}..{max_bytes} is not usable"),
            }));
        }
        Ok(NetSource {
            tag: section.name.clone(),
            name: super::source_name(section),
            source_num: super::resolve_source_num(section, message::SOURCE_EXT)?,
            host: section.require("host").map_err(Error::Config)?.to_string(),
            port: section.get_parsed::<u16>("port")?.ok_or_else(|| {
                Error::Config(crate::config::ConfigError::MissingKey {
                    section: section.name.clone(),
                    key: "port".into(),
                })
            })?,
            min_bytes,
            max_bytes,
            timeout: section.get_parsed::<u64>("timeout")?.unwrap_or(60),
            handle: None,
        })
    }

    fn reconnect(&mut self) -> Result<()> {
        self.handle = None;
        self.handle = Some(net_connect(&self.host, self.port)?);
        Ok(())
    }
}

impl Source for NetSource {
    fn kind(&self) -> &'static str {
        "Network"
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn startup(&mut self) -> Result<()> {
        self.handle = Some(net_connect(&self.host, self.port)?);
        log::info!("[Network:{}] Connected", self.tag);
        Ok(())
    }

    fn descriptor(&self) -> Option<Descriptor> {
        Some(Descriptor::new(
            self.source_num,
            &self.name,
            4,
            &[(message::CHAN_RAW, "Raw Data")],
        ))
    }

    fn logging(&mut self, ctx: &SourceContext) -> Result<()> {
        let mut buf = vec![0u8; self.max_bytes];
        let mut hw = 0usize;
        let mut last_read = Instant::now();

        while !signals::shutdown_requested() {
            if last_read.elapsed().as_secs() > self.timeout {
                log::warn!("[Network:{}] Network timeout, reconnecting", self.tag);
                self.reconnect()?;
                log::info!("[Network:{}] Reconnected", self.tag);
                last_read = Instant::now();
            }

            let handle = self
                .handle
                .as_mut()
                .ok_or_else(|| Error::source_err("network logging without a connection"))?;

            if hw < self.max_bytes {
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

            if hw < self.min_bytes {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }

            ctx.push(Message::new_bytes(self.source_num, message::CHAN_RAW, &buf[..hw]))?;
            hw = 0;
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
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    #[test]
    fn config_window_validation() {
        let cfg = LoggerConfig::default();
        let ini = IniConfig::parse_str(
            "[Feed]\ntype = net\nhost = localhost\nport = 9000\nminbytes = 100\nmaxbytes = 10\n",
        )
        .unwrap();
        assert!(NetSource::from_section(ini.get_section("Feed").unwrap(), &cfg).is_err());
    }

    #[test]
    fn reads_chunks_from_listener() {
        let _guard = crate::signals::TEST_FLAG_LOCK.lock().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut client, _) = listener.accept().unwrap();
            client.write_all(b"twelve bytes").unwrap();
            std::thread::sleep(Duration::from_millis(300));
        });

        let cfg = LoggerConfig::default();
        let ini = IniConfig::parse_str(&format!(
            "[Feed]\ntype = net\nhost = 127.0.0.1\nport = {port}\nminbytes = 4\nmaxbytes = 64\n"
        ))
        .unwrap();
        let mut src = NetSource::from_section(ini.get_section("Feed").unwrap(), &cfg).unwrap();
        src.startup().unwrap();

        let queue = Arc::new(crate::queue::MessageQueue::new());
        queue.init();
        let ctx = SourceContext {
            queue: Arc::clone(&queue),
            descriptor: Arc::new(Mutex::new(None)),
            tag: "Feed".into(),
        };
        crate::signals::SHUTDOWN.store(false, Ordering::Release);
        let worker = std::thread::spawn(move || {
            let _ = src.logging(&ctx);
            src.shutdown();
        });
        std::thread::sleep(Duration::from_millis(200));
        crate::signals::SHUTDOWN.store(true, Ordering::Release);
        worker.join().unwrap();
        crate::signals::SHUTDOWN.store(false, Ordering::Release);
        server.join().unwrap();

        let msg = queue.pop().expect("a raw chunk should have been logged");
        assert_eq!(msg.channel, message::CHAN_RAW);
        match msg.value {
            crate::message::DataValue::Bytes(b) => {
                assert_eq!(&b[..], b"twelve bytes")
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
