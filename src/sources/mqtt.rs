//! MQTT subscription source.
//!
//! Topics are declared with the repeatable `topic` key as
//! `topic:name[:text]`; the first topic is assigned channel 4, the second
//! channel 5 and so on. Payloads are parsed as floats unless the topic is
//! marked as text. With `dumpall` set, unmatched messages are logged as
//! `topic: payload` strings on the raw channel.
//!
//! For Victron systems the broker stops publishing unless a keepalive is
//! sent periodically; `victron_keepalives = yes` together with `sysid`
//! enables that behaviour.

use std::time::{Duration, Instant};

use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS};

use crate::config::{ConfigError, IniSection, LoggerConfig};
use crate::error::{Error, Result};
use crate::message::{self, Message};
use crate::signals;

use super::{Descriptor, Source, SourceContext};

/// First channel assigned to configured topics.
pub const CHAN_TOPIC_BASE: u8 = 0x04;

#[derive(Clone, Debug, PartialEq, Eq)]
struct TopicMap {
    topic: String,
    name: String,
    /// Log payloads as strings rather than parsing floats.
    text: bool,
}

pub struct MqttSource {
    tag: String,
    name: String,
    source_num: u8,
    host: String,
    port: u16,
    topics: Vec<TopicMap>,
    dump_all: bool,
    victron_keepalives: bool,
    sysid: Option<String>,
    keepalive_interval: u64,
    conn: Option<(Client, Connection)>,
}

impl MqttSource {
    pub fn from_section(section: &IniSection, defaults: &LoggerConfig) -> Result<MqttSource> {
        let mut topics = Vec::new();
        for value in section.get_all("topic") {
            let parts: Vec<&str> = value.split(':').collect();
            if parts.len() < 2 || parts.len() > 3 {
                return Err(Error::Config(ConfigError::BadValue {
                    section: section.name.clone(),
                    key: "topic".into(),
                    reason: format!("{value:?} is not topic:name[:text]"),
                }));
            }
            let text = match parts.get(2) {
                None => false,
                Some(t) => crate::config::parse_bool(t).unwrap_or(true),
            };
            topics.push(TopicMap {
                topic: parts[0].to_string(),
                name: parts[1].to_string(),
                text,
            });
        }
        if topics.is_empty() {
            return Err(Error::Config(ConfigError::MissingKey {
                section: section.name.clone(),
                key: "topic".into(),
            }));
        }
        if CHAN_TOPIC_BASE as usize + topics.len() > message::ID_MAX as usize {
            return Err(Error::Config(ConfigError::BadValue {
                section: section.name.clone(),
                key: "topic".into(),
                reason: "too many topics for the channel ID space".into(),
            }));
        }

        let victron_keepalives = section.get_bool("victron_keepalives")?.unwrap_or(false);
        let sysid = section.get("sysid").map(|s| s.to_string());
        if victron_keepalives && sysid.is_none() {
            return Err(Error::Config(ConfigError::MissingKey {
                section: section.name.clone(),
                key: "sysid".into(),
            }));
        }

        Ok(MqttSource {
            tag: section.name.clone(),
            name: super::source_name(section),
            source_num: super::resolve_source_num(section, message::SOURCE_EXT)?,
            host: section.require("host").map_err(Error::Config)?.to_string(),
            port: section.get_parsed::<u16>("port")?.unwrap_or(1883),
            topics,
            dump_all: section.get_bool("dumpall")?.unwrap_or(defaults.dump_all),
            victron_keepalives,
            sysid,
            keepalive_interval: section.get_parsed::<u64>("keepalive_interval")?.unwrap_or(30),
            conn: None,
        })
    }

    fn channel_for(&self, topic: &str) -> Option<(u8, bool)> {
        self.topics.iter().enumerate().find_map(|(ix, map)| {
            let matches = topic
                .get(..map.topic.len())
                .map(|head| head.eq_ignore_ascii_case(&map.topic))
                .unwrap_or(false);
            if matches {
                Some((CHAN_TOPIC_BASE + ix as u8, map.text))
            } else {
                None
            }
        })
    }

    fn send_keepalive(&self, client: &Client) -> Result<()> {
        let sysid = self.sysid.as_deref().unwrap_or_default();
        client
            .publish(
                format!("R/{sysid}/keepalive"),
                QoS::AtMostOnce,
                false,
                Vec::<u8>::new(),
            )
            .map_err(|e| Error::Mqtt(e.to_string()))
    }
}

impl Source for MqttSource {
    fn kind(&self) -> &'static str {
        "MQTT"
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn startup(&mut self) -> Result<()> {
        let mut opts = MqttOptions::new(format!("tidelog-{}", self.tag), &self.host, self.port);
        opts.set_keep_alive(Duration::from_secs(30));
        let (client, connection) = Client::new(opts, 64);
        for map in &self.topics {
            client
                .subscribe(map.topic.clone(), QoS::AtMostOnce)
                .map_err(|e| Error::Mqtt(format!("subscribe {}: {e}", map.topic)))?;
        }
        self.conn = Some((client, connection));
        log::info!("[MQTT:{}] Connected", self.tag);
        Ok(())
    }

    fn descriptor(&self) -> Option<Descriptor> {
        let extra: Vec<(u8, &str)> = std::iter::once((message::CHAN_RAW, "-"))
            .chain(
                self.topics
                    .iter()
                    .enumerate()
                    .map(|(ix, map)| (CHAN_TOPIC_BASE + ix as u8, map.name.as_str())),
            )
            .collect();
        Some(Descriptor::new(
            self.source_num,
            &self.name,
            CHAN_TOPIC_BASE as usize + self.topics.len(),
            &extra,
        ))
    }

    fn logging(&mut self, ctx: &SourceContext) -> Result<()> {
        let (client, mut connection) = self
            .conn
            .take()
            .ok_or_else(|| Error::source_err("MQTT logging started without a connection"))?;

        let mut last_keepalive = Instant::now()
            .checked_sub(Duration::from_secs(self.keepalive_interval))
            .unwrap_or_else(Instant::now);
        let mut last_message = Instant::now();

        while !signals::shutdown_requested() {
            if self.victron_keepalives
                && last_keepalive.elapsed().as_secs() >= self.keepalive_interval
            {
                last_keepalive = Instant::now();
                if let Err(e) = self.send_keepalive(&client) {
                    log::warn!("[MQTT:{}] Error sending keepalive message: {e}", self.tag);
                }
            }
            if last_message.elapsed().as_secs() > 180 {
                log::warn!(
                    "[MQTT:{}] More than 3 minutes since last message",
                    self.tag
                );
                last_message = Instant::now();
            }

            let event = match connection.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(event)) => event,
                Ok(Err(e)) => {
                    log::warn!("[MQTT:{}] Connection error: {e}", self.tag);
                    std::thread::sleep(Duration::from_millis(500));
                    continue;
                }
                Err(_) => continue, // poll timeout
            };

            if let Event::Incoming(Packet::Publish(publish)) = event {
                last_message = Instant::now();
                let payload = String::from_utf8_lossy(&publish.payload);
                match self.channel_for(&publish.topic) {
                    Some((channel, true)) => {
                        ctx.push(Message::new_string(self.source_num, channel, &payload))?;
                    }
                    Some((channel, false)) => {
                        let value = payload.trim().parse::<f32>().unwrap_or(f32::NAN);
                        ctx.push(Message::new_float(self.source_num, channel, value))?;
                    }
                    None if self.dump_all => {
                        let raw = format!("{}: {payload}", publish.topic);
                        ctx.push(Message::new_string(
                            self.source_num,
                            message::CHAN_RAW,
                            &raw,
                        ))?;
                    }
                    None => {}
                }
            }
        }
        self.conn = Some((client, connection));
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some((client, _)) = self.conn.take() {
            let _ = client.disconnect();
        }
    }
}
