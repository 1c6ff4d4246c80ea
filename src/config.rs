//! Configuration file handling.
//!
//! The daemon is configured from a sectioned INI-style file. The unnamed
//! top level section holds global options (output prefix, timer frequency,
//! verbosities) and each named section configures one source. Keys may be
//! repeated within a section (used for I²C sensor and MQTT topic
//! descriptors) and section/key lookups are case insensitive.
//!
//! ```ini
//! prefix = /data/mooring
//! frequency = 10
//!
//! [GPS1]
//! type = gps
//! port = /dev/ttyUSB0
//! initialbaud = 9600
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("syntax error at line {line}: {text:?}")]
    Syntax { line: usize, text: String },
    #[error("[{section}] missing required key '{key}'")]
    MissingKey { section: String, key: String },
    #[error("[{section}] invalid value for '{key}': {reason}")]
    BadValue { section: String, key: String, reason: String },
    #[error("[{section}] unknown source type '{value}'")]
    UnknownType { section: String, value: String },
}

/// One `key = value` entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IniEntry {
    pub key: String,
    pub value: String,
}

/// A named section and its entries, in file order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IniSection {
    pub name: String,
    pub entries: Vec<IniEntry>,
}

impl IniSection {
    /// First value for `key`, case insensitive.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.key.eq_ignore_ascii_case(key))
            .map(|e| e.value.as_str())
    }

    /// All values for `key`, in file order.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.key.eq_ignore_ascii_case(key))
            .map(|e| e.value.as_str())
            .collect()
    }

    /// Parse the first value for `key` with `FromStr`.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T::Err: fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|e| ConfigError::BadValue {
                section: self.name.clone(),
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Parse the first value for `key` as a boolean.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => parse_bool(raw).map(Some).ok_or_else(|| ConfigError::BadValue {
                section: self.name.clone(),
                key: key.to_string(),
                reason: format!("{raw:?} is not a boolean"),
            }),
        }
    }

    /// Value of `key`, or a `MissingKey` error naming it.
    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::MissingKey {
            section: self.name.clone(),
            key: key.to_string(),
        })
    }
}

/// A parsed configuration file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IniConfig {
    /// Section 0 is the unnamed top level section.
    pub sections: Vec<IniSection>,
}

impl IniConfig {
    pub fn parse_str(input: &str) -> Result<IniConfig, ConfigError> {
        let mut config = IniConfig {
            sections: vec![IniSection { name: String::new(), entries: Vec::new() }],
        };
        let mut current = 0usize;

        for (lineno, raw_line) in input.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or_else(|| ConfigError::Syntax {
                    line: lineno + 1,
                    text: raw_line.to_string(),
                })?;
                let name = name.trim().to_string();
                current = match config
                    .sections
                    .iter()
                    .position(|s| s.name.eq_ignore_ascii_case(&name))
                {
                    Some(ix) => ix,
                    None => {
                        config.sections.push(IniSection { name, entries: Vec::new() });
                        config.sections.len() - 1
                    }
                };
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Syntax {
                line: lineno + 1,
                text: raw_line.to_string(),
            })?;
            config.sections[current].entries.push(IniEntry {
                key: key.trim().to_string(),
                value: unquote(value.trim()).to_string(),
            });
        }
        Ok(config)
    }

    pub fn parse_file(path: &Path) -> Result<IniConfig, ConfigError> {
        Self::parse_str(&std::fs::read_to_string(path)?)
    }

    /// The unnamed top level section.
    pub fn global(&self) -> &IniSection {
        &self.sections[0]
    }

    pub fn get_section(&self, name: &str) -> Option<&IniSection> {
        self.sections.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// Named sections, in file order.
    pub fn source_sections(&self) -> impl Iterator<Item = &IniSection> {
        self.sections.iter().filter(|s| !s.name.is_empty())
    }

    /// Render back into INI form, suitable for reuse as a configuration
    /// file. Used for the high-verbosity configuration echo.
    pub fn to_ini_string(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            if !section.name.is_empty() {
                out.push_str(&format!("[{}]\n", section.name));
            }
            for entry in &section.entries {
                out.push_str(&format!("{} = {}\n", entry.key, entry.value));
            }
            out.push('\n');
        }
        out
    }
}

/// Strip one pair of matching single or double quotes, if present.
pub fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Lenient boolean parsing: `1/Y/y/T/t` true, `0/N/n/F/f` false.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.as_bytes().first()? {
        b'1' | b'Y' | b'y' | b'T' | b't' => Some(true),
        b'0' | b'N' | b'n' | b'F' | b'f' => Some(false),
        _ => None,
    }
}

/// Source families selectable with the `type` key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Gps,
    Nmea,
    Dw,
    N2k,
    Lpms,
    I2c,
    Mp,
    Net,
    Serial,
    Timer,
    Mqtt,
}

impl FromStr for SourceKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gps" | "ubx" => Ok(SourceKind::Gps),
            "nmea" => Ok(SourceKind::Nmea),
            "dw" => Ok(SourceKind::Dw),
            "n2k" => Ok(SourceKind::N2k),
            "lpms" => Ok(SourceKind::Lpms),
            "i2c" => Ok(SourceKind::I2c),
            "mp" => Ok(SourceKind::Mp),
            "net" | "tcp" => Ok(SourceKind::Net),
            "serial" => Ok(SourceKind::Serial),
            "timer" | "tick" => Ok(SourceKind::Timer),
            "mqtt" => Ok(SourceKind::Mqtt),
            _ => Err(()),
        }
    }
}

/// Global daemon options from the top level section.
#[derive(Clone, Debug, PartialEq)]
pub struct LoggerConfig {
    /// Output path prefix; the date stamp and serial are appended.
    pub prefix: String,
    /// Timer mark frequency, Hz.
    pub frequency: u32,
    pub console_verbosity: u8,
    pub file_verbosity: u8,
    /// Emit raw messages even where a decoded form exists, for every
    /// source that honours the flag.
    pub dump_all: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            prefix: "./".to_string(),
            frequency: 10,
            console_verbosity: 0,
            file_verbosity: 1,
            dump_all: false,
        }
    }
}

impl LoggerConfig {
    pub fn from_ini(ini: &IniConfig) -> Result<LoggerConfig, ConfigError> {
        let g = ini.global();
        let mut cfg = LoggerConfig::default();
        if let Some(prefix) = g.get("prefix") {
            cfg.prefix = prefix.to_string();
        }
        if let Some(freq) = g.get_parsed::<u32>("frequency")? {
            if freq == 0 {
                return Err(ConfigError::BadValue {
                    section: String::new(),
                    key: "frequency".into(),
                    reason: "must be positive and non-zero".into(),
                });
            }
            cfg.frequency = freq;
        }
        if let Some(v) = g.get_parsed::<u8>("verbose")? {
            cfg.console_verbosity = v;
        }
        if let Some(v) = g.get_parsed::<u8>("logverbose")? {
            cfg.file_verbosity = v;
        }
        if let Some(v) = g.get_bool("dumpall")? {
            cfg.dump_all = v;
        }
        Ok(cfg)
    }
}
