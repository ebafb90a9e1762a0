use std::{fmt, str::FromStr, sync::LazyLock};

use regex::Regex;
use thiserror::Error;

/// Brightness the hub attaches to every color unless configured otherwise.
pub const DEFAULT_BRIGHTNESS: f64 = 0.1;

// Three decimal components of at most three digits, optionally wrapped in one pair of quotes.
static UPDATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:"(\d{1,3}),(\d{1,3}),(\d{1,3})"|(\d{1,3}),(\d{1,3}),(\d{1,3}))$"#)
        .expect("update pattern is a valid regex")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("malformed color update: {0:?}")]
    MalformedMessage(String),
    #[error("malformed color snapshot: {0:?}")]
    MalformedSnapshot(String),
}

/// An RGB triple requested by a client, before the hub attaches brightness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorUpdate {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl ColorUpdate {
    pub fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    /// Parses a client update such as `10,20,30` or `"10,20,30"`.
    ///
    /// Anything else, including components above 255, is rejected.
    pub fn parse(raw: &str) -> Result<Self, WireError> {
        let malformed = || WireError::MalformedMessage(raw.to_string());
        let captures = UPDATE_PATTERN.captures(raw.trim()).ok_or_else(malformed)?;

        let mut components = captures
            .iter()
            .skip(1)
            .flatten()
            .map(|group| group.as_str().parse::<u8>());

        let mut next = || {
            components
                .next()
                .and_then(|component| component.ok())
                .ok_or_else(malformed)
        };

        Ok(Self {
            red: next()?,
            green: next()?,
            blue: next()?,
        })
    }

    /// Wire form used by clients when requesting a change.
    pub fn encode(&self) -> String {
        format!("{},{},{}", self.red, self.green, self.blue)
    }
}

impl FromStr for ColorUpdate {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// The single shared value synchronized by the hub.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorState {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub brightness: f64,
}

impl ColorState {
    pub fn new(red: u8, green: u8, blue: u8, brightness: f64) -> Self {
        Self {
            red,
            green,
            blue,
            brightness,
        }
    }

    pub fn from_update(update: ColorUpdate, brightness: f64) -> Self {
        Self::new(update.red, update.green, update.blue, brightness)
    }

    /// Snapshot text sent by the hub, e.g. `"10,20,30,0.1"` including the quotes.
    pub fn encode(&self) -> String {
        format!(
            "\"{},{},{},{}\"",
            self.red, self.green, self.blue, self.brightness
        )
    }

    /// Decodes a hub snapshot the way the LED firmware does: strip quotes,
    /// split on commas, clamp every component into range.
    pub fn decode(text: &str) -> Result<Self, WireError> {
        let malformed = || WireError::MalformedSnapshot(text.to_string());
        let stripped = text.trim().replace('"', "");
        let fields: Vec<&str> = stripped.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            return Err(malformed());
        }

        let channel = |field: &str| -> Result<u8, WireError> {
            let value: i64 = field.parse().map_err(|_| malformed())?;
            Ok(value.clamp(0, 255) as u8)
        };
        let brightness: f64 = fields[3].parse().map_err(|_| malformed())?;
        if brightness.is_nan() {
            return Err(malformed());
        }

        Ok(Self {
            red: channel(fields[0])?,
            green: channel(fields[1])?,
            blue: channel(fields[2])?,
            brightness: brightness.clamp(0.0, 1.0),
        })
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.red, self.green, self.blue)
    }
}

impl Default for ColorState {
    fn default() -> Self {
        Self::new(255, 255, 255, DEFAULT_BRIGHTNESS)
    }
}

impl fmt::Display for ColorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{} brightness={} ({})",
            self.red,
            self.green,
            self.blue,
            self.brightness,
            self.to_hex()
        )
    }
}
