use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub mod chat;
pub mod rating;

pub use chat::{parse_chat_line, ChatPayload, TelemetryEvent};
pub use rating::{RatingCategory, RatingTable, RATING_CEILING};

pub const DEFAULT_PORT: u16 = 23232;

pub const TAG_HOST_CONFIG: &str = "HostConfig";
pub const TAG_LOBBY_READY: &str = "LobbyReady";
pub const TAG_SAVE_COMPLETE: &str = "SaveComplete";
pub const TAG_FLIGHT_LOG: &str = "GetFlightLog";
pub const TAG_CHAT: &str = "ChatMessage";

/// Leading byte-order marker some hosts prepend to the first line of a stream.
pub const BOM: char = '\u{feff}';

/// One decoded inbound line. `src` is the correlation tag.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InboundMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub msg: Value,
}

impl InboundMessage {
    pub fn tagged(src: &str, msg: Value) -> Self {
        Self {
            src: Some(src.to_string()),
            kind: None,
            msg,
        }
    }

    /// Parses a line as a JSON object. Scalars and arrays are rejected so
    /// they end up on the general inbox as raw text.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn tag(&self) -> Option<&str> {
        self.src.as_deref()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tag() == Some(tag)
    }
}

/// Outbound control commands understood by the dedicated server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetHostName(String),
    /// `None` clears the password and makes the lobby public.
    SetHostPassword(Option<String>),
    SetHostUnitIcon(bool),
    SetHostCampaign(String),
    SetHostMission(String),
    CheckHost,
    Config,
    Host,
    Restart,
    Start,
    Skip,
    FlightLog,
    SendLog(String),
    Raw(String),
}

impl Command {
    /// Inverse of `Display`. Unknown lines come back as `Raw`.
    pub fn parse(line: &str) -> Command {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("sethost ") {
            let (key, value) = match rest.split_once(' ') {
                Some((key, value)) => (key, Some(value.to_string())),
                None => (rest, None),
            };
            return match (key, value) {
                ("name", Some(v)) => Command::SetHostName(v),
                ("password", v) => Command::SetHostPassword(v),
                ("uniticon", Some(v)) if v == "true" || v == "false" => {
                    Command::SetHostUnitIcon(v == "true")
                }
                ("campaign", Some(v)) => Command::SetHostCampaign(v),
                ("mission", Some(v)) => Command::SetHostMission(v),
                _ => Command::Raw(line.to_string()),
            };
        }
        if let Some(text) = line.strip_prefix("sendlog ") {
            return Command::SendLog(text.to_string());
        }
        match line {
            "checkhost" => Command::CheckHost,
            "config" => Command::Config,
            "host" => Command::Host,
            "restart" => Command::Restart,
            "start" => Command::Start,
            "skip" => Command::Skip,
            "flightlog" => Command::FlightLog,
            other => Command::Raw(other.to_string()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetHostName(name) => write!(f, "sethost name {}", name),
            Command::SetHostPassword(Some(pw)) => write!(f, "sethost password {}", pw),
            Command::SetHostPassword(None) => write!(f, "sethost password"),
            Command::SetHostUnitIcon(on) => write!(f, "sethost uniticon {}", on),
            Command::SetHostCampaign(id) => write!(f, "sethost campaign {}", id),
            Command::SetHostMission(name) => write!(f, "sethost mission {}", name),
            Command::CheckHost => write!(f, "checkhost"),
            Command::Config => write!(f, "config"),
            Command::Host => write!(f, "host"),
            Command::Restart => write!(f, "restart"),
            Command::Start => write!(f, "start"),
            Command::Skip => write!(f, "skip"),
            Command::FlightLog => write!(f, "flightlog"),
            Command::SendLog(text) => write!(f, "sendlog {}", text),
            Command::Raw(line) => write!(f, "{}", line),
        }
    }
}
