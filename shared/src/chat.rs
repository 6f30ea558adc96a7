//! Typed events recognised in the host's chat broadcast.
//!
//! The host reports connects, disconnects and kills as plain chat text. Each
//! pattern is tried in order and must match the whole line, punctuation included.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const CONNECT_SUFFIX: &str = " has connected.";
const DISCONNECT_SUFFIX: &str = " has disconnected.";
const KILL_VERB: &str = " killed ";
const KILL_WITH: &str = ") with ";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    Connect {
        name: String,
    },
    Disconnect {
        name: String,
    },
    Kill {
        killer: String,
        aircraft: String,
        target: String,
        weapon: String,
    },
}

/// Body of a chat broadcast: who said it and what was said.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPayload {
    pub player_id: String,
    pub text: String,
}

impl ChatPayload {
    /// Extracts the payload from a message's `msg` field. The player identifier
    /// may arrive as `steamid` or `id`, as a string or a number.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let text = object.get("msg")?.as_str()?.to_string();
        let player_id = ["steamid", "id"]
            .iter()
            .filter_map(|key| object.get(*key))
            .find_map(|id| match id {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })?;

        Some(Self { player_id, text })
    }
}

type Matcher = fn(&str) -> Option<TelemetryEvent>;

const MATCHERS: [Matcher; 3] = [match_connect, match_disconnect, match_kill];

/// Runs the matchers in order; the first hit wins.
pub fn parse_chat_line(line: &str) -> Option<TelemetryEvent> {
    MATCHERS.iter().find_map(|matcher| matcher(line))
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn match_connect(line: &str) -> Option<TelemetryEvent> {
    let name = non_empty(line.strip_suffix(CONNECT_SUFFIX)?)?;
    Some(TelemetryEvent::Connect { name })
}

fn match_disconnect(line: &str) -> Option<TelemetryEvent> {
    let name = non_empty(line.strip_suffix(DISCONNECT_SUFFIX)?)?;
    Some(TelemetryEvent::Disconnect { name })
}

// <killer> killed <aircraft> (<target>) with <weapon>.
fn match_kill(line: &str) -> Option<TelemetryEvent> {
    let body = line.strip_suffix('.')?;
    let (killer, rest) = body.split_once(KILL_VERB)?;
    let (victim, weapon) = rest.rsplit_once(KILL_WITH)?;
    let (aircraft, target) = victim.split_once(" (")?;

    Some(TelemetryEvent::Kill {
        killer: non_empty(killer)?,
        aircraft: non_empty(aircraft)?,
        target: non_empty(target)?,
        weapon: non_empty(weapon)?,
    })
}
