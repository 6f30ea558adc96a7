//! Flight-log retrieval and cleanup.

use crate::error::{DirectorError, Result};
use crate::network::Client;
use log::{info, warn};
use serde_json::Value;
use shared::Command;
use std::time::Duration;

/// A missing or garbled reply is retried once.
pub const FETCH_ATTEMPTS: u32 = 2;

/// Keys that may hold the line list when the host wraps it in an object.
const LINE_KEYS: [&str; 2] = ["log", "lines"];

#[derive(Debug, Clone, PartialEq)]
enum Shape {
    Text,
    List,
    Object(Value),
}

/// Decoded flight log. `lines` is what gets de-duplicated; `render` produces
/// the text that is written to disk and persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct FlightLog {
    pub lines: Vec<String>,
    shape: Shape,
}

impl FlightLog {
    pub fn from_payload(payload: &Value) -> Result<Self> {
        match payload {
            Value::String(text) => Ok(Self {
                lines: text.lines().map(str::to_string).collect(),
                shape: Shape::Text,
            }),
            Value::Array(items) => Ok(Self {
                lines: items.iter().map(line_of).collect(),
                shape: Shape::List,
            }),
            Value::Object(map) => {
                let lines = LINE_KEYS
                    .iter()
                    .find_map(|key| map.get(*key).and_then(Value::as_array))
                    .map(|items| items.iter().map(line_of).collect())
                    .unwrap_or_default();
                Ok(Self {
                    lines,
                    shape: Shape::Object(payload.clone()),
                })
            }
            Value::Null => Err(DirectorError::Parse("flight log reply has no payload".into())),
            other => Err(DirectorError::Parse(format!(
                "unexpected flight log payload: {}",
                other
            ))),
        }
    }

    /// Drops adjacent duplicate lines in place and returns how many went.
    pub fn dedup(&mut self) -> usize {
        let before = self.lines.len();
        self.lines = dedup_adjacent(&self.lines);
        before - self.lines.len()
    }

    /// Lists are pretty-printed JSON, text is written as-is, objects are
    /// pretty-printed with their line list replaced by the cleaned lines.
    pub fn render(&self) -> String {
        match &self.shape {
            Shape::Text => self.lines.join("\n"),
            Shape::List => serde_json::to_string_pretty(&self.lines).unwrap_or_default(),
            Shape::Object(original) => {
                let mut object = original.clone();
                if let Some(map) = object.as_object_mut() {
                    if let Some(key) = LINE_KEYS.iter().find(|key| map.contains_key(**key)) {
                        map.insert(key.to_string(), Value::from(self.lines.clone()));
                    }
                }
                serde_json::to_string_pretty(&object).unwrap_or_default()
            }
        }
    }
}

fn line_of(item: &Value) -> String {
    match item {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn dedup_adjacent(lines: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    for line in lines {
        if out.last() != Some(line) {
            out.push(line.clone());
        }
    }
    out
}

/// Requests the flight log, retrying once on a timed-out or undecodable
/// reply. The returned log is already de-duplicated.
pub async fn fetch(client: &Client, tag: &str, timeout: Duration) -> Result<FlightLog> {
    let mut last_error = None;

    for attempt in 1..=FETCH_ATTEMPTS {
        let outcome = client
            .send_and_wait(&Command::FlightLog, &[tag], timeout, 0)
            .await
            .and_then(|reply| FlightLog::from_payload(&reply.msg));

        match outcome {
            Ok(mut log) => {
                let removed = log.dedup();
                info!(
                    "Flight log received: {} line(s), {} duplicate(s) removed",
                    log.lines.len(),
                    removed
                );
                return Ok(log);
            }
            Err(DirectorError::Disconnected) => return Err(DirectorError::Disconnected),
            Err(e) => {
                warn!("Flight log attempt {}/{} failed: {}", attempt, FETCH_ATTEMPTS, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| DirectorError::Parse("no flight log".into())))
}
