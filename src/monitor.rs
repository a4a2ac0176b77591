//! Rendering of inbound messages for `brokerlink listen`

use crate::transport::mqtt::{InboundMessage, QoS};
use serde_json::Value;
use std::fmt::Write;

/// Output formatting options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Color-coded, human-readable with timestamps (default)
    #[default]
    Pretty,
    /// Single line per message, minimal formatting
    Compact,
    /// One JSON object per line for programmatic processing
    Json,
}

const RESET: &str = "\x1b[0m";
const TOPIC_COLOR: &str = "\x1b[1;36m";
const RETAIN_COLOR: &str = "\x1b[1;33m";
const KEY_COLOR: &str = "\x1b[94m";
const STRING_COLOR: &str = "\x1b[92m";
const NUMBER_COLOR: &str = "\x1b[93m";
const BOOL_COLOR: &str = "\x1b[95m";
const NULL_COLOR: &str = "\x1b[90m";

/// Payload as JSON when it parses, otherwise as (lossy) text
fn payload_value(message: &InboundMessage) -> Value {
    serde_json::from_slice(&message.payload).unwrap_or_else(|_| {
        Value::String(String::from_utf8_lossy(&message.payload).into_owned())
    })
}

fn qos_level(message: &InboundMessage) -> u8 {
    match message.qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

/// Render one message in the requested format
pub fn format_message(message: &InboundMessage, format: OutputFormat) -> String {
    let timestamp = message.received_at.format("%H:%M:%S%.3f");

    match format {
        OutputFormat::Json => serde_json::json!({
            "timestamp": message.received_at.to_rfc3339(),
            "topic": message.topic,
            "qos": qos_level(message),
            "retain": message.retain,
            "payload": payload_value(message),
        })
        .to_string(),
        OutputFormat::Compact => {
            let text = String::from_utf8_lossy(&message.payload);
            format!(
                "{timestamp} {} q{}{} {}",
                message.topic,
                qos_level(message),
                if message.retain { " R" } else { "" },
                text.replace('\n', " ").trim()
            )
        }
        OutputFormat::Pretty => {
            let body = match serde_json::from_slice::<Value>(&message.payload) {
                Ok(json) => {
                    let mut out = String::new();
                    highlight_json(&json, 0, &mut out);
                    out
                }
                Err(_) => String::from_utf8_lossy(&message.payload).into_owned(),
            };
            let retained = if message.retain {
                format!(" {RETAIN_COLOR}[retained]{RESET}")
            } else {
                String::new()
            };
            format!(
                "{TOPIC_COLOR}{}{RESET} {timestamp} qos={}{retained}\n{body}",
                message.topic,
                qos_level(message)
            )
        }
    }
}

/// Indented, ANSI-colored rendering of a JSON value
pub fn highlight_json(value: &Value, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth + 1);
    let closing = "  ".repeat(depth);

    match value {
        Value::Null => {
            let _ = write!(out, "{NULL_COLOR}null{RESET}");
        }
        Value::Bool(b) => {
            let _ = write!(out, "{BOOL_COLOR}{b}{RESET}");
        }
        Value::Number(n) => {
            let _ = write!(out, "{NUMBER_COLOR}{n}{RESET}");
        }
        Value::String(s) => {
            let _ = write!(out, "{STRING_COLOR}{}{RESET}", Value::String(s.clone()));
        }
        Value::Array(items) if items.is_empty() => out.push_str("[]"),
        Value::Array(items) => {
            out.push_str("[\n");
            for (i, item) in items.iter().enumerate() {
                out.push_str(&indent);
                highlight_json(item, depth + 1, out);
                out.push_str(if i + 1 < items.len() { ",\n" } else { "\n" });
            }
            let _ = write!(out, "{closing}]");
        }
        Value::Object(fields) if fields.is_empty() => out.push_str("{}"),
        Value::Object(fields) => {
            out.push_str("{\n");
            for (i, (key, item)) in fields.iter().enumerate() {
                let _ = write!(out, "{indent}{KEY_COLOR}{}{RESET}: ", Value::String(key.clone()));
                highlight_json(item, depth + 1, out);
                out.push_str(if i + 1 < fields.len() { ",\n" } else { "\n" });
            }
            let _ = write!(out, "{closing}}}");
        }
    }
}
