//! The `[timestamp] user: message` line carried by every socket frame.

use chrono::{DateTime, Utc};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn format_line(timestamp: &str, user_name: &str, message: &str) -> String {
    format!("[{timestamp}] {user_name}: {message}")
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatLine {
    pub timestamp: String,
    pub sender: String,
    pub text: String,
}

impl ChatLine {
    pub fn parse(raw: &str) -> Self {
        let (timestamp, body) = match bracket_span(raw) {
            Some((open, close)) => {
                let timestamp = raw[open + 1..close].to_string();
                let rest = raw[close + 1..].trim_start();
                (timestamp, format!("{}{}", &raw[..open], rest))
            }
            None => (String::new(), raw.to_string()),
        };

        let (sender, text) = match body.split_once(':') {
            Some((sender, text)) => (sender.to_string(), text.trim().to_string()),
            None => (body, String::new()),
        };

        Self {
            timestamp,
            sender,
            text,
        }
    }

    /// Time of day portion of the timestamp (`HH:MM:SS`), empty when absent.
    pub fn clock(&self) -> &str {
        self.timestamp.split(' ').nth(1).unwrap_or_default()
    }
}

// First `[` followed by the nearest `]`, both on the same line.
fn bracket_span(raw: &str) -> Option<(usize, usize)> {
    let mut search_from = 0;
    while let Some(offset) = raw[search_from..].find('[') {
        let open = search_from + offset;
        let tail = &raw[open + 1..];
        let line_end = tail.find('\n').unwrap_or(tail.len());
        if let Some(close) = tail[..line_end].find(']') {
            return Some((open, open + 1 + close));
        }
        search_from = open + 1;
    }
    None
}
