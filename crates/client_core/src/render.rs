use std::fmt;

use shared::chat_line::ChatLine;

const RIGHT_INDENT: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub side: Side,
    /// Sender header, present only on the first of consecutive lines from someone else.
    pub sender: Option<String>,
    pub text: String,
    pub clock: String,
}

impl fmt::Display for RenderedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.side {
            Side::Left => {
                if let Some(sender) = &self.sender {
                    writeln!(f, "{sender}")?;
                }
                write!(f, "  {}", self.text)?;
            }
            Side::Right => write!(f, "{:indent$}{}", "", self.text, indent = RIGHT_INDENT)?,
        }
        if !self.clock.is_empty() {
            write!(f, "  {}", self.clock)?;
        }
        Ok(())
    }
}

/// Turns raw chat lines into display messages, grouping consecutive lines by sender.
#[derive(Debug, Default)]
pub struct ChatView {
    username: Option<String>,
    last_sender: Option<String>,
}

impl ChatView {
    pub fn new(username: Option<String>) -> Self {
        Self {
            username,
            last_sender: None,
        }
    }

    pub fn set_username(&mut self, username: Option<String>) {
        self.username = username;
    }

    pub fn reset(&mut self) {
        self.last_sender = None;
    }

    pub fn render(&mut self, raw: &str) -> RenderedMessage {
        let line = ChatLine::parse(raw);
        let is_me = self.username.as_deref() == Some(line.sender.as_str());
        let show_sender = !is_me && self.last_sender.as_deref() != Some(line.sender.as_str());
        let clock = line.clock().to_string();
        self.last_sender = Some(line.sender.clone());

        RenderedMessage {
            side: if is_me { Side::Right } else { Side::Left },
            sender: show_sender.then_some(line.sender),
            text: line.text,
            clock,
        }
    }
}
