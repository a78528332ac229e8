use serde::{Deserialize, Serialize};

use crate::chat_line::format_line;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub user_name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub message: String,
    pub token: String,
    pub user_name: String,
    pub email: String,
    #[serde(default)]
    pub profile_pic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

/// Plain acknowledgement body, e.g. `{"message": "User registered successfully"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    pub message: String,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilePicResponse {
    #[serde(default)]
    pub profile_pic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub user_name: String,
    pub message: String,
    pub timestamp: String,
}

impl HistoryEntry {
    /// Renders the entry in the same form live messages arrive in.
    pub fn to_line(&self) -> String {
        format_line(&self.timestamp, &self.user_name, &self.message)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub history: Option<bool>,
}
