//! On-disk key/value store holding the login session between runs.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use shared::domain::SessionToken;

use crate::error::ClientError;

const TOKEN_KEY: &str = "token";
const USERNAME_KEY: &str = "username";
const EMAIL_KEY: &str = "email";
const PROFILE_PIC_PREFIX: &str = "profile_pic_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: SessionToken,
    pub username: Option<String>,
    pub email: String,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    path: Option<PathBuf>,
    entries: BTreeMap<String, String>,
}

impl SessionStore {
    /// Opens the store at `path`; a missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("corrupt session file '{}'", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read session file '{}'", path.display()))
            }
        };
        Ok(Self {
            path: Some(path),
            entries,
        })
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chat-client")
            .join("session.json")
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get_item(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set_item(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        self.persist()
    }

    pub fn remove_item(&mut self, key: &str) -> Result<()> {
        if self.entries.remove(key).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    /// The stored session, or `NotAuthenticated` when the token or email is missing.
    pub fn authenticated(&self) -> Result<Session, ClientError> {
        let token = self.non_empty(TOKEN_KEY);
        let email = self.non_empty(EMAIL_KEY);
        match (token, email) {
            (Some(token), Some(email)) => Ok(Session {
                token: SessionToken(token.to_string()),
                username: self.non_empty(USERNAME_KEY).map(str::to_string),
                email: email.to_string(),
            }),
            _ => Err(ClientError::NotAuthenticated),
        }
    }

    pub fn save_login(
        &mut self,
        token: &str,
        username: &str,
        email: &str,
        profile_pic: Option<&str>,
    ) -> Result<()> {
        self.entries.insert(TOKEN_KEY.into(), token.into());
        self.entries.insert(USERNAME_KEY.into(), username.into());
        self.entries.insert(EMAIL_KEY.into(), email.into());
        if let Some(url) = profile_pic {
            self.entries.insert(profile_pic_key(email), url.into());
        }
        self.persist()
    }

    pub fn profile_pic(&self, email: &str) -> Option<&str> {
        self.get_item(&profile_pic_key(email))
    }

    pub fn set_profile_pic(&mut self, email: &str, url: &str) -> Result<()> {
        self.set_item(&profile_pic_key(email), url)
    }

    /// Forgets the session but keeps cached profile pictures.
    pub fn clear_session(&mut self) -> Result<()> {
        self.entries.remove(TOKEN_KEY);
        self.entries.remove(USERNAME_KEY);
        self.entries.remove(EMAIL_KEY);
        self.persist()
    }

    fn non_empty(&self, key: &str) -> Option<&str> {
        self.get_item(key).filter(|value| !value.is_empty())
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create session directory '{}'", parent.display())
            })?;
        }
        let raw = serde_json::to_string_pretty(&self.entries)?;
        fs::write(path, raw)
            .with_context(|| format!("failed to write session file '{}'", path.display()))
    }
}

fn profile_pic_key(email: &str) -> String {
    format!("{PROFILE_PIC_PREFIX}{email}")
}
