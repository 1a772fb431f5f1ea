//! Play extraction and persistence.
//!
//! A play is a short numeric code posted in chat. Each author holds at most
//! one play; a newer one replaces the older.

mod store;

pub use store::{JsonFilePlayStore, MemoryPlayStore, PlayStore, RecordOutcome};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};
use crate::protocol::Message;

/// A standalone 2 to 6 digit code, optionally prefixed with `#`
pub const DEFAULT_PLAY_PATTERN: &str = r"(?:^|\s)#?(\d{2,6})\b";

/// A code extracted from a chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Play {
    pub room_id: String,
    pub message_id: String,
    pub username: String,
    pub user_address: String,
    pub code: String,
    pub text: String,
    pub recorded_at: DateTime<Utc>,
}

impl Play {
    /// Identity used for replace-by-author: the address when known, the
    /// display name otherwise
    pub fn author_key(&self) -> String {
        if self.user_address.trim().is_empty() {
            format!("name:{}", self.username)
        } else {
            format!("addr:{}", self.user_address.to_lowercase())
        }
    }
}

/// Compiled extraction pattern
#[derive(Debug, Clone)]
pub struct PlayPattern {
    regex: Regex,
}

impl PlayPattern {
    /// Compile a pattern. The first capture group, when present, is the code;
    /// otherwise the whole match is.
    pub fn new(pattern: &str) -> RelayResult<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| RelayError::config_invalid("plays.pattern", e))?;
        Ok(Self { regex })
    }

    /// First code found in `text`
    pub fn find_code(&self, text: &str) -> Option<String> {
        let captures = self.regex.captures(text)?;
        let code = captures.get(1).or_else(|| captures.get(0))?;
        let code = code.as_str().trim().trim_start_matches('#');
        (!code.is_empty()).then(|| code.to_string())
    }

    /// Build a play from a chat message when its text carries a code
    pub fn extract(&self, message: &Message) -> Option<Play> {
        let code = self.find_code(&message.message)?;
        Some(Play {
            room_id: message.room_id.clone(),
            message_id: message.id.clone(),
            username: message.username.clone(),
            user_address: message.user_address.clone(),
            code,
            text: message.message.clone(),
            recorded_at: Utc::now(),
        })
    }
}

impl Default for PlayPattern {
    fn default() -> Self {
        Self {
            regex: Regex::new(DEFAULT_PLAY_PATTERN).expect("default play pattern is valid"),
        }
    }
}
