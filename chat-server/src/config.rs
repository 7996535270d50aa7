use std::{
    collections::HashSet,
    fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    message::{ChatId, DEFAULT_MAX_FRAME_BYTES, UserId},
};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_LISTEN: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserEntry {
    pub id: UserId,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatEntry {
    pub id: ChatId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub participants: Vec<UserId>,
}

/// Server configuration file. Every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub max_connections: usize,
    pub write_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub max_frame_bytes: usize,
    pub users: Vec<UserEntry>,
    pub chats: Vec<ChatEntry>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let settings = ServerSettings::default();
        Self {
            listen: DEFAULT_LISTEN,
            max_connections: settings.max_connections,
            write_timeout_ms: duration_ms(settings.write_timeout),
            shutdown_grace_ms: duration_ms(settings.shutdown_grace),
            max_frame_bytes: settings.max_frame_bytes,
            users: Vec::new(),
            chats: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ServerConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_frame_bytes must be at least 1".into(),
            ));
        }

        let mut user_ids = HashSet::new();
        for user in &self.users {
            if user.id <= 0 {
                return Err(ConfigError::Invalid(format!(
                    "user id {} must be positive",
                    user.id
                )));
            }
            if !user_ids.insert(user.id) {
                return Err(ConfigError::Invalid(format!("duplicate user id {}", user.id)));
            }
        }

        let mut chat_ids = HashSet::new();
        for chat in &self.chats {
            if !chat_ids.insert(chat.id) {
                return Err(ConfigError::Invalid(format!("duplicate chat id {}", chat.id)));
            }
        }
        Ok(())
    }

    pub fn settings(&self) -> ServerSettings {
        ServerSettings {
            max_connections: self.max_connections,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

/// Runtime limits applied by the server and its sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    pub max_connections: usize,
    /// Bound on a single delivery; expiry disconnects the recipient.
    pub write_timeout: Duration,
    /// How long `stop` waits for sessions to wind down.
    pub shutdown_grace: Duration,
    pub max_frame_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_connections: 100,
            write_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
