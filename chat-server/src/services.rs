//! Collaborators the server consumes but does not own: identity, chat
//! membership, and message persistence. The in-memory implementations back
//! the binary and the tests.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, PoisonError},
};

use tracing::{debug, info};

use crate::{
    config::ServerConfig,
    error::{AuthError, StoreError},
    message::{ChatId, UserId, WireMessage},
};

/// What a client presents when identifying itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: UserId,
    pub secret: String,
}

pub trait IdentityProvider: Send + Sync {
    fn authenticate(&self, credentials: &Credentials) -> Result<UserId, AuthError>;
}

pub trait MembershipResolver: Send + Sync {
    fn participants(&self, chat_id: ChatId) -> Result<BTreeSet<UserId>, StoreError>;
}

/// Durable storage for inbound messages. Called off the routing path; a
/// failure is logged and never retried.
pub trait PersistenceSink: Send + Sync {
    fn store(&self, message: &WireMessage) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct Services {
    pub identity: Arc<dyn IdentityProvider>,
    pub membership: Arc<dyn MembershipResolver>,
    pub persistence: Arc<dyn PersistenceSink>,
}

impl Services {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        membership: Arc<dyn MembershipResolver>,
        persistence: Arc<dyn PersistenceSink>,
    ) -> Self {
        Self {
            identity,
            membership,
            persistence,
        }
    }
}

/// Users and chats held in memory.
///
/// With no users configured the directory runs in open mode and accepts any
/// positive user id with any secret.
#[derive(Debug, Default, Clone)]
pub struct Directory {
    secrets: HashMap<UserId, String>,
    chats: HashMap<ChatId, BTreeSet<UserId>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        let directory = config
            .users
            .iter()
            .fold(Self::new(), |directory, user| {
                directory.with_user(user.id, user.secret.clone())
            });
        let directory = config.chats.iter().fold(directory, |directory, chat| {
            directory.with_chat(chat.id, chat.participants.iter().copied())
        });
        info!(
            users = directory.secrets.len(),
            chats = directory.chats.len(),
            "directory loaded"
        );
        directory
    }

    pub fn with_user(mut self, user_id: UserId, secret: impl Into<String>) -> Self {
        self.secrets.insert(user_id, secret.into());
        self
    }

    pub fn with_chat(
        mut self,
        chat_id: ChatId,
        participants: impl IntoIterator<Item = UserId>,
    ) -> Self {
        self.chats.insert(chat_id, participants.into_iter().collect());
        self
    }

    pub fn is_open(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl IdentityProvider for Directory {
    fn authenticate(&self, credentials: &Credentials) -> Result<UserId, AuthError> {
        let user_id = credentials.user_id;
        if user_id <= 0 {
            return Err(AuthError::Denied(format!("invalid user id {user_id}")));
        }
        if self.is_open() {
            return Ok(user_id);
        }
        match self.secrets.get(&user_id) {
            Some(secret) if *secret == credentials.secret => Ok(user_id),
            Some(_) => Err(AuthError::InvalidCredentials(user_id)),
            None => Err(AuthError::Denied(format!("unknown user {user_id}"))),
        }
    }
}

impl MembershipResolver for Directory {
    fn participants(&self, chat_id: ChatId) -> Result<BTreeSet<UserId>, StoreError> {
        self.chats
            .get(&chat_id)
            .cloned()
            .ok_or(StoreError::UnknownChat(chat_id))
    }
}

/// Keeps every stored message in memory, in the order `store` was called.
#[derive(Debug, Default)]
pub struct MessageLog {
    messages: Mutex<Vec<WireMessage>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<WireMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PersistenceSink for MessageLog {
    fn store(&self, message: &WireMessage) -> Result<(), StoreError> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }
}

/// Logs messages instead of storing them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl PersistenceSink for TracingSink {
    fn store(&self, message: &WireMessage) -> Result<(), StoreError> {
        debug!(
            sender_id = message.sender_id(),
            chat_id = message.chat_id(),
            kind = ?message.kind(),
            "message received"
        );
        Ok(())
    }
}
