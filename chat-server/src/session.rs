//! Server side of one client connection.
//!
//! A session moves `Connecting -> Authenticated -> Closing -> Closed` and
//! never leaves `Closed`. The task running [`Session::run`] owns the read
//! half of the stream; the write half sits behind an async mutex so that
//! other sessions can deliver to it while the read loop is blocked.

use std::{
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    time::Duration,
};

use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt},
    select,
    sync::{self, watch},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    error::{ConnectionError, FrameError},
    message::{MessageKind, UserId, WireMessage, encode_frame, read_message, write_frame},
    registry::{Registration, Registry},
    server::{ServerHandle, signalled},
    services::Credentials,
};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Closing,
    Closed,
}

/// Commands carried in the content of `SYSTEM` messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemCommand {
    Login { secret: String },
    Ping,
    Online,
    Logout,
    Other(String),
}

impl SystemCommand {
    pub fn parse(content: &str) -> Self {
        let content = content.trim();
        let (verb, rest) = content.split_once(' ').unwrap_or((content, ""));
        match verb.to_ascii_lowercase().as_str() {
            "login" => SystemCommand::Login {
                secret: rest.trim().to_string(),
            },
            "ping" => SystemCommand::Ping,
            "online" => SystemCommand::Online,
            "logout" => SystemCommand::Logout,
            _ => SystemCommand::Other(content.to_string()),
        }
    }

    /// The identification request a client sends while connecting.
    pub fn login_message(user_id: UserId, secret: &str) -> WireMessage {
        WireMessage::new(user_id, 0, format!("login {secret}"), MessageKind::System)
    }
}

pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    user_id: OnceLock<UserId>,
    state: Mutex<SessionState>,
    writer: sync::Mutex<Option<BoxedWriter>>,
    closed: watch::Sender<bool>,
    registration: Mutex<Option<Registration>>,
    write_timeout: Duration,
}

impl Session {
    pub fn new<W>(
        id: SessionId,
        peer: Option<SocketAddr>,
        writer: W,
        write_timeout: Duration,
    ) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id,
            peer,
            user_id: OnceLock::new(),
            state: Mutex::new(SessionState::Connecting),
            writer: sync::Mutex::new(Some(Box::new(writer))),
            closed,
            registration: Mutex::new(None),
            write_timeout,
        })
    }

    #[cfg(test)]
    pub(crate) fn detached(id: SessionId) -> Arc<Self> {
        Self::new(id, None, tokio::io::sink(), Duration::from_secs(1))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id.get().copied()
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    /// True once the session has started closing.
    pub fn is_closed(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Closing | SessionState::Closed
        )
    }

    /// Reads and dispatches frames until the peer goes away, the session is
    /// disconnected, or the server stops. The registry entry, if any, is
    /// released on every exit path, including the future being dropped.
    pub async fn run<R>(self: Arc<Self>, mut reader: R, server: ServerHandle)
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut closed = self.closed.subscribe();
        let mut shutdown = server.subscribe_shutdown();
        let max_frame_bytes = server.settings().max_frame_bytes;

        loop {
            select! {
                biased;
                _ = signalled(&mut closed) => break,
                _ = signalled(&mut shutdown) => break,
                frame = read_message(&mut reader, max_frame_bytes) => {
                    if !self.handle_frame(frame, &server).await {
                        break;
                    }
                }
            }
        }

        self.finish().await;
    }

    /// Encodes and delivers `message` to this peer. Does nothing unless the
    /// session is authenticated.
    pub async fn send(&self, message: &WireMessage) -> Result<(), ConnectionError> {
        let frame = encode_frame(message).map_err(ConnectionError::Encode)?;
        self.send_frame(&frame).await.map(|_| ())
    }

    /// Returns `Ok(false)` when the frame was skipped because the session is
    /// not authenticated.
    pub(crate) async fn send_frame(&self, frame: &[u8]) -> Result<bool, ConnectionError> {
        if !self.is_authenticated() {
            debug!(session = %self.id, state = ?self.state(), "skipping delivery");
            return Ok(false);
        }
        self.write(frame).await?;
        Ok(true)
    }

    /// Moves the session to `Closing`, wakes the read loop, and drops the
    /// registry entry. Safe to call repeatedly and from any task.
    pub fn disconnect(&self) {
        {
            let mut state = self.lock_state();
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }

        debug!(session = %self.id, user_id = ?self.user_id(), "disconnect requested");
        self.closed.send_replace(true);
        drop(self.lock_registration().take());
    }

    /// `Connecting -> Authenticated`. Fails if the session is in any other state.
    pub(crate) fn mark_authenticated(&self, user_id: UserId) -> bool {
        let mut state = self.lock_state();
        if *state != SessionState::Connecting || self.user_id.set(user_id).is_err() {
            return false;
        }
        *state = SessionState::Authenticated;
        true
    }

    fn register_with(self: &Arc<Self>, registry: &Registry, user_id: UserId) {
        registry.register(user_id, Arc::clone(self));

        let mut registration = self.lock_registration();
        let entry = Registration::new(registry.clone(), user_id, self.id);
        if self.is_closed() {
            // Disconnected while registering; dropping the entry releases it.
            drop(entry);
        } else {
            *registration = Some(entry);
        }
    }

    async fn handle_frame(
        self: &Arc<Self>,
        frame: Result<Option<WireMessage>, FrameError>,
        server: &ServerHandle,
    ) -> bool {
        match frame {
            Ok(Some(message)) => {
                self.dispatch(message, server).await;
                !self.is_closed()
            }
            Ok(None) => {
                debug!(session = %self.id, "peer closed the stream");
                false
            }
            Err(err) if err.is_fatal() => {
                warn!(session = %self.id, error = %err, "closing session after framing error");
                false
            }
            Err(err) => {
                warn!(session = %self.id, error = %err, "dropping undecodable frame");
                true
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, message: WireMessage, server: &ServerHandle) {
        match self.state() {
            SessionState::Connecting => self.identify(message, server).await,
            SessionState::Authenticated => match message.kind() {
                MessageKind::Text | MessageKind::Image | MessageKind::File => {
                    self.forward(message, server).await
                }
                MessageKind::System => self.handle_system(message, server).await,
            },
            SessionState::Closing | SessionState::Closed => {}
        }
    }

    async fn identify(self: &Arc<Self>, message: WireMessage, server: &ServerHandle) {
        let secret = match (message.kind(), SystemCommand::parse(message.content())) {
            (MessageKind::System, SystemCommand::Login { secret }) => secret,
            _ => {
                debug!(session = %self.id, kind = ?message.kind(), "message before identification");
                self.reply(WireMessage::notice("not authenticated")).await;
                return;
            }
        };

        let credentials = Credentials {
            user_id: message.sender_id(),
            secret,
        };
        match server.services().identity.authenticate(&credentials) {
            Ok(user_id) => {
                if !self.mark_authenticated(user_id) {
                    return;
                }
                info!(session = %self.id, peer = ?self.peer, user_id, "session authenticated");
                self.acknowledge(user_id, server.registry()).await;
            }
            Err(err) => {
                warn!(session = %self.id, error = %err, "identification failed");
                self.reply(WireMessage::notice(format!("authentication failed: {err}")))
                    .await;
                if err.disconnects() {
                    self.disconnect();
                }
            }
        }
    }

    async fn forward(&self, message: WireMessage, server: &ServerHandle) {
        let Some(user_id) = self.user_id() else {
            return;
        };
        if message.sender_id() != user_id {
            debug!(user_id, claimed = message.sender_id(), "replacing claimed sender id");
        }
        let message = message.with_sender(user_id);
        let chat_id = message.chat_id();

        let participants = match server.services().membership.participants(chat_id) {
            Ok(participants) => participants,
            Err(err) => {
                warn!(user_id, chat_id, error = %err, "cannot resolve chat participants");
                self.reply(WireMessage::notice(format!("cannot deliver to chat {chat_id}")))
                    .await;
                return;
            }
        };
        if !participants.contains(&user_id) {
            self.reply(WireMessage::notice(format!("not a member of chat {chat_id}")))
                .await;
            return;
        }

        server.persist(&message);
        let report = server
            .route(&message, participants.iter().copied())
            .await;
        debug!(
            user_id,
            chat_id,
            delivered = report.delivered,
            offline = report.offline,
            failed = report.failed,
            "message routed"
        );
    }

    async fn handle_system(&self, message: WireMessage, server: &ServerHandle) {
        match SystemCommand::parse(message.content()) {
            SystemCommand::Ping => self.reply(WireMessage::notice("pong")).await,
            SystemCommand::Online => {
                let online = server
                    .online_user_ids()
                    .into_iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                self.reply(WireMessage::notice(format!("online {online}")))
                    .await;
            }
            SystemCommand::Logout => {
                info!(session = %self.id, user_id = ?self.user_id(), "logout requested");
                self.disconnect();
            }
            SystemCommand::Login { .. } => {
                self.reply(WireMessage::notice("already authenticated"))
                    .await
            }
            SystemCommand::Other(content) => {
                debug!(session = %self.id, %content, "ignoring system message");
            }
        }
    }

    /// Registers the session and writes the acknowledgement while holding the
    /// writer, so routed messages cannot reach the peer before it.
    async fn acknowledge(self: &Arc<Self>, user_id: UserId, registry: &Registry) {
        let ack = match encode_frame(&WireMessage::notice(format!("authenticated as {user_id}"))) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(session = %self.id, error = %err, "failed to encode acknowledgement");
                self.disconnect();
                return;
            }
        };

        let mut writer = self.writer.lock().await;
        self.register_with(registry, user_id);
        let result = self.write_to(&mut writer, &ack).await;
        drop(writer);

        if let Err(err) = result {
            debug!(session = %self.id, error = %err, "failed to acknowledge identification");
            self.disconnect();
        }
    }

    /// Writes a notice to this peer regardless of authentication.
    async fn reply(&self, message: WireMessage) {
        let frame = match encode_frame(&message) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(session = %self.id, error = %err, "failed to encode reply");
                return;
            }
        };
        if let Err(err) = self.write(&frame).await {
            debug!(session = %self.id, error = %err, "failed to reply to peer");
        }
    }

    async fn write(&self, frame: &[u8]) -> Result<(), ConnectionError> {
        let mut writer = self.writer.lock().await;
        let result = self.write_to(&mut writer, frame).await;
        drop(writer);

        if result.is_err() {
            self.disconnect();
        }
        result
    }

    async fn write_to(
        &self,
        writer: &mut Option<BoxedWriter>,
        frame: &[u8],
    ) -> Result<(), ConnectionError> {
        let Some(stream) = writer.as_mut() else {
            return Ok(());
        };
        match timeout(self.write_timeout, write_frame(stream, frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ConnectionError::Write(err)),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }

    async fn finish(&self) {
        self.disconnect();

        if let Some(mut stream) = self.writer.lock().await.take() {
            match timeout(self.write_timeout, stream.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(session = %self.id, error = %err, "shutdown failed"),
                Err(_) => debug!(session = %self.id, "shutdown timed out"),
            }
        }

        *self.lock_state() = SessionState::Closed;
        info!(session = %self.id, peer = ?self.peer, user_id = ?self.user_id(), "session closed");
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_registration(&self) -> MutexGuard<'_, Option<Registration>> {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, BufReader, duplex};

    use super::*;
    use crate::{
        config::ServerSettings,
        services::{Directory, MessageLog, Services},
    };

    fn server() -> ServerHandle {
        let directory = Arc::new(
            Directory::new()
                .with_user(1, "alpha")
                .with_user(2, "beta")
                .with_chat(10, [1, 2]),
        );
        let services = Services::new(directory.clone(), directory, Arc::new(MessageLog::new()));
        ServerHandle::new(services, ServerSettings::default())
    }

    async fn next_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> WireMessage {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(1), reader.read_line(&mut line))
            .await
            .expect("line in time")
            .expect("read line");
        WireMessage::decode(line.trim_end()).expect("decodable line")
    }

    #[test]
    fn parses_system_commands() {
        assert_eq!(
            SystemCommand::parse("login  s3cret "),
            SystemCommand::Login {
                secret: "s3cret".into()
            }
        );
        assert_eq!(SystemCommand::parse("PING"), SystemCommand::Ping);
        assert_eq!(SystemCommand::parse("online"), SystemCommand::Online);
        assert_eq!(SystemCommand::parse("logout"), SystemCommand::Logout);
        assert_eq!(
            SystemCommand::parse("typing"),
            SystemCommand::Other("typing".into())
        );
    }

    #[tokio::test]
    async fn send_is_a_no_op_until_authenticated() {
        let (writer, reader) = duplex(1024);
        let session = Session::new(SessionId(1), None, writer, Duration::from_secs(1));

        let message = WireMessage::text(2, 10, "hi");
        session.send(&message).await.expect("no-op send");
        assert!(session.mark_authenticated(1));
        session.send(&message).await.expect("delivered");

        let mut reader = BufReader::new(reader);
        assert_eq!(next_line(&mut reader).await, message);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_silences_send() {
        let session = Session::detached(SessionId(4));
        assert!(session.mark_authenticated(4));

        session.disconnect();
        session.disconnect();

        assert_eq!(session.state(), SessionState::Closing);
        assert!(!session.mark_authenticated(5));
        assert_eq!(session.user_id(), Some(4));
        let sent = session
            .send_frame(b"{}\n")
            .await
            .expect("closed send is not an error");
        assert!(!sent);
    }

    #[tokio::test]
    async fn disconnect_mid_run_unblocks_read_and_unregisters() {
        let server = server();
        let (server_side, client_side) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(server_side);
        let session = Session::new(SessionId(7), None, write_half, Duration::from_secs(1));
        let task = tokio::spawn(Arc::clone(&session).run(BufReader::new(read_half), server.clone()));

        let (client_read, mut client_write) = tokio::io::split(client_side);
        let mut client_read = BufReader::new(client_read);
        crate::message::write_message(&mut client_write, &SystemCommand::login_message(1, "alpha"))
            .await
            .expect("send login");
        let ack = next_line(&mut client_read).await;
        assert_eq!(ack.content(), "authenticated as 1");

        assert!(server.is_online(1));

        session.disconnect();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("run returns promptly")
            .expect("session task");

        assert_eq!(session.state(), SessionState::Closed);
        assert!(!server.is_online(1));
    }

    #[tokio::test]
    async fn stalled_recipient_is_reported_failed_and_unregistered() {
        let server = server();
        // Room for the ack, not for the routed message below.
        let (server_side, client_side) = duplex(256);
        let (read_half, write_half) = tokio::io::split(server_side);
        let session = Session::new(SessionId(9), None, write_half, Duration::from_millis(50));
        let task = tokio::spawn(Arc::clone(&session).run(BufReader::new(read_half), server.clone()));

        let (client_read, mut client_write) = tokio::io::split(client_side);
        let mut client_read = BufReader::new(client_read);
        crate::message::write_message(&mut client_write, &SystemCommand::login_message(2, "beta"))
            .await
            .expect("send login");
        assert_eq!(next_line(&mut client_read).await.content(), "authenticated as 2");
        assert!(server.is_online(2));

        let large = WireMessage::text(1, 10, "x".repeat(4096));
        let report = server.route(&large, [2]).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 0);

        assert!(session.is_closed());
        assert!(!server.is_online(2));
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("run returns after the failed write")
            .expect("session task");
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn messages_before_login_are_refused() {
        let server = server();
        let (server_side, client_side) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(server_side);
        let session = Session::new(SessionId(8), None, write_half, Duration::from_secs(1));
        let task = tokio::spawn(Arc::clone(&session).run(BufReader::new(read_half), server.clone()));

        let (client_read, mut client_write) = tokio::io::split(client_side);
        let mut client_read = BufReader::new(client_read);
        crate::message::write_message(&mut client_write, &WireMessage::text(1, 10, "early"))
            .await
            .expect("send text");
        assert_eq!(next_line(&mut client_read).await.content(), "not authenticated");

        crate::message::write_message(&mut client_write, &SystemCommand::login_message(1, "nope"))
            .await
            .expect("send bad login");
        let refused = next_line(&mut client_read).await;
        assert!(refused.content().starts_with("authentication failed"));
        assert_eq!(session.state(), SessionState::Connecting);

        drop(client_write);
        drop(client_read);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("run returns on eof")
            .expect("session task");
        assert_eq!(session.state(), SessionState::Closed);
    }
}
