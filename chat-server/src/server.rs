use std::{
    collections::BTreeSet,
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch},
    task::JoinSet,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ServerSettings,
    error::{BindError, ServerError},
    message::{UserId, WireMessage, encode_frame, write_message},
    registry::Registry,
    services::{PersistenceSink, Services},
    session::{Session, SessionId},
};

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(100);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Per-call delivery counts returned by [`ServerHandle::route`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouteReport {
    pub delivered: usize,
    /// Recipients with no authenticated session. Not an error.
    pub offline: usize,
    pub failed: usize,
}

pub struct Server {
    listener: TcpListener,
    handle: ServerHandle,
}

impl Server {
    pub async fn bind(
        addr: SocketAddr,
        services: Services,
        settings: ServerSettings,
    ) -> Result<Self, BindError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BindError { addr, source })?;
        Ok(Self::new(listener, services, settings))
    }

    pub fn new(listener: TcpListener, services: Services, settings: ServerSettings) -> Self {
        Self {
            listener,
            handle: ServerHandle::new(services, settings),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Accepts connections until [`ServerHandle::stop`] is called or the
    /// listener fails. Every session is closed before this returns.
    pub async fn run(self) -> Result<(), ServerError> {
        let Server { listener, handle } = self;
        let mut stop = handle.subscribe_shutdown();
        let mut sessions = JoinSet::new();
        let mut backoff = ACCEPT_BACKOFF_START;

        let result = loop {
            select! {
                biased;
                _ = signalled(&mut stop) => break Ok(()),
                accept_result = listener.accept() => match accept_result {
                    Ok((stream, peer)) => {
                        backoff = ACCEPT_BACKOFF_START;
                        handle.spawn_session(stream, peer, &mut sessions);
                    }
                    Err(err) if is_transient_accept_error(&err) => {
                        warn!(error = %err, delay = ?backoff, "accept failed; retrying");
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    }
                    Err(err) => {
                        error!(error = %err, "listener failed");
                        break Err(ServerError::Listener(err));
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = %err, "session task ended abnormally");
                    }
                }
            }
        };

        drop(listener);
        handle.stop();
        drain_sessions(&mut sessions, handle.settings().shutdown_grace).await;
        info!("server stopped");
        result
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.handle();
        let trigger = tokio::spawn(async move {
            shutdown.await;
            handle.stop();
        });
        let result = self.run().await;
        trigger.abort();
        result
    }

    pub async fn run_until_ctrl_c(self) -> Result<(), ServerError> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Binds `addr` and serves until `shutdown` resolves. Every session is
/// closed before this returns.
pub async fn start<F>(
    addr: SocketAddr,
    services: Services,
    settings: ServerSettings,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    Server::bind(addr, services, settings)
        .await?
        .run_until(shutdown)
        .await
}

/// Cloneable access to a running server's routing and presence API.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

struct Shared {
    registry: Registry,
    services: Services,
    settings: ServerSettings,
    shutdown: watch::Sender<bool>,
    connection_slots: Arc<Semaphore>,
    next_session_id: AtomicU64,
    persist_queue: OnceLock<mpsc::UnboundedSender<WireMessage>>,
}

impl ServerHandle {
    pub fn new(services: Services, settings: ServerSettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                registry: Registry::new(),
                services,
                settings,
                shutdown,
                connection_slots: Arc::new(Semaphore::new(settings.max_connections)),
                next_session_id: AtomicU64::new(1),
                persist_queue: OnceLock::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.shared.settings
    }

    pub(crate) fn services(&self) -> &Services {
        &self.shared.services
    }

    /// Delivers `message` to every online recipient. Offline recipients are
    /// skipped; a failed write closes only that recipient's session.
    pub async fn route<I>(&self, message: &WireMessage, recipients: I) -> RouteReport
    where
        I: IntoIterator<Item = UserId>,
    {
        let mut report = RouteReport::default();
        let frame = match encode_frame(message) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to encode message for routing");
                report.failed = recipients.into_iter().count();
                return report;
            }
        };

        for user_id in recipients {
            let Some(session) = self.shared.registry.lookup(user_id) else {
                report.offline += 1;
                continue;
            };
            match session.send_frame(&frame).await {
                Ok(true) => report.delivered += 1,
                Ok(false) => report.offline += 1,
                Err(err) => {
                    warn!(user_id, session = %session.id(), error = %err, "delivery failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.shared.registry.is_online(user_id)
    }

    pub fn online_user_ids(&self) -> BTreeSet<UserId> {
        self.shared.registry.online_user_ids()
    }

    /// Stops accepting and disconnects every registered session. Idempotent.
    pub fn stop(&self) {
        if self.shared.shutdown.send_replace(true) {
            return;
        }
        info!(online = self.shared.registry.len(), "server stopping");
        for session in self.shared.registry.drain() {
            session.disconnect();
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shared.shutdown.subscribe()
    }

    /// Queues `message` for the persistence sink without waiting for it.
    /// Messages reach the sink in the order they were queued.
    pub(crate) fn persist(&self, message: &WireMessage) {
        let queue = self
            .shared
            .persist_queue
            .get_or_init(|| spawn_persister(Arc::clone(&self.shared.services.persistence)));
        if queue.send(message.clone()).is_err() {
            warn!(
                sender_id = message.sender_id(),
                chat_id = message.chat_id(),
                "persistence worker is gone; dropping message"
            );
        }
    }

    fn next_session_id(&self) -> SessionId {
        SessionId(self.shared.next_session_id.fetch_add(1, Ordering::Relaxed))
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr, sessions: &mut JoinSet<()>) {
        let permit = match Arc::clone(&self.shared.connection_slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(peer = %peer, "connection limit reached; rejecting");
                sessions.spawn(reject_connection(stream, self.shared.settings.write_timeout));
                return;
            }
        };

        let id = self.next_session_id();
        let (reader, writer) = stream.into_split();
        let session = Session::new(id, Some(peer), writer, self.shared.settings.write_timeout);
        let handle = self.clone();
        info!(peer = %peer, session = %id, "connection accepted");
        sessions.spawn(run_session(session, BufReader::new(reader), handle, permit));
    }
}

/// Drains the persistence queue one message at a time, in order. The worker
/// ends once every server handle is dropped.
fn spawn_persister(sink: Arc<dyn PersistenceSink>) -> mpsc::UnboundedSender<WireMessage> {
    let (queue, mut pending) = mpsc::unbounded_channel::<WireMessage>();
    tokio::spawn(async move {
        while let Some(message) = pending.recv().await {
            let sink = Arc::clone(&sink);
            let (sender_id, chat_id) = (message.sender_id(), message.chat_id());
            match tokio::task::spawn_blocking(move || sink.store(&message)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(sender_id, chat_id, error = %err, "failed to persist message"),
                Err(err) => warn!(sender_id, chat_id, error = %err, "persistence task panicked"),
            }
        }
        debug!("persistence worker stopped");
    });
    queue
}

async fn run_session(
    session: Arc<Session>,
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    handle: ServerHandle,
    _permit: OwnedSemaphorePermit,
) {
    session.run(reader, handle).await;
}

async fn reject_connection(mut stream: TcpStream, write_timeout: Duration) {
    let notice = WireMessage::notice("server full");
    let _ = timeout(write_timeout, async {
        if let Err(err) = write_message(&mut stream, &notice).await {
            debug!(error = %err, "failed to notify rejected peer");
        }
        let _ = stream.shutdown().await;
    })
    .await;
}

async fn drain_sessions(sessions: &mut JoinSet<()>, grace: Duration) {
    let drained = timeout(grace, async {
        while let Some(joined) = sessions.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "session task ended abnormally");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(remaining = sessions.len(), "sessions did not finish in time; aborting");
        sessions.abort_all();
    }
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    // ENFILE / EMFILE: descriptors free up as connections close.
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || matches!(err.raw_os_error(), Some(23 | 24))
}

/// Resolves once the flag is set, or once its sender is gone.
pub(crate) async fn signalled(flag: &mut watch::Receiver<bool>) {
    loop {
        let set = *flag.borrow_and_update();
        if set || flag.changed().await.is_err() {
            return;
        }
    }
}
