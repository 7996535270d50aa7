use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
};

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    message::{
        ChatId, DEFAULT_MAX_FRAME_BYTES, MessageKind, SERVER_SENDER, UserId, WireMessage,
        read_message, write_message,
    },
    session::SystemCommand,
};

/// Client side of a connection.
///
/// Inbound messages are pushed, in arrival order, to the receiver returned
/// by [`ChatClient::connect`]. The receiver yields `None` once the
/// connection is gone.
pub struct ChatClient {
    writer: Mutex<Option<OwnedWriteHalf>>,
    listener: JoinHandle<()>,
    connected: Arc<AtomicBool>,
    user_id: AtomicI64,
}

impl ChatClient {
    pub async fn connect(
        addr: SocketAddr,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WireMessage>)> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        info!("connected to {}", addr);

        let (reader, writer) = stream.into_split();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let listener = tokio::spawn(listen(
            BufReader::new(reader),
            inbound_tx,
            Arc::clone(&connected),
        ));

        let client = Self {
            writer: Mutex::new(Some(writer)),
            listener,
            connected,
            user_id: AtomicI64::new(SERVER_SENDER),
        };
        Ok((client, inbound_rx))
    }

    /// Sends the identification request. The server answers with a notice.
    pub async fn identify(&self, user_id: UserId, secret: &str) -> Result<()> {
        self.user_id.store(user_id, Ordering::Relaxed);
        self.send_message(&SystemCommand::login_message(user_id, secret))
            .await
    }

    pub async fn send_message(&self, message: &WireMessage) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().context("not connected")?;
        write_message(stream, message)
            .await
            .context("failed to send message")?;
        debug!(chat_id = message.chat_id(), kind = ?message.kind(), "message sent");
        Ok(())
    }

    pub async fn send_text(&self, chat_id: ChatId, content: &str) -> Result<()> {
        let message = WireMessage::text(self.user_id.load(Ordering::Relaxed), chat_id, content);
        self.send_message(&message).await
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Closes the connection. Calling it again does nothing.
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(error) = writer.shutdown().await {
                warn!(?error, "failed to shutdown client writer cleanly");
            }
            info!("disconnected from server");
        }
        self.listener.abort();
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(
    mut reader: BufReader<OwnedReadHalf>,
    inbound: mpsc::UnboundedSender<WireMessage>,
    connected: Arc<AtomicBool>,
) {
    loop {
        match read_message(&mut reader, DEFAULT_MAX_FRAME_BYTES).await {
            Ok(Some(message)) => {
                if inbound.send(message).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("server closed the connection");
                break;
            }
            Err(err) if err.is_fatal() => {
                warn!(error = %err, "connection to server failed");
                break;
            }
            Err(err) => warn!(error = %err, "dropping malformed message from server"),
        }
    }
    connected.store(false, Ordering::Relaxed);
}

/// Terminal client: typed lines go to `args.chat`, inbound messages are
/// printed to stdout. `/quit` leaves.
pub async fn run(args: ClientArgs) -> Result<()> {
    let (client, mut inbound) = ChatClient::connect(args.server).await?;
    client.identify(args.user, &args.secret).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    loop {
        input.clear();
        select! {
            message = inbound.recv() => {
                match message {
                    Some(message) => write_stdout(&render(&message)).await?,
                    None => {
                        write_stdout("*** server closed the connection").await?;
                        break;
                    }
                }
            }
            bytes_read = stdin.read_line(&mut input) => {
                if !handle_stdin_input(bytes_read, &input, &client, args.chat).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    client.disconnect().await;
    Ok(())
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    client: &ChatClient,
    chat_id: ChatId,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    client.send_text(chat_id, text).await?;
    Ok(true)
}

pub fn render(message: &WireMessage) -> String {
    let sender = message.sender_id();
    let chat = message.chat_id();
    match message.kind() {
        MessageKind::System => format!("*** {}", message.content()),
        MessageKind::Text => format!("<{sender}@{chat}> {}", message.content()),
        MessageKind::Image => format!("<{sender}@{chat}> [image] {}", message.content()),
        MessageKind::File => format!("<{sender}@{chat}> [file] {}", message.content()),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
