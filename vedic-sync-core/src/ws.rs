//! WebSocket transport backed by tokio-tungstenite.
//!
//! The socket lives in a background task. [`WsTransport`] hands it commands
//! over a channel and the task reports what happened as [`ChannelEvent`]s
//! on the receiver returned by [`WsTransport::new`], each tagged with the
//! session of the socket it concerns.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::connection::{ChannelEvent, Transport, TransportEvent};
use crate::error::TransportError;

/// Timeout for the WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
enum WsCommand {
    Open { url: String, session: u64 },
    Send(String),
    Ping,
    Close,
}

/// [`Transport`] over a real WebSocket.
///
/// Must be created inside a tokio runtime.
#[derive(Debug, Clone)]
pub struct WsTransport {
    commands: mpsc::UnboundedSender<WsCommand>,
}

impl WsTransport {
    /// Spawns the I/O task and returns the transport with its event stream.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(command_rx, event_tx));
        (
            Self {
                commands: command_tx,
            },
            event_rx,
        )
    }

    fn submit(&self, command: WsCommand) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::new("WebSocket task stopped"))
    }
}

impl Transport for WsTransport {
    fn open(&mut self, url: &str, session: u64) -> Result<(), TransportError> {
        self.submit(WsCommand::Open {
            url: url.to_string(),
            session,
        })
    }

    fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.submit(WsCommand::Send(text))
    }

    fn send_heartbeat(&mut self) -> Result<(), TransportError> {
        self.submit(WsCommand::Ping)
    }

    fn close(&mut self) {
        let _ = self.submit(WsCommand::Close);
    }
}

enum Step {
    Command(Option<WsCommand>),
    Incoming(Option<Result<Message, tungstenite::Error>>),
}

async fn run_socket(
    mut commands: mpsc::UnboundedReceiver<WsCommand>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let mut socket: Option<WsStream> = None;
    // Session of the last open; `socket`, when present, belongs to it.
    let mut session = 0;
    let report = |session: u64, event: TransportEvent| {
        let _ = events.send(ChannelEvent::new(session, event));
    };

    loop {
        let step = match socket.as_mut() {
            Some(ws) => tokio::select! {
                command = commands.recv() => Step::Command(command),
                incoming = ws.next() => Step::Incoming(incoming),
            },
            None => Step::Command(commands.recv().await),
        };

        match step {
            Step::Incoming(incoming) => {
                let Some(event) = translate(incoming) else {
                    continue;
                };
                if matches!(
                    event,
                    TransportEvent::Closed { .. } | TransportEvent::Error(_)
                ) {
                    socket = None;
                }
                report(session, event);
            }
            // Every transport handle is gone.
            Step::Command(None) => break,
            Step::Command(Some(command)) => match command {
                WsCommand::Open { url, session: next } => {
                    if let Some(mut old) = socket.take() {
                        let _ = old.close(None).await;
                    }
                    session = next;
                    tracing::debug!("Opening WebSocket {} (session {})", url, session);
                    let event = match timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
                        Ok(Ok((ws, _response))) => {
                            socket = Some(ws);
                            TransportEvent::Opened
                        }
                        Ok(Err(e)) => TransportEvent::Error(e.to_string()),
                        Err(_) => TransportEvent::Error(format!(
                            "connect timed out after {}s",
                            CONNECT_TIMEOUT.as_secs()
                        )),
                    };
                    report(session, event);
                }
                WsCommand::Send(text) => {
                    if let Err(e) = write_frame(&mut socket, Message::Text(text.into())).await {
                        report(session, TransportEvent::Error(e));
                    }
                }
                WsCommand::Ping => {
                    let ping = Message::Ping(Vec::<u8>::new().into());
                    if let Err(e) = write_frame(&mut socket, ping).await {
                        report(session, TransportEvent::Error(e));
                    }
                }
                WsCommand::Close => {
                    if let Some(mut ws) = socket.take() {
                        let _ = ws.close(None).await;
                    }
                }
            },
        }
    }

    if let Some(mut ws) = socket.take() {
        let _ = ws.close(None).await;
    }
}

/// Writes a frame. A missing socket is an error; a failed write drops the
/// socket.
async fn write_frame(socket: &mut Option<WsStream>, message: Message) -> Result<(), String> {
    let Some(ws) = socket.as_mut() else {
        return Err("channel is not open".to_string());
    };
    let result = ws.send(message).await;
    if let Err(e) = result {
        *socket = None;
        return Err(e.to_string());
    }
    Ok(())
}

/// Maps an inbound frame to a transport event. `None` means nothing to
/// report.
fn translate(incoming: Option<Result<Message, tungstenite::Error>>) -> Option<TransportEvent> {
    match incoming {
        Some(Ok(Message::Text(text))) => Some(TransportEvent::Message(text.to_string())),
        Some(Ok(Message::Pong(_))) => Some(TransportEvent::HeartbeatAck),
        Some(Ok(Message::Close(frame))) => {
            let (clean, reason) = match frame {
                Some(frame) => (frame.code == CloseCode::Normal, frame.reason.to_string()),
                None => (false, "closed without status".to_string()),
            };
            Some(TransportEvent::Closed { clean, reason })
        }
        Some(Ok(Message::Binary(_))) => {
            tracing::debug!("Ignoring binary frame");
            None
        }
        // Pings are answered by tungstenite itself.
        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => None,
        Some(Err(e)) => Some(TransportEvent::Error(e.to_string())),
        None => Some(TransportEvent::Closed {
            clean: false,
            reason: "connection dropped".to_string(),
        }),
    }
}
