use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A clonable handle for queuing outbound frames.
///
/// The supervisor, the heartbeat task, and the capture task each hold a
/// clone and may send concurrently; only the single task draining
/// `outgoing_rx` in [`Transport::connect`]'s caller ever touches the
/// WebSocket sink directly, so multiple writers can never interleave a
/// partial frame onto the wire (grounded in the android-remote agent's
/// `ConnectionHandle` / `outgoing_tx` split).
#[derive(Clone)]
pub struct OutgoingHandle {
    tx: mpsc::Sender<Vec<u8>>,
}

impl OutgoingHandle {
    pub async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.tx.send(bytes).await.map_err(|_| anyhow::anyhow!("transport closed"))
    }

    #[cfg(test)]
    pub fn for_test(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { tx }
    }
}

/// One live WebSocket connection: a receive half and a send-serializing
/// queue. Dropped (or explicitly closed) when the connection ends;
/// callers reconnect by calling [`connect`] again.
pub struct Transport {
    stream: WsStream,
    outgoing_tx: mpsc::Sender<Vec<u8>>,
    outgoing_rx: mpsc::Receiver<Vec<u8>>,
}

const OUTGOING_QUEUE_DEPTH: usize = 64;

pub async fn connect(url: &str) -> Result<Transport> {
    let (stream, _response) =
        connect_async(url).await.with_context(|| format!("failed to connect to {url}"))?;
    let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE_DEPTH);
    Ok(Transport { stream, outgoing_tx, outgoing_rx })
}

pub enum Incoming {
    Binary(Vec<u8>),
    Closed,
}

impl Transport {
    pub fn handle(&self) -> OutgoingHandle {
        OutgoingHandle { tx: self.outgoing_tx.clone() }
    }

    /// Sends one binary frame, bypassing the queue. Used only for the AUTH
    /// message, which must be the very first outbound byte on the wire —
    /// queuing it would race with anything already pending on
    /// `outgoing_rx` from a prior connection's leftover handle.
    pub async fn send_direct(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.stream.send(WsMessage::Binary(bytes.into())).await.context("failed to send frame")
    }

    /// Waits for either the next outbound frame to send or the next
    /// inbound message to decode, whichever happens first. This is the
    /// single point that owns both halves of the socket.
    pub async fn next_event(&mut self) -> Result<TransportEvent> {
        tokio::select! {
            outgoing = self.outgoing_rx.recv() => {
                match outgoing {
                    Some(bytes) => {
                        self.stream.send(WsMessage::Binary(bytes.into())).await.context("failed to send frame")?;
                        Ok(TransportEvent::Sent)
                    }
                    None => Ok(TransportEvent::Sent),
                }
            }
            message = self.stream.next() => {
                match message {
                    Some(Ok(WsMessage::Binary(bytes))) => Ok(TransportEvent::Incoming(Incoming::Binary(bytes.to_vec()))),
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!("websocket closed by peer: frame={frame:?}");
                        Ok(TransportEvent::Incoming(Incoming::Closed))
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        self.stream.send(WsMessage::Pong(payload)).await.ok();
                        Ok(TransportEvent::Sent)
                    }
                    Some(Ok(_)) => Ok(TransportEvent::Sent),
                    Some(Err(err)) => bail!("websocket receive error: {err}"),
                    None => Ok(TransportEvent::Incoming(Incoming::Closed)),
                }
            }
        }
    }

    pub async fn close(&mut self) {
        if let Err(err) = self.stream.close(None).await {
            warn!("error during graceful websocket close: {err}");
        }
    }
}

pub enum TransportEvent {
    Incoming(Incoming),
    Sent,
}
