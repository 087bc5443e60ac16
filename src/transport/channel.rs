//! Signaling channel
//!
//! A persistent, ordered, full-duplex control connection. Inbound frames are
//! delivered onto the session event queue in arrival order; outbound
//! messages go through a writer task. The channel never reconnects.

use super::codec::{MessageCodec, SignalingMessage};
use crate::error::SessionError;
use crate::session::{EventSender, SessionEvent};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

/// Outbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Sending half of a signaling connection
pub struct SignalingChannel {
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl SignalingChannel {
    /// Connect to a WebSocket signaling server.
    ///
    /// `ChannelOpened` is queued before any inbound message; `ChannelClosed`
    /// is queued once when the connection goes away.
    pub async fn connect(url: &str, events: EventSender) -> Result<Self, SessionError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            error!("Failed to connect to signaling server {}: {}", url, e);
            SessionError::ChannelClosed
        })?;
        info!("Signaling channel connected to {}", url);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        let closed = Arc::new(AtomicBool::new(false));

        // Forward outbound messages to the WebSocket
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    Outbound::Text(text) => {
                        if ws_sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            debug!("Signaling writer finished");
        });

        let _ = events.send(SessionEvent::ChannelOpened);

        let reader_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(result) = ws_receiver.next().await {
                match result {
                    Ok(Message::Text(text)) => {
                        if events.send(SessionEvent::ChannelMessage(text)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if events.send(SessionEvent::ChannelMessage(text)).is_err() {
                                break;
                            }
                        }
                        Err(_) => warn!("Dropping non UTF-8 binary frame on signaling channel"),
                    },
                    Ok(Message::Close(_)) => {
                        info!("Signaling connection closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Signaling WebSocket error: {}", e);
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::Release);
            let _ = events.send(SessionEvent::ChannelClosed);
        });

        Ok(Self { outbound: tx, closed })
    }

    /// In-memory channel. The returned [`LoopbackPeer`] plays the server.
    pub fn loopback(events: EventSender) -> (Self, LoopbackPeer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let channel = Self {
            outbound: tx,
            closed: closed.clone(),
        };
        let peer = LoopbackPeer {
            outbound: rx,
            events,
            closed,
        };
        (channel, peer)
    }

    /// Queue a message for sending. Fails with `ChannelClosed` after close.
    pub fn send(&self, message: &SignalingMessage) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::ChannelClosed);
        }
        debug!("-> {}", message.name());
        self.outbound
            .send(Outbound::Text(MessageCodec::encode(message)))
            .map_err(|_| SessionError::ChannelClosed)
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.outbound.send(Outbound::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Remote end of a loopback channel
pub struct LoopbackPeer {
    outbound: mpsc::UnboundedReceiver<Outbound>,
    events: EventSender,
    closed: Arc<AtomicBool>,
}

impl LoopbackPeer {
    /// Report the connection as established
    pub fn open(&self) {
        let _ = self.events.send(SessionEvent::ChannelOpened);
    }

    /// Deliver a message as if sent by the server
    pub fn deliver(&self, message: &SignalingMessage) {
        self.deliver_raw(MessageCodec::encode(message));
    }

    pub fn deliver_raw(&self, text: impl Into<String>) {
        let _ = self.events.send(SessionEvent::ChannelMessage(text.into()));
    }

    /// Drop the connection from the remote side
    pub fn hang_up(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.events.send(SessionEvent::ChannelClosed);
    }

    /// Everything sent so far, decoded. Stops at a close frame.
    pub fn sent(&mut self) -> Vec<SignalingMessage> {
        let mut messages = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            match frame {
                Outbound::Text(text) => match MessageCodec::decode(&text) {
                    Ok(message) => messages.push(message),
                    Err(e) => warn!("Loopback peer received undecodable frame: {}", e),
                },
                Outbound::Close => break,
            }
        }
        messages
    }

    /// Whether the local side has closed the channel
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
