//! Duplex byte channels the protocol layer runs on.
//!
//! A [`ByteChannel`] is a connected flag, an inbound stream of byte chunks and
//! a sender for outbound bytes. [`ByteChannel::tcp`] adapts a socket with one
//! reader and one writer task, [`ByteChannel::pair`] wires two in-process ends
//! together.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::utils::error::{MqttError, Result};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Connected flag shared by every handle of one channel.
#[derive(Debug, Clone)]
pub struct ChannelState(Arc<watch::Sender<bool>>);

impl ChannelState {
    fn new() -> Self {
        let (connected, _) = watch::channel(true);
        Self(Arc::new(connected))
    }

    pub fn is_connected(&self) -> bool {
        *self.0.borrow()
    }

    /// Marks the channel closed. Returns false if it already was.
    pub fn close(&self) -> bool {
        self.0.send_if_modified(|connected| std::mem::replace(connected, false))
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        let mut connected = self.0.subscribe();
        let _ = connected.wait_for(|connected| !*connected).await;
    }
}

#[derive(Debug, Clone)]
pub struct ByteSender {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    state: ChannelState,
}

impl ByteSender {
    pub fn send(&self, bytes: Vec<u8>) -> Result<()> {
        if !self.state.is_connected() {
            return Err(MqttError::NotConnected);
        }
        self.outgoing
            .send(bytes)
            .map_err(|_| MqttError::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }
}

#[derive(Debug)]
pub struct ByteChannel {
    sender: ByteSender,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    peer: String,
}

impl ByteChannel {
    /// Two connected in-process ends. Bytes sent on one arrive on the other
    /// and closing either end closes both.
    pub fn pair() -> (ByteChannel, ByteChannel) {
        let state = ChannelState::new();
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();

        let left = ByteChannel {
            sender: ByteSender {
                outgoing: right_tx,
                state: state.clone(),
            },
            incoming: left_rx,
            peer: "pipe".to_string(),
        };
        let right = ByteChannel {
            sender: ByteSender {
                outgoing: left_tx,
                state,
            },
            incoming: right_rx,
            peer: "pipe".to_string(),
        };
        (left, right)
    }

    /// Adapts a connected socket. The channel closes when the peer hangs up,
    /// on the first IO error or when [`ByteChannel::close`] is called.
    pub fn tcp(stream: TcpStream) -> ByteChannel {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let state = ChannelState::new();
        let (mut reader, mut writer) = stream.into_split();
        let (incoming_tx, incoming) = mpsc::unbounded_channel::<Vec<u8>>();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        {
            let state = state.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; READ_BUFFER_SIZE];
                loop {
                    tokio::select! {
                        read = reader.read(&mut buf) => match read {
                            Ok(0) => {
                                debug!("{peer} closed the connection");
                                break;
                            }
                            Ok(n) => {
                                if incoming_tx.send(buf[..n].to_vec()).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("read from {peer} failed: {e}");
                                break;
                            }
                        },
                        _ = state.closed() => break,
                    }
                }
                state.close();
            });
        }

        {
            let state = state.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        bytes = outgoing_rx.recv() => match bytes {
                            Some(bytes) => {
                                if let Err(e) = writer.write_all(&bytes).await {
                                    warn!("write to {peer} failed: {e}");
                                    break;
                                }
                            }
                            None => break,
                        },
                        _ = state.closed() => {
                            // flush what was queued before the close, e.g. a refusing CONNACK
                            while let Ok(bytes) = outgoing_rx.try_recv() {
                                if writer.write_all(&bytes).await.is_err() {
                                    break;
                                }
                            }
                            break;
                        }
                    }
                }
                state.close();
                let _ = writer.shutdown().await;
            });
        }

        ByteChannel {
            sender: ByteSender { outgoing, state },
            incoming,
            peer,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.sender.is_connected()
    }

    pub fn sender(&self) -> ByteSender {
        self.sender.clone()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.sender.send(bytes)
    }

    pub fn close(&self) {
        self.sender.state.close();
    }

    /// Next inbound chunk, or `None` once the channel is closed and drained
    /// of what had already arrived.
    pub async fn receive(&mut self) -> Option<Vec<u8>> {
        tokio::select! {
            biased;
            chunk = self.incoming.recv() => chunk,
            _ = self.sender.state.closed() => None,
        }
    }
}
