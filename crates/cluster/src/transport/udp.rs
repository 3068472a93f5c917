//! UDP transport: one datagram per frame
//!
//! Matches the protocol's assumptions exactly: unreliable, unordered,
//! duplicate-tolerant, with every frame under the 64 KiB bound. A
//! background task decodes inbound datagrams onto the envelope channel
//! and exits when the receiver side is dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{codec, Envelope, Message, Transport, TransportError};

/// Inbound channel capacity; overflow drops rather than queueing unboundedly
const INBOX_CAPACITY: usize = 1024;

/// Datagram transport over a bound UDP socket
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
}

impl UdpTransport {
    /// Bind a socket and start the receive loop
    ///
    /// Returns the transport and the channel inbound envelopes arrive on.
    pub async fn bind(
        addr: SocketAddr,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Envelope>), TransportError> {
        let socket = Arc::new(
            UdpSocket::bind(addr)
                .await
                .map_err(|err| TransportError::Bind(err.to_string()))?,
        );
        let local = socket
            .local_addr()
            .map_err(|err| TransportError::Bind(err.to_string()))?;

        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        tokio::spawn(receive_loop(socket.clone(), tx));

        Ok((Arc::new(Self { socket, local }), rx))
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<Envelope>) {
    let mut buf = vec![0u8; codec::MAX_FRAME];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!(error = %err, "udp receive failed");
                continue;
            }
        };

        let message = match codec::decode(&buf[..len]) {
            Ok(message) => message,
            Err(err) => {
                debug!(%from, error = %err, "discarding undecodable datagram");
                continue;
            }
        };

        match tx.try_send(Envelope { from, message }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(%from, "inbox full, dropping datagram");
            }
            // Receiver gone: the node shut down, stop the loop
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    async fn send(&self, to: SocketAddr, message: Message) -> Result<(), TransportError> {
        let frame = codec::encode(&message)?;
        self.socket
            .send_to(&frame, to)
            .await
            .map_err(|err| TransportError::Send(err.to_string()))?;
        Ok(())
    }
}
