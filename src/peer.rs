//! Best-effort message channel to the peer device.
//!
//! Each arbitration message is one UDP datagram holding its JSON string.
//! Nothing is acknowledged or retried.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::arbitration::ArbitrationMessage;
use crate::error::Result;

pub trait PeerChannel: Send {
    fn send(&self, msg: ArbitrationMessage);
}

impl<P: PeerChannel> PeerChannel for Option<P> {
    fn send(&self, msg: ArbitrationMessage) {
        match self {
            Some(peer) => peer.send(msg),
            None => debug!(%msg, "no peer configured"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UdpPeer {
    socket: Arc<UdpSocket>,
    remote: Option<SocketAddr>,
}

impl UdpPeer {
    pub async fn bind(listen: SocketAddr, remote: Option<SocketAddr>) -> Result<Self> {
        let socket = UdpSocket::bind(listen).await?;
        debug!(local = %socket.local_addr()?, "peer channel bound");
        Ok(Self {
            socket: Arc::new(socket),
            remote,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Forwards every valid incoming message until the receiver goes away.
    pub fn spawn_listener(&self, tx: mpsc::UnboundedSender<ArbitrationMessage>) -> tokio::task::JoinHandle<()> {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(error) => {
                        warn!(%error, "peer receive failed");
                        continue;
                    }
                };
                match decode(&buf[..len]) {
                    Some(msg) => {
                        debug!(%msg, %from, "from peer");
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    None => debug!(%from, len, "ignoring malformed peer datagram"),
                }
            }
        })
    }
}

impl PeerChannel for UdpPeer {
    fn send(&self, msg: ArbitrationMessage) {
        let Some(remote) = self.remote else {
            debug!(%msg, "no remote peer address");
            return;
        };
        let bytes = encode(msg);
        if let Err(error) = self.socket.try_send_to(&bytes, remote) {
            warn!(%msg, %error, "peer send failed");
        }
    }
}

pub fn encode(msg: ArbitrationMessage) -> Vec<u8> {
    // a unit variant always serializes
    serde_json::to_vec(&msg).unwrap_or_else(|_| format!("\"{msg}\"").into_bytes())
}

pub fn decode(bytes: &[u8]) -> Option<ArbitrationMessage> {
    serde_json::from_slice(bytes).ok()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn wire_format() {
        assert_eq!(encode(ArbitrationMessage::LocalConnected), b"\"localConnected\"");
        assert_eq!(decode(b"\"localPriority\""), Some(ArbitrationMessage::LocalPriority));
        assert_eq!(decode(b"\"watchConnected\""), None);
        assert_eq!(decode(b"garbage"), None);
    }

    #[tokio::test]
    async fn messages_cross_the_socket() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let receiver = UdpPeer::bind(any, None).await.unwrap();
        let sender = UdpPeer::bind(any, Some(receiver.local_addr().unwrap())).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = receiver.spawn_listener(tx);

        sender.socket.send_to(b"nonsense", receiver.local_addr().unwrap()).await.unwrap();
        sender.send(ArbitrationMessage::PeerRequestingConnection);

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(got, Some(ArbitrationMessage::PeerRequestingConnection));
        listener.abort();
    }
}
