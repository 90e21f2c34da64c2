//! UDP packet channel
//!
//! One UDP socket is shared by every session on the server; the client
//! binds its own. Each datagram is `session_id (u64 BE) | crypt_position
//! (u64 BE) | ciphertext`, sealed by the per-session positioned cipher.
//! Datagrams are dispatched to channels by session id; replay and
//! tampering are rejected by the cipher and a sliding window.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::common::{IpPacket, Traffic, TrafficMeter};
use crate::crypto::{PositionCipher, ReplayWindow};
use crate::error::{Error, Result};

use super::{ChannelKind, ChannelState, PacketChannel, PacketSink};

/// `session_id | crypt_position`
const HEADER_LEN: usize = 16;

/// Largest datagram the transmitter will read
const MAX_DATAGRAM: usize = 0xffff;

struct Shared {
    session_id: u64,
    cipher: PositionCipher,
    position: AtomicU64,
    replay: Mutex<ReplayWindow>,
    /// Where to send; the server side learns and tracks the client's
    /// address from the last authenticated datagram
    peer: RwLock<Option<SocketAddr>>,
    meter: TrafficMeter,
    drops: AtomicU64,
    state: AtomicU8,
    sink: PacketSink,
}

impl Shared {
    fn handle_datagram(&self, from: SocketAddr, position: u64, ciphertext: &[u8]) {
        if ChannelState::from_u8(self.state.load(Ordering::Acquire)) == ChannelState::Closed {
            return;
        }
        let plaintext = match self.cipher.open(position, ciphertext) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                self.drops.fetch_add(1, Ordering::Relaxed);
                trace!(
                    "session {}: datagram at position {} failed authentication",
                    self.session_id,
                    position
                );
                return;
            }
        };
        // Replay is checked only after authentication so forged positions
        // cannot poison the window
        if !self.replay.lock().accept(position) {
            self.drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        *self.peer.write() = Some(from);
        // Plaintext is a u16-BE length followed by one whole IP packet
        if plaintext.len() < 2 {
            self.drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let declared = u16::from_be_bytes([plaintext[0], plaintext[1]]) as usize;
        if plaintext.len() < 2 + declared {
            self.drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match IpPacket::new(plaintext[2..2 + declared].to_vec()) {
            Ok(packet) => {
                self.meter.add_received(packet.len() as u64);
                (self.sink)(packet);
            }
            Err(_) => {
                self.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// The shared UDP socket plus the session registry that dispatches
/// incoming datagrams.
pub struct UdpTransmitter {
    socket: Arc<UdpSocket>,
    channels: RwLock<HashMap<u64, Arc<Shared>>>,
    shutdown: Arc<Notify>,
}

impl UdpTransmitter {
    /// Bind the socket and start the receive loop.
    pub async fn bind(addr: SocketAddr) -> Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let transmitter = Arc::new(Self {
            socket,
            channels: RwLock::new(HashMap::new()),
            shutdown: Arc::new(Notify::new()),
        });
        let weak = Arc::downgrade(&transmitter);
        let socket = Arc::clone(&transmitter.socket);
        let shutdown = Arc::clone(&transmitter.shutdown);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let received = tokio::select! {
                    _ = shutdown.notified() => break,
                    received = socket.recv_from(&mut buf) => received,
                };
                match received {
                    Ok((len, from)) => {
                        // The task holds only the socket; it ends when the
                        // transmitter closes or is dropped
                        let Some(transmitter) = weak.upgrade() else { break };
                        transmitter.dispatch(&buf[..len], from);
                    }
                    Err(e) => {
                        warn!("udp transmitter receive failed: {}", e);
                        break;
                    }
                }
            }
        });
        Ok(transmitter)
    }

    /// Stop the receive loop and release the socket.
    pub fn close(&self) {
        self.channels.write().clear();
        // notify_one leaves a permit, so a receiver not yet waiting still
        // observes the shutdown
        self.shutdown.notify_one();
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn dispatch(&self, datagram: &[u8], from: SocketAddr) {
        if datagram.len() < HEADER_LEN {
            return;
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&datagram[..8]);
        let session_id = u64::from_be_bytes(word);
        word.copy_from_slice(&datagram[8..16]);
        let position = u64::from_be_bytes(word);
        let channel = self.channels.read().get(&session_id).cloned();
        match channel {
            Some(shared) => shared.handle_datagram(from, position, &datagram[HEADER_LEN..]),
            None => trace!("datagram for unknown session {}", session_id),
        }
    }

    /// Register a session and return its packet channel.
    pub fn create_channel(
        self: &Arc<Self>,
        session_id: u64,
        server_secret: &[u8; 16],
        peer: Option<SocketAddr>,
        sink: PacketSink,
    ) -> Result<Arc<UdpPacketChannel>> {
        let shared = Arc::new(Shared {
            session_id,
            cipher: PositionCipher::new(server_secret, session_id)?,
            position: AtomicU64::new(1),
            replay: Mutex::new(ReplayWindow::new()),
            peer: RwLock::new(peer),
            meter: TrafficMeter::new(),
            drops: AtomicU64::new(0),
            state: AtomicU8::new(ChannelState::Connected as u8),
            sink,
        });
        self.channels.write().insert(session_id, Arc::clone(&shared));
        debug!("udp channel registered for session {}", session_id);
        Ok(Arc::new(UdpPacketChannel {
            id: format!("udp-{}", session_id),
            shared,
            transmitter: Arc::clone(self),
        }))
    }

    pub fn remove_channel(&self, session_id: u64) {
        self.channels.write().remove(&session_id);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }
}

/// Per-session view over the shared socket.
pub struct UdpPacketChannel {
    id: String,
    shared: Arc<Shared>,
    transmitter: Arc<UdpTransmitter>,
}

impl PacketChannel for UdpPacketChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Udp
    }

    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    fn traffic(&self) -> Traffic {
        self.shared.meter.snapshot()
    }

    fn dropped_packets(&self) -> u64 {
        self.shared.drops.load(Ordering::Relaxed)
    }

    fn send(&self, packet: IpPacket) -> Result<()> {
        if self.state() != ChannelState::Connected {
            return Err(Error::ChannelClosed);
        }
        let Some(peer) = *self.shared.peer.read() else {
            // Server side before the first client datagram: nowhere to send
            self.shared.drops.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        if packet.len() > u16::MAX as usize {
            self.shared.drops.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let position = self.shared.position.fetch_add(1, Ordering::Relaxed);
        let mut plaintext = Vec::with_capacity(2 + packet.len());
        plaintext.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        plaintext.extend_from_slice(packet.as_bytes());
        let sealed = self.shared.cipher.seal(position, &plaintext)?;
        let mut datagram = Vec::with_capacity(HEADER_LEN + sealed.len());
        datagram.extend_from_slice(&self.shared.session_id.to_be_bytes());
        datagram.extend_from_slice(&position.to_be_bytes());
        datagram.extend_from_slice(&sealed);

        match self.transmitter.socket.try_send_to(&datagram, peer) {
            Ok(_) => {
                self.shared.meter.add_sent(packet.len() as u64);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // The channel gives no delivery guarantee; never wait
                self.shared.drops.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) {
        self.shared
            .state
            .store(ChannelState::Closed as u8, Ordering::Release);
        self.transmitter.remove_channel(self.shared.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_key;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn test_packet(payload: &[u8]) -> IpPacket {
        IpPacket::build_udp_v4(
            (Ipv4Addr::new(10, 255, 0, 2), 1000),
            (Ipv4Addr::new(8, 8, 8, 8), 53),
            payload,
        )
        .unwrap()
    }

    fn collecting_sink() -> (PacketSink, Arc<std::sync::Mutex<Vec<IpPacket>>>) {
        let collected = Arc::new(std::sync::Mutex::new(Vec::new()));
        let target = Arc::clone(&collected);
        let sink: PacketSink = Arc::new(move |packet| {
            target.lock().unwrap().push(packet);
        });
        (sink, collected)
    }

    async fn transmitter() -> Arc<UdpTransmitter> {
        UdpTransmitter::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn datagrams_cross_between_transmitters() {
        let secret = random_key();
        let server = transmitter().await;
        let client = transmitter().await;

        let (server_sink, server_received) = collecting_sink();
        let (client_sink, client_received) = collecting_sink();

        let server_channel = server
            .create_channel(9, &secret, None, server_sink)
            .unwrap();
        let client_channel = client
            .create_channel(9, &secret, Some(server.local_addr().unwrap()), client_sink)
            .unwrap();

        client_channel.send(test_packet(b"up")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server_received.lock().unwrap().len(), 1);

        // The server learned the client's address and can answer
        server_channel.send(test_packet(b"down")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let received = client_received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].udp_payload().unwrap(), b"down");
    }

    #[tokio::test]
    async fn wrong_secret_is_dropped() {
        let server = transmitter().await;
        let client = transmitter().await;

        let (server_sink, server_received) = collecting_sink();
        let (client_sink, _) = collecting_sink();

        let _server_channel = server
            .create_channel(5, &random_key(), None, server_sink)
            .unwrap();
        let client_channel = client
            .create_channel(5, &random_key(), Some(server.local_addr().unwrap()), client_sink)
            .unwrap();

        client_channel.send(test_packet(b"bad")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(server_received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_session_is_ignored() {
        let secret = random_key();
        let server = transmitter().await;
        let client = transmitter().await;

        let (client_sink, _) = collecting_sink();
        let client_channel = client
            .create_channel(1234, &secret, Some(server.local_addr().unwrap()), client_sink)
            .unwrap();

        // No channel registered server-side; nothing should blow up
        client_channel.send(test_packet(b"lost")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.channel_count(), 0);
    }

    #[tokio::test]
    async fn close_unregisters_and_rejects() {
        let secret = random_key();
        let server = transmitter().await;
        let (sink, _) = collecting_sink();
        let channel = server.create_channel(7, &secret, None, sink).unwrap();

        assert_eq!(server.channel_count(), 1);
        channel.close();
        assert_eq!(server.channel_count(), 0);
        assert!(matches!(
            channel.send(test_packet(b"late")),
            Err(Error::ChannelClosed)
        ));
    }
}
