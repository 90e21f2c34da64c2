//! Stream packet channel
//!
//! Carries length-prefixed IP packets (u16 big-endian) over one byte
//! stream. The stream is already authenticated and encrypted underneath
//! (TLS from the connector). An optional lifespan closes the channel after
//! a random interval so long-lived flows keep changing streams; the client
//! opens a replacement before the old channel drains.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::{debug, trace};

use crate::common::{IpPacket, Stream, Traffic, TrafficMeter};
use crate::error::{Error, Result};

use super::{ChannelKind, ChannelState, PacketChannel, PacketSink};

/// A zero-length frame is a keep-alive
const KEEPALIVE_FRAME: [u8; 2] = [0, 0];

#[derive(Debug, Clone)]
pub struct StreamChannelConfig {
    /// Outgoing queue capacity
    pub queue_capacity: usize,
    /// Self-close after this interval; `None` keeps the channel open until
    /// the peer or the tunnel closes it
    pub lifespan: Option<Duration>,
}

impl Default for StreamChannelConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 255,
            lifespan: None,
        }
    }
}

struct Shared {
    id: String,
    state: AtomicU8,
    meter: TrafficMeter,
    drops: AtomicU64,
    closed: Notify,
}

impl Shared {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

pub struct StreamPacketChannel {
    shared: Arc<Shared>,
    queue: parking_lot::Mutex<Option<mpsc::Sender<IpPacket>>>,
}

impl StreamPacketChannel {
    /// Take ownership of a stream and start the reader/writer tasks.
    pub fn spawn(
        id: impl Into<String>,
        stream: Stream,
        sink: PacketSink,
        config: StreamChannelConfig,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            id: id.into(),
            state: AtomicU8::new(ChannelState::Connected as u8),
            meter: TrafficMeter::new(),
            drops: AtomicU64::new(0),
            closed: Notify::new(),
        });

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let channel = Arc::new(Self {
            shared: Arc::clone(&shared),
            queue: parking_lot::Mutex::new(Some(queue_tx)),
        });

        let (read_half, write_half) = tokio::io::split(stream);
        tokio::spawn(write_loop(Arc::clone(&shared), write_half, queue_rx));
        tokio::spawn(read_loop(Arc::clone(&shared), read_half, sink));

        if let Some(lifespan) = config.lifespan {
            let channel = Arc::downgrade(&channel);
            tokio::spawn(async move {
                tokio::time::sleep(lifespan).await;
                if let Some(channel) = channel.upgrade() {
                    debug!("channel {} reached its lifespan", channel.id());
                    channel.begin_close();
                }
            });
        }

        channel
    }

    /// Move to `closing`: the queue sender is dropped so the writer drains
    /// what is left and then shuts the stream down.
    fn begin_close(&self) {
        let mut queue = self.queue.lock();
        if queue.take().is_some() {
            self.shared.set_state(ChannelState::Closing);
        }
    }
}

impl PacketChannel for StreamPacketChannel {
    fn id(&self) -> &str {
        &self.shared.id
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Stream
    }

    fn state(&self) -> ChannelState {
        self.shared.state()
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
        let queue = self.queue.lock();
        let Some(sender) = queue.as_ref() else {
            return Err(Error::ChannelClosed);
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = sender.try_send(packet) {
            // Backpressure: the newest packet is the one discarded
            self.shared.drops.fetch_add(1, Ordering::Relaxed);
            trace!("channel {} queue full, packet dropped", self.shared.id);
        }
        Ok(())
    }

    fn close(&self) {
        self.begin_close();
        self.shared.closed.notify_waiters();
        self.shared.set_state(ChannelState::Closed);
    }
}

async fn write_loop<W>(shared: Arc<Shared>, mut writer: W, mut queue: mpsc::Receiver<IpPacket>)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(packet) = queue.recv().await {
        let bytes = packet.as_bytes();
        if bytes.len() > u16::MAX as usize {
            shared.drops.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        let mut frame = Vec::with_capacity(2 + bytes.len());
        frame.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        frame.extend_from_slice(bytes);
        if writer.write_all(&frame).await.is_err() || writer.flush().await.is_err() {
            break;
        }
        shared.meter.add_sent(bytes.len() as u64);
    }

    // Queue closed (lifespan or explicit close) or the stream failed:
    // everything enqueued before the close has been drained
    let _ = writer.shutdown().await;
    shared.set_state(ChannelState::Closed);
    shared.closed.notify_waiters();
    debug!("channel {} writer finished", shared.id);
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: R, sink: PacketSink)
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        if shared.state() == ChannelState::Closed {
            break;
        }
        let mut header = [0u8; 2];
        let read = tokio::select! {
            _ = shared.closed.notified() => break,
            read = reader.read_exact(&mut header) => read,
        };
        if read.is_err() {
            break;
        }
        let len = u16::from_be_bytes(header) as usize;
        if len == 0 {
            continue; // keep-alive
        }
        let mut body = vec![0u8; len];
        let read = tokio::select! {
            _ = shared.closed.notified() => break,
            read = reader.read_exact(&mut body) => read,
        };
        if read.is_err() {
            break;
        }
        // Closed channels emit nothing
        if shared.state() == ChannelState::Closed {
            break;
        }
        match IpPacket::new(body) {
            Ok(packet) => {
                shared.meter.add_received(packet.len() as u64);
                sink(packet);
            }
            Err(e) => {
                trace!("channel {} dropped malformed frame: {}", shared.id, e);
                shared.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    shared.set_state(ChannelState::Closed);
    debug!("channel {} reader finished", shared.id);
}

/// Send one keep-alive frame on a raw stream (used before a stream is
/// promoted to a channel).
pub async fn write_keepalive(stream: &mut Stream) -> Result<()> {
    stream.write_all(&KEEPALIVE_FRAME).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::IntoStream;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    fn test_packet(payload: &[u8]) -> IpPacket {
        IpPacket::build_udp_v4(
            (Ipv4Addr::new(10, 0, 0, 1), 1000),
            (Ipv4Addr::new(10, 0, 0, 2), 2000),
            payload,
        )
        .unwrap()
    }

    fn collecting_sink() -> (PacketSink, Arc<Mutex<Vec<IpPacket>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink_target = Arc::clone(&collected);
        let sink: PacketSink = Arc::new(move |packet| {
            sink_target.lock().unwrap().push(packet);
        });
        (sink, collected)
    }

    #[tokio::test]
    async fn packets_cross_the_stream_in_order() {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (sink_a, _) = collecting_sink();
        let (sink_b, received) = collecting_sink();

        let a = StreamPacketChannel::spawn(
            "ch-a",
            near.into_stream(),
            sink_a,
            StreamChannelConfig::default(),
        );
        let _b = StreamPacketChannel::spawn(
            "ch-b",
            far.into_stream(),
            sink_b,
            StreamChannelConfig::default(),
        );

        for i in 0..5u8 {
            a.send(test_packet(&[i; 8])).unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 5);
        for (i, packet) in received.iter().enumerate() {
            assert_eq!(packet.udp_payload().unwrap(), &[i as u8; 8]);
        }
        assert_eq!(a.traffic().sent, received.iter().map(|p| p.len() as u64).sum::<u64>());
    }

    #[tokio::test]
    async fn closed_channel_rejects_sends() {
        let (near, _far) = tokio::io::duplex(1024);
        let (sink, _) = collecting_sink();
        let channel = StreamPacketChannel::spawn(
            "ch-close",
            near.into_stream(),
            sink,
            StreamChannelConfig::default(),
        );

        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(matches!(
            channel.send(test_packet(b"late")),
            Err(Error::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn lifespan_closes_the_channel() {
        let (near, _far) = tokio::io::duplex(1024);
        let (sink, _) = collecting_sink();
        let channel = StreamPacketChannel::spawn(
            "ch-life",
            near.into_stream(),
            sink,
            StreamChannelConfig {
                queue_capacity: 8,
                lifespan: Some(Duration::from_millis(50)),
            },
        );

        assert_eq!(channel.state(), ChannelState::Connected);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(channel.send(test_packet(b"late")).is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_newest() {
        // A tiny duplex that nobody reads: the writer blocks, the queue
        // fills, further sends are dropped
        let (near, _far) = tokio::io::duplex(16);
        let (sink, _) = collecting_sink();
        let channel = StreamPacketChannel::spawn(
            "ch-full",
            near.into_stream(),
            sink,
            StreamChannelConfig {
                queue_capacity: 2,
                lifespan: None,
            },
        );

        for _ in 0..50 {
            channel.send(test_packet(&[0u8; 512])).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(channel.dropped_packets() > 0);
    }

    #[tokio::test]
    async fn keepalive_frames_are_ignored() {
        let (near, far) = tokio::io::duplex(1024);
        let (sink, received) = collecting_sink();
        let _channel = StreamPacketChannel::spawn(
            "ch-keep",
            near.into_stream(),
            sink,
            StreamChannelConfig::default(),
        );

        let mut far: Stream = far.into_stream();
        write_keepalive(&mut far).await.unwrap();
        write_keepalive(&mut far).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(received.lock().unwrap().is_empty());
    }
}
