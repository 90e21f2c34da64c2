//! Proxy channel: bidirectional byte-stream splice
//!
//! Used for plain passthrough TCP: an upstream client stream on one side,
//! a connected TCP socket on the other. Fixed-size buffers per direction;
//! the splice ends when either side reaches EOF or errors, shutting the
//! opposite write half down.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::common::{Stream, Traffic, TrafficMeter};

pub struct ProxyChannel {
    id: String,
    buffer_size: usize,
    meter: Arc<TrafficMeter>,
}

impl ProxyChannel {
    pub fn new(id: impl Into<String>, buffer_size: usize) -> Self {
        Self {
            id: id.into(),
            buffer_size: buffer_size.max(512),
            meter: Arc::new(TrafficMeter::new()),
        }
    }

    /// Handle to the traffic counters, valid after `run` returns too.
    pub fn meter(&self) -> Arc<TrafficMeter> {
        Arc::clone(&self.meter)
    }

    /// Splice until either side finishes. Returns (upstream→downstream,
    /// downstream→upstream) byte counts.
    pub async fn run(self, upstream: Stream, downstream: Stream) -> Traffic {
        let (mut up_read, mut up_write) = tokio::io::split(upstream);
        let (mut down_read, mut down_write) = tokio::io::split(downstream);

        let buffer_size = self.buffer_size;
        let sent_meter = Arc::clone(&self.meter);
        let forward = async move {
            let mut buf = BytesMut::with_capacity(buffer_size);
            buf.resize(buffer_size, 0);
            let mut total = 0u64;
            loop {
                let n = match up_read.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(_) => break,
                };
                if down_write.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                if down_write.flush().await.is_err() {
                    break;
                }
                total += n as u64;
                sent_meter.add_sent(n as u64);
            }
            let _ = down_write.shutdown().await;
            total
        };

        let received_meter = Arc::clone(&self.meter);
        let backward = async move {
            let mut buf = BytesMut::with_capacity(buffer_size);
            buf.resize(buffer_size, 0);
            let mut total = 0u64;
            loop {
                let n = match down_read.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(_) => break,
                };
                if up_write.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                if up_write.flush().await.is_err() {
                    break;
                }
                total += n as u64;
                received_meter.add_received(n as u64);
            }
            let _ = up_write.shutdown().await;
            total
        };

        let (sent, received) = tokio::join!(forward, backward);
        let traffic = Traffic::new(sent, received);
        debug!("proxy channel {} closed ({})", self.id, traffic);
        traffic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::IntoStream;

    #[tokio::test]
    async fn splices_both_directions() {
        let (upstream_near, upstream_far) = tokio::io::duplex(4096);
        let (downstream_near, downstream_far) = tokio::io::duplex(4096);

        let channel = ProxyChannel::new("proxy-1", 4096);
        let meter = channel.meter();
        let splice = tokio::spawn(channel.run(
            upstream_far.into_stream(),
            downstream_near.into_stream(),
        ));

        let (mut up_read, mut up_write) = tokio::io::split(upstream_near);
        let (mut down_read, mut down_write) = tokio::io::split(downstream_far);

        up_write.write_all(b"request bytes").await.unwrap();
        let mut buf = [0u8; 13];
        down_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request bytes");

        down_write.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        up_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        // EOF on one side ends the splice
        drop(up_write);
        drop(down_write);
        let traffic = splice.await.unwrap();
        assert_eq!(traffic, Traffic::new(13, 5));
        assert_eq!(meter.snapshot(), Traffic::new(13, 5));
    }

    #[tokio::test]
    async fn eof_propagates_shutdown() {
        let (upstream_near, upstream_far) = tokio::io::duplex(1024);
        let (downstream_near, downstream_far) = tokio::io::duplex(1024);

        let channel = ProxyChannel::new("proxy-2", 1024);
        let splice = tokio::spawn(channel.run(
            upstream_far.into_stream(),
            downstream_near.into_stream(),
        ));

        // Close the upstream entirely; the downstream reader must see EOF
        drop(upstream_near);
        let (mut down_read, down_write) = tokio::io::split(downstream_far);
        let mut buf = [0u8; 1];
        let n = down_read.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        drop(down_write);
        splice.await.unwrap();
    }
}
