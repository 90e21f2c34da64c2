//! Stream abstraction
//!
//! Every byte-stream the tunnel touches (raw TCP, TLS, a request stream
//! handed over by the connector) is carried as one boxed type so channels
//! and proxies never care what sits underneath.

use tokio::io::{AsyncRead, AsyncWrite};

/// The unified byte-stream type used throughout the crate.
pub type Stream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// Trait for types that can be converted into a [`Stream`]
pub trait IntoStream {
    fn into_stream(self) -> Stream;
}

impl<T> IntoStream for T
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn into_stream(self) -> Stream {
        Box::new(self)
    }
}
