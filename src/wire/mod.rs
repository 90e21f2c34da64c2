//! Wire protocol: request framing and op codes
//!
//! Every control request is `magic (8) | op code (1) | body length (u32 LE)
//! | JSON body`. Every response is `length (u32 LE) | JSON`, where the JSON
//! is a [`SessionResponse`] or a superset of one. Channel-establishing ops
//! hand the underlying stream over to the caller once the response has been
//! read.

mod messages;
mod response;

pub use messages::{
    ByeRequest, ClientInfo, HelloRequest, HelloResponse, RewardedAdRequest, SessionStatusRequest,
    StreamProxyRequest, TcpPacketChannelRequest, UdpPacketRequest,
};
pub use response::{AccessUsage, SessionResponse, SuppressedTo};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Magic prefix carried by every request
pub const REQUEST_MAGIC: [u8; 8] = *b"TNLY\x01\x00\x00\x00";

/// Upper bound for any JSON body (512 KiB)
pub const MAX_BODY_LEN: usize = 512 * 1024;

/// Protocol versions this build speaks
pub const MIN_PROTOCOL_VERSION: u32 = 3;
pub const MAX_PROTOCOL_VERSION: u32 = 4;

/// Control request op codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Hello = 1,
    Bye = 2,
    SessionStatus = 3,
    RewardedAd = 4,
    TcpPacketChannel = 5,
    StreamProxy = 6,
    UdpPacket = 7,
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(OpCode::Hello),
            2 => Ok(OpCode::Bye),
            3 => Ok(OpCode::SessionStatus),
            4 => Ok(OpCode::RewardedAd),
            5 => Ok(OpCode::TcpPacketChannel),
            6 => Ok(OpCode::StreamProxy),
            7 => Ok(OpCode::UdpPacket),
            other => Err(Error::Protocol(format!("unknown op code {}", other))),
        }
    }
}

/// Write a framed request.
pub async fn write_request<W, T>(writer: &mut W, op: OpCode, body: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(body)?;
    if json.len() > MAX_BODY_LEN {
        return Err(Error::Protocol("request body too large".into()));
    }
    let mut frame = Vec::with_capacity(REQUEST_MAGIC.len() + 5 + json.len());
    frame.extend_from_slice(&REQUEST_MAGIC);
    frame.push(op as u8);
    frame.extend_from_slice(&(json.len() as u32).to_le_bytes());
    frame.extend_from_slice(&json);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed request, returning the op code and raw body.
pub async fn read_request<R>(reader: &mut R) -> Result<(OpCode, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic).await?;
    if magic != REQUEST_MAGIC {
        return Err(Error::Protocol("bad request magic".into()));
    }
    let op = OpCode::try_from(reader.read_u8().await?)?;
    let body = read_body(reader).await?;
    Ok((op, body))
}

/// Decode a request body read by [`read_request`].
pub fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}

/// Write a framed JSON response.
pub async fn write_response<W, T>(writer: &mut W, response: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(response)?;
    if json.len() > MAX_BODY_LEN {
        return Err(Error::Protocol("response too large".into()));
    }
    let mut frame = Vec::with_capacity(4 + json.len());
    frame.extend_from_slice(&(json.len() as u32).to_le_bytes());
    frame.extend_from_slice(&json);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed response body. Callers decode it once as
/// [`SessionResponse`] and, for hello, a second time as the superset.
pub async fn read_response_bytes<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    read_body(reader).await
}

async fn read_body<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_BODY_LEN {
        return Err(Error::Protocol(format!("frame of {} bytes rejected", len)));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// serde adapter: optional byte arrays as base64 strings in JSON
pub(crate) mod base64_opt_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<impl AsRef<[u8]>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes.as_ref())),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<Option<[u8; N]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(s) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let decoded = STANDARD
            .decode(&s)
            .map_err(|e| serde::de::Error::custom(format!("bad base64: {}", e)))?;
        decoded
            .try_into()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("expected {} bytes", N)))
    }
}

/// serde adapter: byte arrays as standard base64 strings in JSON
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let decoded = STANDARD
            .decode(&s)
            .map_err(|e| serde::de::Error::custom(format!("bad base64: {}", e)))?;
        decoded
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("expected {} bytes", N)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_roundtrip() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, _server_write) = tokio::io::split(server);
        drop(client_read);

        let body = ByeRequest {
            session_id: 77,
            session_key: [9u8; 16],
        };
        write_request(&mut client_write, OpCode::Bye, &body)
            .await
            .unwrap();

        let (op, raw) = read_request(&mut server_read).await.unwrap();
        assert_eq!(op, OpCode::Bye);
        let decoded: ByeRequest = parse_body(&raw).unwrap();
        assert_eq!(decoded.session_id, 77);
        assert_eq!(decoded.session_key, [9u8; 16]);
    }

    #[tokio::test]
    async fn bad_magic_is_rejected() {
        let (client, server) = tokio::io::duplex(64);
        let (_, mut client_write) = tokio::io::split(client);
        let (mut server_read, _keep) = tokio::io::split(server);

        use tokio::io::AsyncWriteExt;
        client_write.write_all(b"NOTMAGIC\x01\x00\x00\x00\x00").await.unwrap();

        assert!(read_request(&mut server_read).await.is_err());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (client, server) = tokio::io::duplex(64);
        let (_, mut client_write) = tokio::io::split(client);
        let (mut server_read, _keep) = tokio::io::split(server);

        use tokio::io::AsyncWriteExt;
        let mut frame = Vec::new();
        frame.extend_from_slice(&REQUEST_MAGIC);
        frame.push(OpCode::Hello as u8);
        frame.extend_from_slice(&(u32::MAX).to_le_bytes());
        client_write.write_all(&frame).await.unwrap();

        assert!(read_request(&mut server_read).await.is_err());
    }

    #[test]
    fn op_code_mapping() {
        for op in [
            OpCode::Hello,
            OpCode::Bye,
            OpCode::SessionStatus,
            OpCode::RewardedAd,
            OpCode::TcpPacketChannel,
            OpCode::StreamProxy,
            OpCode::UdpPacket,
        ] {
            assert_eq!(OpCode::try_from(op as u8).unwrap(), op);
        }
        assert!(OpCode::try_from(0).is_err());
        assert!(OpCode::try_from(8).is_err());
    }
}
