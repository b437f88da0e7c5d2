//! # Wire Protocol Messages
//!
//! Serializable types crossing process boundaries, plus the frame codec of
//! the channel multiplexer.
//!
//! ## Wire Surfaces
//!
//! | Surface | Types | Encoding |
//! |---------|-------|----------|
//! | DHT rendezvous | [`PeerConnectionRequest`] | MessagePack map, named fields |
//! | SDP blob (`ice_msg`) | [`IceSdp`] | bincode, bounded |
//! | Control channel | [`ControlMessage`] | bincode, bounded |
//! | Transport frames | [`Frame`] | varint header + raw payload |
//!
//! Connection requests travel as self-describing maps keyed by
//! `id, ice_msg, isAnswer, connType`, so foreign implementations can
//! decode them without this crate's type definitions. The SDP blob and
//! the control channel are consumed by both ends of this protocol only
//! and stay on the compact positional encoding.
//!
//! ## Framing
//!
//! Every frame on the multiplexed transport is
//! `varint(channel_id) | varint(payload_len) | payload`. Channel id 0 is
//! reserved for control traffic.
//!
//! ## Security Limits
//!
//! All deserialization is size-bounded to prevent memory exhaustion:
//! frames are capped at [`MAX_FRAME_PAYLOAD`], DHT values and control
//! payloads at [`MAX_MESSAGE_SIZE`].

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Channel id reserved for control traffic on every multiplexed transport.
pub const CONTROL_CHANNEL: u16 = 0;

/// Maximum payload carried by a single frame.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Maximum size of a serialized DHT value or control payload.
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024;

/// Maximum accepted channel name length.
pub const MAX_CHANNEL_NAME: usize = 256;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

// ============================================================================
// DHT rendezvous messages
// ============================================================================

/// Connection request exchanged over the DHT, encrypted to the recipient's
/// device key by the DHT layer.
///
/// An offer (`is_answer == false`) starts a negotiation; the matching
/// answer echoes the same `id` with `is_answer == true`. `conn_type` is an
/// opaque tag the remote may use to classify wake-up notifications.
///
/// On the wire this is a MessagePack map with the field names below; use
/// [`serialize_request`] / [`deserialize_request`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerConnectionRequest {
    pub id: u64,
    pub ice_msg: Vec<u8>,
    #[serde(rename = "isAnswer")]
    pub is_answer: bool,
    #[serde(rename = "connType")]
    pub conn_type: String,
}

/// Encode a connection request as a self-describing map with named fields.
pub fn serialize_request(
    request: &PeerConnectionRequest,
) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    let mut buf = Vec::new();
    let mut serializer = rmp_serde::Serializer::new(&mut buf).with_struct_map();
    request.serialize(&mut serializer)?;
    Ok(buf)
}

/// Decode a connection request, enforcing [`MAX_MESSAGE_SIZE`].
pub fn deserialize_request(
    bytes: &[u8],
) -> Result<PeerConnectionRequest, rmp_serde::decode::Error> {
    if bytes.len() as u64 > MAX_MESSAGE_SIZE {
        return Err(rmp_serde::decode::Error::Uncategorized(
            "connection request exceeds size limit".into(),
        ));
    }
    rmp_serde::from_slice(bytes)
}

/// ICE session description carried inside `ice_msg`.
///
/// Candidates are single lines in standard ICE candidate text form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceSdp {
    pub ufrag: String,
    pub pwd: String,
    pub candidates: Vec<String>,
}

// ============================================================================
// Control channel messages
// ============================================================================

/// Payloads of channel 0, the control channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Request to open channel `id` with the given name.
    ChannelOpen { id: u16, name: String },
    /// The open request for `id` was accepted.
    ChannelAccept { id: u16 },
    /// The open request for `id` was declined.
    ChannelReject { id: u16, reason: String },
    /// Channel `id` was closed by the sender.
    ChannelClose { id: u16 },
    /// Liveness probe; the peer must reply with [`ControlMessage::BeaconAck`].
    Beacon,
    BeaconAck,
}

// ============================================================================
// Varint + frame codec
// ============================================================================

/// One frame of the multiplexed transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub channel: u16,
    pub payload: Vec<u8>,
}

/// Append an unsigned LEB128 varint to `buf`.
pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Decode an unsigned LEB128 varint from the front of `buf`.
/// Returns the value and the number of bytes consumed.
pub fn get_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if shift >= 64 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "varint overflow",
            ));
        }
        let byte = reader.read_u8().await?;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Encode a frame header + payload into a single buffer.
///
/// Emitting header and payload in one write keeps frames atomic on the
/// underlying transport.
pub fn encode_frame(channel: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    put_varint(&mut buf, u64::from(channel));
    put_varint(&mut buf, payload.len() as u64);
    buf.extend_from_slice(payload);
    buf
}

/// Write one frame. The caller must serialize writers externally.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    channel: u16,
    payload: &[u8],
) -> std::io::Result<()> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "frame payload exceeds limit",
        ));
    }
    writer.write_all(&encode_frame(channel, payload)).await?;
    writer.flush().await
}

/// Read one frame, enforcing [`MAX_FRAME_PAYLOAD`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Frame> {
    let channel = read_varint(reader).await?;
    if channel > u64::from(u16::MAX) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "channel id out of range",
        ));
    }
    let len = read_varint(reader).await?;
    if len > MAX_FRAME_PAYLOAD as u64 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame payload exceeds limit",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Frame {
        channel: channel as u16,
        payload,
    })
}
