//! Instruments protocol message format implementation
//!
//! This module handles the serialization and deserialization of messages used in
//! the iOS instruments protocol. The message format consists of:
//! - 32-byte message header
//! - 16-byte payload header
//! - Optional auxiliary data section
//! - Payload data (typically NSKeyedArchive format)
//!
//! # Message Structure
//! ```text
//! +---------------------+
//! |   MessageHeader     | 32 bytes
//! +---------------------+
//! |   PayloadHeader     | 16 bytes
//! +---------------------+
//! |   AuxHeader         | 16 bytes (if aux present)
//! |   Aux data          | variable length
//! +---------------------+
//! |   Payload data      | variable length (NSKeyedArchive)
//! +---------------------+
//! ```

use plist::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Error;

/// Message header containing metadata about the message
///
/// 32-byte structure that appears at the start of every message
#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeader {
    /// Magic number identifying the protocol (0x1F3D5B79)
    magic: u32,
    /// Length of this header (always 32)
    header_len: u32,
    /// Fragment identifier for multipart messages
    fragment_id: u16,
    /// Total number of fragments
    fragment_count: u16,
    /// Total length of payload (headers + aux + data)
    length: u32,
    /// Unique message identifier
    identifier: u32,
    /// Conversation tracking index
    conversation_index: u32,
    /// Channel number this message belongs to
    pub channel: u32,
    /// Whether a reply is expected
    expects_reply: bool,
}

/// Payload header containing information about the message contents
///
/// 16-byte structure following the message header
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PayloadHeader {
    /// Flags controlling message processing
    flags: u32,
    /// Length of auxiliary data section
    aux_length: u32,
    /// Total length of payload (aux + data)
    total_length: u64,
}

/// Header for auxiliary data section
///
/// 16-byte structure preceding auxiliary data
#[derive(Debug, Default, PartialEq)]
pub struct AuxHeader {
    /// Buffer size hint (often 496)
    buffer_size: u32,
    /// Unknown field (typically 0)
    unknown: u32,
    /// Actual size of auxiliary data
    aux_size: u32,
    /// Unknown field (typically 0)
    unknown2: u32,
}

/// Auxiliary data container
///
/// Contains a header and a collection of typed values
#[derive(Debug, PartialEq)]
pub struct Aux {
    /// Auxiliary data header
    pub header: AuxHeader,
    /// Collection of auxiliary values
    pub values: Vec<AuxValue>,
}

/// Typed auxiliary value that can be included in messages
#[derive(PartialEq)]
pub enum AuxValue {
    /// UTF-8 string value (type 0x01)
    String(String),
    /// Raw byte array (type 0x02)
    Array(Vec<u8>),
    /// 32-bit unsigned integer (type 0x03)
    U32(u32),
    /// 64-bit signed integer (type 0x06)
    I64(i64),
}

/// Complete protocol message
#[derive(Debug, PartialEq)]
pub struct Message {
    /// Message metadata header
    pub message_header: MessageHeader,
    /// Payload description header
    pub payload_header: PayloadHeader,
    /// Optional auxiliary data
    pub aux: Option<Aux>,
    /// Optional payload data (typically NSKeyedArchive)
    pub data: Option<Value>,
}

impl Aux {
    /// Parses auxiliary data from bytes
    ///
    /// # Arguments
    /// * `bytes` - Raw byte slice containing auxiliary data
    ///
    /// # Returns
    /// * `Ok(Aux)` - Parsed auxiliary data
    /// * `Err(Error)` - If parsing fails
    ///
    /// # Errors
    /// * `Error::NotEnoughBytes` if input is too short
    /// * `Error::UnknownAuxValueType` for unsupported types
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, Error> {
        if bytes.len() < 16 {
            return Err(Error::NotEnoughBytes { expected: 16, got: bytes.len() });
        }

        let header = AuxHeader {
            buffer_size: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            unknown: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            aux_size: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            unknown2: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        };

        let mut bytes = &bytes[16..];
        let mut values = Vec::new();
        loop {
            if bytes.len() < 8 {
                break;
            }
            let aux_type = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            bytes = &bytes[4..];
            match aux_type {
                0x0a => {
                    // null, skip
                    // seems to be in between every value
                }
                0x01 => {
                    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
                    bytes = &bytes[4..];
                    if bytes.len() < len {
                        return Err(Error::NotEnoughBytes { expected: len, got: bytes.len() });
                    }
                    values.push(AuxValue::String(String::from_utf8(bytes[..len].to_vec())?));
                    bytes = &bytes[len..];
                }
                0x02 => {
                    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
                    bytes = &bytes[4..];
                    if bytes.len() < len {
                        return Err(Error::NotEnoughBytes { expected: len, got: bytes.len() });
                    }
                    values.push(AuxValue::Array(bytes[..len].to_vec()));
                    bytes = &bytes[len..];
                }
                0x03 => {
                    values.push(AuxValue::U32(u32::from_le_bytes([
                        bytes[0], bytes[1], bytes[2], bytes[3],
                    ])));
                    bytes = &bytes[4..];
                }
                0x06 => {
                    if bytes.len() < 8 {
                        return Err(Error::NotEnoughBytes { expected: 8, got: bytes.len() });
                    }
                    values.push(AuxValue::I64(i64::from_le_bytes([
                        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6],
                        bytes[7],
                    ])));
                    bytes = &bytes[8..];
                }
                _ => return Err(Error::UnknownAuxValueType(aux_type)),
            }
        }

        Ok(Self { header, values })
    }

    /// Creates new auxiliary data from values
    ///
    /// Note: Header fields are populated during serialization
    ///
    /// # Arguments
    /// * `values` - Collection of auxiliary values to include
    pub fn from_values(values: Vec<AuxValue>) -> Self {
        Self {
            header: AuxHeader::default(),
            values,
        }
    }

    /// Serializes auxiliary data to bytes
    ///
    /// Includes properly formatted header with updated size fields
    pub fn serialize(&self) -> Vec<u8> {
        let mut values_payload = Vec::new();
        for v in self.values.iter() {
            values_payload.extend_from_slice(&0x0a_u32.to_le_bytes());
            match v {
                AuxValue::String(s) => {
                    values_payload.extend_from_slice(&0x01_u32.to_le_bytes());
                    values_payload.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    values_payload.extend_from_slice(s.as_bytes());
                }
                AuxValue::Array(v) => {
                    values_payload.extend_from_slice(&0x02_u32.to_le_bytes());
                    values_payload.extend_from_slice(&(v.len() as u32).to_le_bytes());
                    values_payload.extend_from_slice(v);
                }
                AuxValue::U32(u) => {
                    values_payload.extend_from_slice(&0x03_u32.to_le_bytes());
                    values_payload.extend_from_slice(&u.to_le_bytes());
                }
                AuxValue::I64(i) => {
                    values_payload.extend_from_slice(&0x06_u32.to_le_bytes());
                    values_payload.extend_from_slice(&i.to_le_bytes());
                }
            }
        }

        let mut res = Vec::new();
        let buffer_size = 496_u32;
        res.extend_from_slice(&buffer_size.to_le_bytes()); // TODO: find what
        // this means and how to actually serialize it
        // go-ios just uses 496
        // pymobiledevice3 doesn't seem to parse the header at all
        res.extend_from_slice(&0_u32.to_le_bytes());
        res.extend_from_slice(&(values_payload.len() as u32).to_le_bytes());
        res.extend_from_slice(&0_u32.to_le_bytes());
        res.extend_from_slice(&values_payload);
        res
    }
}

impl AuxValue {
    /// Creates an auxiliary value containing NSKeyedArchived data
    ///
    /// # Arguments
    /// * `v` - Plist value to archive
    pub fn archived_value(v: impl Into<plist::Value>) -> Self {
        Self::Array(ns_keyed_archive::encode::encode_to_bytes(v.into()).expect("Failed to encode"))
    }
}

impl MessageHeader {
    pub fn identifier(&self) -> u32 {
        self.identifier
    }

    pub fn fragment_id(&self) -> u16 {
        self.fragment_id
    }

    pub fn fragment_count(&self) -> u16 {
        self.fragment_count
    }

    pub fn expects_reply(&self) -> bool {
        self.expects_reply
    }

    /// Creates a new message header
    ///
    /// Note: Length field is updated during message serialization
    ///
    /// # Arguments
    /// * `fragment_id` - Identifier for message fragments
    /// * `fragment_count` - Total fragments in message
    /// * `identifier` - Unique message ID
    /// * `conversation_index` - Conversation tracking number
    /// * `channel` - Channel number
    /// * `expects_reply` - Whether response is expected
    pub fn new(
        fragment_id: u16,
        fragment_count: u16,
        identifier: u32,
        conversation_index: u32,
        channel: u32,
        expects_reply: bool,
    ) -> Self {
        Self {
            magic: 0x1F3D5B79,
            header_len: 32,
            fragment_id,
            fragment_count,
            length: 0,
            identifier,
            conversation_index,
            channel,
            expects_reply,
        }
    }

    /// Serializes header to bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut res = Vec::new();
        res.extend_from_slice(&self.magic.to_le_bytes());
        res.extend_from_slice(&self.header_len.to_le_bytes());
        res.extend_from_slice(&self.fragment_id.to_le_bytes());
        res.extend_from_slice(&self.fragment_count.to_le_bytes());
        res.extend_from_slice(&self.length.to_le_bytes());
        res.extend_from_slice(&self.identifier.to_le_bytes());
        res.extend_from_slice(&self.conversation_index.to_le_bytes());
        res.extend_from_slice(&self.channel.to_le_bytes());
        res.extend_from_slice(&if self.expects_reply { 1_u32 } else { 0 }.to_le_bytes());

        res
    }
}

impl PayloadHeader {
    /// Creates a new payload header
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes header to bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut res = Vec::new();
        res.extend_from_slice(&self.flags.to_le_bytes());
        res.extend_from_slice(&self.aux_length.to_le_bytes());
        res.extend_from_slice(&self.total_length.to_le_bytes());

        res
    }

    /// Creates header for method invocation messages
    pub fn method_invocation() -> Self {
        Self {
            flags: 2,
            ..Default::default()
        }
    }

    /// Updates flags to indicate reply expectation
    pub fn apply_expects_reply_map(&mut self) {
        self.flags |= 0x1000
    }
}

impl Message {
    /// Reads and parses a message from an async reader
    ///
    /// # Arguments
    /// * `reader` - Async reader to read from
    ///
    /// # Returns  
    /// * `Ok(Message)` - Parsed message
    /// * `Err(Error)` - If reading/parsing fails
    ///
    /// # Errors
    /// * Various `Error` variants for IO and parsing failures
    pub async fn from_reader<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, Error> {
        let mut packet_data: Vec<u8> = Vec::new();
        // loop to deal with multiple fragments of the SAME message, assuming
        // the transport carries no other message's fragments in between.
        // `Self::read_fragment`/`Self::finish` below relax that assumption
        // for sessions that interleave concurrent calls.
        let mheader = loop {
            let (header, body) = Self::read_fragment(reader).await?;
            if header.fragment_count > 1 && header.fragment_id == 0 {
                // the first fragment of a multi-fragment message carries only a header.
                continue;
            }
            packet_data.extend(body);
            if header.fragment_id == header.fragment_count - 1 {
                break header;
            }
        };
        Self::finish(mheader, packet_data)
    }

    /// Reads a single 32-byte fragment header plus its body from the transport.
    /// Used directly by callers (like a session's receiver task) that must
    /// reassemble fragments keyed by `(channel, identifier)` rather than
    /// assume strict back-to-back ordering of one message's fragments.
    pub async fn read_fragment<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(MessageHeader, Vec<u8>), Error> {
        let mut buf = [0u8; 32];
        reader.read_exact(&mut buf).await?;
        let header = MessageHeader {
            magic: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            header_len: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            fragment_id: u16::from_le_bytes([buf[8], buf[9]]),
            fragment_count: u16::from_le_bytes([buf[10], buf[11]]),
            length: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            identifier: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            conversation_index: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
            channel: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
            expects_reply: u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]) == 1,
        };
        if header.fragment_count > 1 && header.fragment_id == 0 {
            // first fragment of a multi-fragment message: header only, no body.
            return Ok((header, Vec::new()));
        }
        let mut body = vec![0u8; header.length as usize];
        reader.read_exact(&mut body).await?;
        Ok((header, body))
    }

    /// Parses the payload header, aux data and archived payload out of the
    /// fully reassembled bytes of one logical message.
    pub fn finish(mheader: MessageHeader, packet_data: Vec<u8>) -> Result<Self, Error> {
        let buf = &packet_data[0..16];
        let pheader = PayloadHeader {
            flags: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            aux_length: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            total_length: u64::from_le_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
        };
        let aux = if pheader.aux_length > 0 {
            let buf = packet_data[16..(16 + pheader.aux_length as usize)].to_vec();
            Some(Aux::from_bytes(buf)?)
        } else {
            None
        };
        // read the data
        let need_len = (pheader.total_length - pheader.aux_length as u64) as usize;
        let buf = packet_data
            [(pheader.aux_length + 16) as usize..pheader.aux_length as usize + 16 + need_len]
            .to_vec();
        let data = if buf.is_empty() {
            None
        } else {
            Some(ns_keyed_archive::decode::from_bytes(&buf)?)
        };

        Ok(Message {
            message_header: mheader,
            payload_header: pheader,
            aux,
            data,
        })
    }

    /// Creates a new message
    ///
    /// # Arguments
    /// * `message_header` - Message metadata
    /// * `payload_header` - Payload description  
    /// * `aux` - Optional auxiliary data
    /// * `data` - Optional payload data
    pub fn new(
        message_header: MessageHeader,
        payload_header: PayloadHeader,
        aux: Option<Aux>,
        data: Option<Value>,
    ) -> Self {
        Self {
            message_header,
            payload_header,
            aux,
            data,
        }
    }

    /// Serializes message to bytes
    ///
    /// Updates length fields in headers automatically
    pub fn serialize(&self) -> Vec<u8> {
        let aux = match &self.aux {
            Some(a) => a.serialize(),
            None => Vec::new(),
        };
        let data = match &self.data {
            Some(d) => ns_keyed_archive::encode::encode_to_bytes(d.to_owned())
                .expect("Failed to encode value"),
            None => Vec::new(),
        };

        // Update the payload header
        let mut payload_header = self.payload_header.to_owned();
        payload_header.aux_length = aux.len() as u32;
        payload_header.total_length = (aux.len() + data.len()) as u64;
        let payload_header = payload_header.serialize();

        // Update the message header
        let mut message_header = self.message_header.to_owned();
        message_header.length = (payload_header.len() + aux.len() + data.len()) as u32;

        let mut res = Vec::new();
        res.extend_from_slice(&message_header.serialize());
        res.extend_from_slice(&payload_header);
        res.extend_from_slice(&aux);
        res.extend_from_slice(&data);

        res
    }
}

impl std::fmt::Debug for AuxValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuxValue::String(s) => write!(f, "String({s:?})"),
            AuxValue::Array(arr) => write!(
                f,
                "Array(len={}, first_bytes={:?})",
                arr.len(),
                &arr[..arr.len().min(10)]
            ), // Show only first 10 bytes
            AuxValue::U32(n) => write!(f, "U32({n})"),
            AuxValue::I64(n) => write!(f, "I64({n})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sample_message() -> Message {
        let header = MessageHeader::new(0, 1, 42, 0, 7, true);
        let aux = Aux::from_values(vec![
            AuxValue::U32(99),
            AuxValue::String("setConfig:".to_string()),
        ]);
        Message::new(header, PayloadHeader::method_invocation(), Some(aux), None)
    }

    #[tokio::test]
    async fn round_trips_a_single_fragment_message() {
        let bytes = sample_message().serialize();
        let mut cursor = Cursor::new(bytes);
        let decoded = Message::from_reader(&mut cursor).await.expect("decode");

        assert_eq!(decoded.message_header.identifier(), 42);
        assert_eq!(decoded.message_header.channel, 7);
        assert!(decoded.message_header.expects_reply());
        let values = decoded.aux.expect("aux present").values;
        assert_eq!(values, vec![AuxValue::U32(99), AuxValue::String("setConfig:".to_string())]);
    }

    #[tokio::test]
    async fn reassembles_fragments_in_order() {
        let message = sample_message();
        let whole = message.serialize();

        // Split the already-serialized wire bytes across three fragments,
        // mirroring the header-only-first-fragment shape `read_fragment`
        // expects for multi-fragment messages.
        let header_bytes = &whole[..32];
        let body = &whole[32..];
        let mid = body.len() / 2;

        let mut wire = Vec::new();
        let first_header = MessageHeader {
            fragment_count: 3,
            fragment_id: 0,
            length: 0,
            ..header_from_bytes(header_bytes)
        };
        wire.extend(first_header.serialize());

        let mut second_header = header_from_bytes(header_bytes);
        second_header.fragment_count = 3;
        second_header.fragment_id = 1;
        second_header.length = mid as u32;
        wire.extend(second_header.serialize());
        wire.extend_from_slice(&body[..mid]);

        let mut third_header = header_from_bytes(header_bytes);
        third_header.fragment_count = 3;
        third_header.fragment_id = 2;
        third_header.length = (body.len() - mid) as u32;
        wire.extend(third_header.serialize());
        wire.extend_from_slice(&body[mid..]);

        let mut cursor = Cursor::new(wire);
        let decoded = Message::from_reader(&mut cursor).await.expect("decode");
        assert_eq!(decoded.message_header.identifier(), 42);
        assert_eq!(decoded.aux.expect("aux present").values.len(), 2);
    }

    fn header_from_bytes(bytes: &[u8]) -> MessageHeader {
        MessageHeader {
            magic: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            header_len: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            fragment_id: u16::from_le_bytes([bytes[8], bytes[9]]),
            fragment_count: u16::from_le_bytes([bytes[10], bytes[11]]),
            length: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            identifier: u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
            conversation_index: u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
            channel: u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]),
            expects_reply: u32::from_le_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]) == 1,
        }
    }

    #[test]
    fn rejects_unknown_aux_value_type() {
        let mut bytes = vec![0u8; 16]; // aux header
        bytes.extend_from_slice(&0x0a_u32.to_le_bytes()); // null separator
        bytes.extend_from_slice(&0xff_u32.to_le_bytes()); // bogus type tag
        bytes.extend_from_slice(&0u32.to_le_bytes()); // padding so the loop reaches the match arm
        let err = Aux::from_bytes(bytes).unwrap_err();
        assert!(matches!(err, Error::UnknownAuxValueType(0xff)));
    }
}
