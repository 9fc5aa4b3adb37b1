//! Wire codecs for the usbmuxd control protocol.
//!
//! usbmuxd speaks one of two wire versions on the same outer frame
//! (`u32 length | u32 version | u32 type | u32 tag | payload`): a fixed-layout
//! binary encoding (version 0) for old daemons, and a plist-wrapped encoding
//! (version 1, outer `type` always `PLIST`) for everything since. A fresh
//! connection always speaks binary first; a `MuxVersionError` on the reply
//! means the daemon only understands plist, and the caller reconnects with
//! [`PlistCodec`] instead.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::mux::device::{Connection, DeviceHandle};

pub(super) const TYPE_RESULT: u32 = 1;
pub(super) const TYPE_CONNECT: u32 = 2;
pub(super) const TYPE_LISTEN: u32 = 3;
pub(super) const TYPE_DEVICE_ADD: u32 = 4;
pub(super) const TYPE_DEVICE_REMOVE: u32 = 5;
const TYPE_PLIST: u32 = 8;

/// A request to be encoded onto the wire by a [`MuxCodec`].
#[derive(Debug, Clone)]
pub enum OutgoingRequest {
    Listen,
    Connect { device_id: u32, port: u16 },
    /// A plist-only request identified by its `MessageType` string, used for
    /// one-shot calls (`ListDevices`, `ReadPairRecord`, `ReadBUID`) that have
    /// no meaning under the binary protocol.
    Raw {
        message_type: String,
        fields: plist::Dictionary,
    },
}

/// A decoded incoming packet, independent of which codec produced it.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// A `Result` reply, or any plist reply whose `MessageType` we don't
    /// otherwise interpret (the field dictionary is passed through so the
    /// caller can pull out `PairRecordData`, `BUID`, `DeviceList`, etc).
    Result(plist::Dictionary),
    Attach(DeviceHandle),
    Detach(u32),
}

/// The `{pack, unpack}` capability of a single usbmuxd wire version,
/// dispatched dynamically so [`super::MuxClient`] can renegotiate without
/// caring which version it ends up using.
pub(super) trait MuxCodec: std::fmt::Debug + Send + Sync {
    fn version(&self) -> u32;

    /// Encodes the full outer frame (header + payload) for `req`.
    fn encode(&self, tag: u32, req: &OutgoingRequest) -> Result<Vec<u8>>;

    /// Decodes the inner type + payload, given the outer frame's `type` field
    /// and everything after the 16-byte header.
    fn decode(&self, raw_type: u32, body: &[u8]) -> Result<Incoming>;
}

fn frame(version: u32, ty: u32, tag: u32, payload: &[u8]) -> Vec<u8> {
    let length = 16 + payload.len() as u32;
    let mut out = Vec::with_capacity(length as usize);
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&version.to_le_bytes());
    out.extend_from_slice(&ty.to_le_bytes());
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Version 0: fixed-layout binary structs, as spoken by old usbmuxd builds.
#[derive(Debug, Default)]
pub(super) struct BinaryCodec;

impl MuxCodec for BinaryCodec {
    fn version(&self) -> u32 {
        0
    }

    fn encode(&self, tag: u32, req: &OutgoingRequest) -> Result<Vec<u8>> {
        let (ty, payload) = match req {
            OutgoingRequest::Listen => (TYPE_LISTEN, Vec::new()),
            OutgoingRequest::Connect { device_id, port } => {
                let mut payload = vec![0u8; 8];
                LittleEndian::write_u32(&mut payload[0..4], *device_id);
                LittleEndian::write_u16(&mut payload[4..6], *port);
                // payload[6..8] stays zeroed padding.
                (TYPE_CONNECT, payload)
            }
            OutgoingRequest::Raw { .. } => {
                return Err(Error::MuxError(
                    "binary protocol has no representation for raw plist requests".into(),
                ));
            }
        };
        Ok(frame(self.version(), ty, tag, &payload))
    }

    fn decode(&self, raw_type: u32, body: &[u8]) -> Result<Incoming> {
        match raw_type {
            TYPE_RESULT => {
                if body.len() < 4 {
                    return Err(Error::NotEnoughBytes {
                        expected: 4,
                        got: body.len(),
                    });
                }
                let number = LittleEndian::read_u32(&body[0..4]);
                let mut dict = plist::Dictionary::new();
                dict.insert("Number".into(), (number as i64).into());
                Ok(Incoming::Result(dict))
            }
            TYPE_DEVICE_ADD => {
                if body.len() < 268 {
                    return Err(Error::NotEnoughBytes {
                        expected: 268,
                        got: body.len(),
                    });
                }
                let device_id = LittleEndian::read_u32(&body[0..4]);
                let product_id = LittleEndian::read_u16(&body[4..6]);
                let serial_raw = &body[6..262];
                let nul = serial_raw
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(serial_raw.len());
                let serial = String::from_utf8_lossy(&serial_raw[..nul]).into_owned();
                let location = LittleEndian::read_u32(&body[264..268]);
                Ok(Incoming::Attach(DeviceHandle {
                    device_id,
                    product_id,
                    serial,
                    location,
                    connection: Connection::Usb,
                }))
            }
            TYPE_DEVICE_REMOVE => {
                if body.len() < 4 {
                    return Err(Error::NotEnoughBytes {
                        expected: 4,
                        got: body.len(),
                    });
                }
                Ok(Incoming::Detach(LittleEndian::read_u32(&body[0..4])))
            }
            other => Err(Error::MuxError(format!(
                "invalid incoming response type {other}"
            ))),
        }
    }
}

/// Version 1: every packet is a plist dictionary wrapped in a `type = PLIST` frame.
#[derive(Debug, Default)]
pub(super) struct PlistCodec {
    pub(super) client_version_string: String,
    pub(super) prog_name: String,
}

impl MuxCodec for PlistCodec {
    fn version(&self) -> u32 {
        1
    }

    fn encode(&self, tag: u32, req: &OutgoingRequest) -> Result<Vec<u8>> {
        let mut dict = plist::Dictionary::new();
        let message_type = match req {
            OutgoingRequest::Listen => "Listen",
            OutgoingRequest::Connect { device_id, port } => {
                dict.insert("DeviceID".into(), (*device_id as i64).into());
                dict.insert("PortNumber".into(), (*port as i64).into());
                "Connect"
            }
            OutgoingRequest::Raw {
                message_type,
                fields,
            } => {
                for (k, v) in fields {
                    dict.insert(k.clone(), v.clone());
                }
                message_type.as_str()
            }
        };
        dict.insert("MessageType".into(), message_type.into());
        dict.insert(
            "ClientVersionString".into(),
            self.client_version_string.clone().into(),
        );
        dict.insert("ProgName".into(), self.prog_name.clone().into());

        let mut buf = Vec::new();
        plist::Value::Dictionary(dict).to_writer_xml(&mut buf)?;
        Ok(frame(self.version(), TYPE_PLIST, tag, &buf))
    }

    fn decode(&self, raw_type: u32, body: &[u8]) -> Result<Incoming> {
        if raw_type != TYPE_PLIST {
            return Err(Error::MuxError(format!(
                "received non-plist type {raw_type}"
            )));
        }
        let value: plist::Value = plist::from_bytes(body)?;
        let dict = value
            .into_dictionary()
            .ok_or(Error::UnexpectedResponse)?;

        match dict.get("MessageType").and_then(|v| v.as_string()) {
            Some("Attached") => {
                let props = dict
                    .get("Properties")
                    .and_then(|v| v.as_dictionary())
                    .ok_or(Error::UnexpectedResponse)?;
                let device_id = dict
                    .get("DeviceID")
                    .and_then(|v| v.as_signed_integer())
                    .ok_or(Error::UnexpectedResponse)? as u32;
                let product_id = props
                    .get("ProductID")
                    .and_then(|v| v.as_signed_integer())
                    .unwrap_or(0) as u16;
                let serial = props
                    .get("SerialNumber")
                    .and_then(|v| v.as_string())
                    .ok_or(Error::UnexpectedResponse)?
                    .to_string();
                let location = props
                    .get("LocationID")
                    .and_then(|v| v.as_signed_integer())
                    .unwrap_or(0) as u32;
                let connection = match props.get("ConnectionType").and_then(|v| v.as_string()) {
                    Some("USB") => Connection::Usb,
                    Some("Network") => match props.get("NetworkAddress") {
                        Some(plist::Value::Data(d)) => parse_network_address(d.as_slice())?,
                        _ => return Err(Error::UnexpectedResponse),
                    },
                    Some(other) => Connection::Unknown(other.to_string()),
                    None => Connection::Unknown(String::new()),
                };
                Ok(Incoming::Attach(DeviceHandle {
                    device_id,
                    product_id,
                    serial,
                    location,
                    connection,
                }))
            }
            Some("Detached") => {
                let device_id = dict
                    .get("DeviceID")
                    .and_then(|v| v.as_signed_integer())
                    .ok_or(Error::UnexpectedResponse)? as u32;
                Ok(Incoming::Detach(device_id))
            }
            // "Result" replies, and bare responses to one-shot Raw requests
            // (ListDevices/ReadPairRecord/ReadBUID) carry no MessageType we
            // need to special-case: hand the whole dict back.
            _ => Ok(Incoming::Result(dict)),
        }
    }
}

fn parse_network_address(addr: &[u8]) -> Result<Connection> {
    use std::net::{Ipv4Addr, Ipv6Addr};
    if addr.is_empty() {
        return Err(Error::UnexpectedResponse);
    }
    match addr[0] {
        0x02 if addr.len() >= 8 => Ok(Connection::Network(
            Ipv4Addr::new(addr[4], addr[5], addr[6], addr[7]).into(),
        )),
        0x1e if addr.len() >= 24 => Ok(Connection::Network(
            Ipv6Addr::new(
                u16::from_be_bytes([addr[8], addr[9]]),
                u16::from_be_bytes([addr[10], addr[11]]),
                u16::from_be_bytes([addr[12], addr[13]]),
                u16::from_be_bytes([addr[14], addr[15]]),
                u16::from_be_bytes([addr[16], addr[17]]),
                u16::from_be_bytes([addr[18], addr[19]]),
                u16::from_be_bytes([addr[20], addr[21]]),
                u16::from_be_bytes([addr[22], addr[23]]),
            )
            .into(),
        )),
        _ => Err(Error::UnexpectedResponse),
    }
}
