//! The usbmuxd control connection: wire negotiation, the device listener,
//! and handing off an opaque byte stream once `Connect` succeeds.

mod codec;
mod device;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::ReadWrite;
use codec::{BinaryCodec, Incoming, MuxCodec, OutgoingRequest, PlistCodec};

pub use device::{Connection, DeviceEvent, DeviceHandle};

#[cfg(unix)]
const DEFAULT_SOCKET_PATH: &str = "/var/run/usbmuxd";
#[cfg(windows)]
const DEFAULT_TCP_PORT: u16 = 27015;

/// Opens the platform's usbmuxd transport: a Unix domain socket on
/// macOS/Linux, a loopback TCP socket on Windows.
async fn connect_daemon_socket() -> Result<Box<dyn ReadWrite>> {
    #[cfg(unix)]
    {
        let path = std::env::var("USBMUXD_SOCKET_ADDRESS").unwrap_or_else(|_| DEFAULT_SOCKET_PATH.to_string());
        let socket = tokio::net::UnixStream::connect(path).await?;
        Ok(Box::new(socket))
    }
    #[cfg(windows)]
    {
        let socket = tokio::net::TcpStream::connect((std::net::Ipv4Addr::LOCALHOST, DEFAULT_TCP_PORT)).await?;
        Ok(Box::new(socket))
    }
}

/// A connection to the usbmuxd control socket.
///
/// Speaks the binary (v0) wire protocol by default and transparently
/// falls back to the plist (v1) protocol on [`Error::MuxVersionError`],
/// the way the reference client negotiates. Once [`MuxClient::connect_to_device`]
/// succeeds the socket becomes opaque: no further control packets may be sent
/// on it, enforced here by refusing any further `send`/`recv`.
#[derive(Debug)]
pub struct MuxClient {
    socket: Box<dyn ReadWrite>,
    codec: Box<dyn MuxCodec>,
    tag: u32,
    connected: bool,
}

impl MuxClient {
    /// Connects to the daemon and negotiates a wire version, retrying once
    /// with the plist protocol if the daemon rejects binary framing.
    pub async fn connect(client_version_string: &str, prog_name: &str) -> Result<Self> {
        let socket = connect_daemon_socket().await?;
        let mut client = Self {
            socket,
            codec: Box::new(BinaryCodec),
            tag: 1,
            connected: false,
        };
        match client.listen().await {
            Ok(()) => Ok(client),
            Err(Error::MuxVersionError { .. }) => {
                tracing::debug!("daemon rejected binary framing, retrying with plist protocol");
                let socket = connect_daemon_socket().await?;
                let mut client = Self {
                    socket,
                    codec: Box::new(PlistCodec {
                        client_version_string: client_version_string.to_string(),
                        prog_name: prog_name.to_string(),
                    }),
                    tag: 1,
                    connected: false,
                };
                client.listen().await?;
                Ok(client)
            }
            Err(e) => Err(e),
        }
    }

    fn next_tag(&mut self) -> u32 {
        let tag = self.tag;
        self.tag += 1;
        tag
    }

    async fn send_raw(&mut self, tag: u32, req: &OutgoingRequest) -> Result<()> {
        if self.connected {
            return Err(Error::MuxError(
                "mux is connected, cannot issue control packets".into(),
            ));
        }
        let frame = self.codec.encode(tag, req)?;
        self.socket.write_all(&frame).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::WriteZero {
                Error::TransportBroken
            } else {
                Error::Io(e)
            }
        })
    }

    async fn recv_raw(&mut self) -> Result<(u32, Incoming)> {
        if self.connected {
            return Err(Error::MuxError(
                "mux is connected, cannot issue control packets".into(),
            ));
        }
        let mut header = [0u8; 16];
        self.socket.read_exact(&mut header).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::TransportBroken
            } else {
                Error::Io(e)
            }
        })?;
        let length = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let raw_type = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let tag = u32::from_le_bytes(header[12..16].try_into().unwrap());

        if version != self.codec.version() {
            return Err(Error::MuxVersionError {
                expected: self.codec.version(),
                got: version,
            });
        }

        let body_len = length.checked_sub(16).ok_or_else(|| {
            Error::MuxError(format!("packet length {length} shorter than header"))
        })?;
        let mut body = vec![0u8; body_len as usize];
        self.socket.read_exact(&mut body).await?;

        let incoming = self.codec.decode(raw_type, &body)?;
        Ok((tag, incoming))
    }

    /// Sends a request and waits for its tagged `Result` reply, returning the
    /// `Number` field. Any other reply (or a tag mismatch) is a protocol error.
    async fn exchange(&mut self, req: OutgoingRequest) -> Result<i64> {
        let tag = self.next_tag();
        self.send_raw(tag, &req).await?;
        let (recv_tag, incoming) = self.recv_raw().await?;
        match incoming {
            Incoming::Result(dict) => {
                if recv_tag != tag {
                    return Err(Error::MuxError(format!(
                        "reply tag mismatch: expected {tag}, got {recv_tag}"
                    )));
                }
                dict.get("Number")
                    .and_then(|v| v.as_signed_integer())
                    .ok_or(Error::UnexpectedResponse)
            }
            _ => Err(Error::MuxError("unexpected packet type while waiting for a result".into())),
        }
    }

    /// Registers this connection as a device event listener. Once this
    /// succeeds the connection may only be used with [`MuxClient::poll_event`];
    /// it can no longer issue `Connect`.
    pub async fn listen(&mut self) -> Result<()> {
        let ret = self.exchange(OutgoingRequest::Listen).await?;
        if ret != 0 {
            return Err(Error::MuxError(format!("listen failed: error {ret}")));
        }
        Ok(())
    }

    /// Reads and returns the next `Attach`/`Detach` event. Blocks until one
    /// arrives; callers needing a timeout should wrap this in `tokio::time::timeout`.
    pub async fn poll_event(&mut self) -> Result<DeviceEvent> {
        let (_, incoming) = self.recv_raw().await?;
        match incoming {
            Incoming::Attach(d) => Ok(DeviceEvent::Attach(d)),
            Incoming::Detach(id) => Ok(DeviceEvent::Detach(id)),
            Incoming::Result(dict) => Err(Error::MuxError(format!(
                "unexpected result while listening for events: {dict:?}"
            ))),
        }
    }

    /// Issues `Connect` and, on success, hands back the now-opaque byte stream.
    /// The port is transmitted byte-swapped, matching the reference client.
    pub async fn connect_to_device(mut self, device_id: u32, port: u16) -> Result<Box<dyn ReadWrite>> {
        let swapped = port.to_be();
        let ret = self
            .exchange(OutgoingRequest::Connect {
                device_id,
                port: swapped,
            })
            .await?;
        if ret != 0 {
            return Err(Error::MuxError(format!("connect failed: error {ret}")));
        }
        self.connected = true;
        Ok(self.socket)
    }

    async fn raw_request(&mut self, message_type: &str, fields: plist::Dictionary) -> Result<plist::Dictionary> {
        let tag = self.next_tag();
        self.send_raw(
            tag,
            &OutgoingRequest::Raw {
                message_type: message_type.to_string(),
                fields,
            },
        )
        .await?;
        let (_, incoming) = self.recv_raw().await?;
        match incoming {
            Incoming::Result(dict) => Ok(dict),
            other => Err(Error::MuxError(format!(
                "unexpected packet in response to {message_type}: {other:?}"
            ))),
        }
    }

    /// `ListDevices`: a one-shot snapshot of currently attached devices,
    /// independent of the `Listen` event stream.
    pub async fn list_devices(&mut self) -> Result<Vec<DeviceHandle>> {
        let mut fields = plist::Dictionary::new();
        fields.insert("kLibUSBMuxVersion".into(), 3i64.into());
        let res = self.raw_request("ListDevices", fields).await?;
        let entries = res
            .get("DeviceList")
            .and_then(|v| v.as_array())
            .ok_or(Error::UnexpectedResponse)?;

        let mut devices = Vec::with_capacity(entries.len());
        for entry in entries {
            let dict = entry.as_dictionary().ok_or(Error::UnexpectedResponse)?;
            let device_id = dict
                .get("DeviceID")
                .and_then(|v| v.as_signed_integer())
                .ok_or(Error::UnexpectedResponse)? as u32;
            let props = dict
                .get("Properties")
                .and_then(|v| v.as_dictionary())
                .ok_or(Error::UnexpectedResponse)?;
            let serial = props
                .get("SerialNumber")
                .and_then(|v| v.as_string())
                .ok_or(Error::UnexpectedResponse)?
                .to_string();
            let product_id = props
                .get("ProductID")
                .and_then(|v| v.as_signed_integer())
                .unwrap_or(0) as u16;
            let location = props
                .get("LocationID")
                .and_then(|v| v.as_signed_integer())
                .unwrap_or(0) as u32;
            let connection = match props.get("ConnectionType").and_then(|v| v.as_string()) {
                Some("USB") => Connection::Usb,
                Some(other) => Connection::Unknown(other.to_string()),
                None => Connection::Unknown(String::new()),
            };
            devices.push(DeviceHandle {
                device_id,
                product_id,
                serial,
                location,
                connection,
            });
        }
        Ok(devices)
    }

    /// `ReadPairRecord`: fetches a device's pair record as stored by usbmuxd
    /// itself (only present on iOS >= 13.0 devices usbmuxd has paired with).
    pub async fn read_pair_record(&mut self, udid: &str) -> Result<Vec<u8>> {
        let mut fields = plist::Dictionary::new();
        fields.insert("PairRecordID".into(), udid.into());
        let res = self.raw_request("ReadPairRecord", fields).await?;
        match res.get("PairRecordData") {
            Some(plist::Value::Data(d)) => Ok(d.clone()),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// `ReadBUID`: the system-wide identifier usbmuxd assigns this host.
    pub async fn read_buid(&mut self) -> Result<String> {
        let res = self
            .raw_request("ReadBUID", plist::Dictionary::new())
            .await?;
        match res.get("BUID") {
            Some(plist::Value::String(s)) => Ok(s.clone()),
            _ => Err(Error::UnexpectedResponse),
        }
    }
}

/// Polls the listener for attach/detach events until a device matching
/// `serial` (or, if `None`, any device) shows up, bounded by `max_attempts`
/// polls of up to `timeout` each.
pub async fn find_device(
    client_version_string: &str,
    prog_name: &str,
    serial: Option<&str>,
    timeout: std::time::Duration,
    max_attempts: usize,
) -> Result<DeviceHandle> {
    let mut client = MuxClient::connect(client_version_string, prog_name).await?;
    let mut known: Vec<DeviceHandle> = Vec::new();

    for _ in 0..max_attempts {
        match tokio::time::timeout(timeout, client.poll_event()).await {
            Ok(Ok(DeviceEvent::Attach(d))) => {
                let matches = serial.map(|s| s == d.serial).unwrap_or(true);
                if matches {
                    return Ok(d);
                }
                known.push(d);
            }
            Ok(Ok(DeviceEvent::Detach(id))) => known.retain(|d| d.device_id != id),
            Ok(Err(e)) => return Err(e),
            Err(_) => continue, // timed out this attempt, try again
        }
    }

    Err(Error::NoMuxDeviceFound)
}
