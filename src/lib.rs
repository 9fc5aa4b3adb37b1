// Jackson Coxson
// Adapted for a single usbmux + lockdown + instruments pipeline.

pub mod archiver;
pub mod ca;
pub mod config;
pub mod error;
pub mod instruments;
pub mod lockdown;
pub mod mux;
pub mod pairing_file;
mod util;

use std::io::BufWriter;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use error::{Error, Result};

/// A trait combining all required characteristics for a device communication socket.
///
/// Tokio's `TcpStream` and `UnixStream` implement this trait, as does the
/// `tokio_openssl::SslStream` wrapper produced by [`DeviceLink::start_tls`].
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// A framed plist connection to a device, as handed back by [`mux::MuxClient::connect_to_device`].
///
/// Every lockdown and instruments-bootstrap exchange rides on this same
/// `u32 BE length | XML plist` framing; [`DeviceLink::start_tls`] swaps the
/// underlying socket for a TLS stream in place once a session is established.
#[derive(Debug)]
pub struct DeviceLink {
    socket: Option<Box<dyn ReadWrite>>,
    label: String,
}

impl DeviceLink {
    pub fn new(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            label: label.into(),
        }
    }

    pub fn into_socket(mut self) -> Option<Box<dyn ReadWrite>> {
        self.socket.take()
    }

    pub async fn send_plist(&mut self, message: plist::Value) -> Result<()> {
        let socket = self.socket.as_mut().ok_or(Error::TransportBroken)?;
        let buf = Vec::new();
        let mut writer = BufWriter::new(buf);
        message.to_writer_xml(&mut writer).map_err(Error::Plist)?;
        let message = writer.into_inner().expect("BufWriter never fails to flush into a Vec");
        let len = message.len() as u32;
        socket.write_all(&len.to_be_bytes()).await?;
        socket.write_all(&message).await?;
        socket.flush().await?;
        Ok(())
    }

    pub async fn read_plist(&mut self) -> Result<plist::Dictionary> {
        let socket = self.socket.as_mut().ok_or(Error::TransportBroken)?;
        let mut len_buf = [0u8; 4];
        socket.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        socket.read_exact(&mut buf).await?;
        let value: plist::Value = plist::from_bytes(&buf)?;
        debug!(label = %self.label, "received plist message");
        let dict = value.into_dictionary().ok_or(Error::UnexpectedResponse)?;

        if let Some(e) = dict.get("Error") {
            let e = match e {
                plist::Value::String(e) => e.clone(),
                plist::Value::Integer(e) => dict
                    .get("ErrorString")
                    .and_then(|v| v.as_string())
                    .map(str::to_string)
                    .unwrap_or_else(|| e.to_string()),
                _ => return Err(Error::UnexpectedResponse),
            };
            return Err(Error::from_device_error_type(&e).unwrap_or_else(|| {
                let msg = match dict.get("ErrorDescription").and_then(|v| v.as_string()) {
                    Some(desc) => format!("{e} ({desc})"),
                    None => e,
                };
                Error::LockdownError(msg)
            }));
        }

        Ok(dict)
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let socket = self.socket.as_mut().ok_or(Error::TransportBroken)?;
        socket.write_all(bytes).await?;
        socket.flush().await?;
        Ok(())
    }

    pub fn as_reader(&mut self) -> std::result::Result<&mut (dyn ReadWrite + '_), Error> {
        match &mut self.socket {
            Some(socket) => Ok(&mut **socket),
            None => Err(Error::TransportBroken),
        }
    }

    /// Upgrades the connection to TLS using the device's pair record.
    ///
    /// `legacy` requests the SSL3/TLS1 fallback pre-iOS-5 devices require;
    /// server-certificate verification is intentionally disabled, matching
    /// the trust model lockdown already established during pairing.
    pub async fn start_tls(&mut self, pairing_file: &pairing_file::PairingFile, legacy: bool) -> Result<()> {
        let mut connector = openssl::ssl::SslConnector::builder(openssl::ssl::SslMethod::tls())?;
        if legacy {
            connector.set_min_proto_version(Some(openssl::ssl::SslVersion::SSL3))?;
            connector.set_max_proto_version(Some(openssl::ssl::SslVersion::TLS1))?;
            connector.set_cipher_list("ALL:!aNULL:!eNULL:@SECLEVEL=0")?;
            connector.set_options(openssl::ssl::SslOptions::ALLOW_UNSAFE_LEGACY_RENEGOTIATION);
        }

        let mut ssl = connector.build().configure()?.into_ssl("device")?;
        ssl.set_certificate(&pairing_file.host_certificate)?;
        ssl.set_private_key(&pairing_file.host_private_key)?;
        ssl.set_verify(openssl::ssl::SslVerifyMode::empty());

        let socket = self.socket.take().ok_or(Error::TransportBroken)?;
        let mut stream = tokio_openssl::SslStream::new(ssl, socket)?;
        std::pin::Pin::new(&mut stream).connect().await?;
        self.socket = Some(Box::new(stream));
        Ok(())
    }
}
