//! The lockdown service: device info queries, service discovery, and the
//! TLS session handshake every subsequent service rides on top of.

pub mod pairing;
pub mod store;

use tracing::error;

use crate::error::{Error, Result};
use crate::pairing_file::PairingFile;
use crate::{DeviceLink, ReadWrite};

pub const LOCKDOWND_PORT: u16 = 62078;

/// Client for the `com.apple.mobile.lockdown` service.
///
/// This is the first service connected to on every session: it identifies
/// the device, negotiates the TLS session, and hands out the port for every
/// other service (including instruments) via [`LockdownClient::start_service`].
#[derive(Debug)]
pub struct LockdownClient {
    link: DeviceLink,
    label: String,
    session_active: bool,
    session_id: Option<String>,
    paired: bool,
    product_version: Option<String>,
    udid: Option<String>,
}

impl LockdownClient {
    /// Connects to lockdown on `socket` and verifies the service greeting.
    pub async fn connect(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let mut link = DeviceLink::new(socket, label.clone());

        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), label.clone().into());
        req.insert("Request".into(), "QueryType".into());
        link.send_plist(plist::Value::Dictionary(req)).await?;

        let resp = link.read_plist().await?;
        match resp.get("Type").and_then(|v| v.as_string()) {
            Some("com.apple.mobile.lockdown") => {}
            _ => return Err(Error::UnexpectedResponse),
        }

        Ok(Self {
            link,
            label,
            session_active: false,
            session_id: None,
            paired: false,
            product_version: None,
            udid: None,
        })
    }

    pub async fn get_value(&mut self, key: Option<&str>, domain: Option<&str>) -> Result<plist::Value> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.label.clone().into());
        req.insert("Request".into(), "GetValue".into());
        if let Some(key) = key {
            req.insert("Key".into(), key.into());
        }
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.link.send_plist(plist::Value::Dictionary(req)).await?;
        let resp = self.link.read_plist().await?;
        resp.get("Value").cloned().ok_or(Error::UnexpectedResponse)
    }

    pub async fn set_value(&mut self, key: &str, value: plist::Value, domain: Option<&str>) -> Result<()> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.label.clone().into());
        req.insert("Request".into(), "SetValue".into());
        req.insert("Key".into(), key.into());
        req.insert("Value".into(), value);
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.link.send_plist(plist::Value::Dictionary(req)).await?;
        self.link.read_plist().await?;
        Ok(())
    }

    /// Negotiates `StartSession`, capturing `SessionID`, and upgrades the
    /// link to TLS with the pair record's host certificate only if the reply
    /// sets `EnableSessionSSL=true`. `legacy` forces the SSL3/TLS1 ciphers
    /// iOS < 5 devices require, chosen from `product_version()`'s major digit.
    pub async fn start_session(&mut self, pairing_file: &PairingFile) -> Result<()> {
        let legacy = self
            .product_version()
            .await
            .ok()
            .and_then(|v| v.split('.').next().map(str::to_string))
            .and_then(|major| major.parse::<u8>().ok())
            .map(|major| major < 5)
            .unwrap_or(false);

        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.label.clone().into());
        req.insert("Request".into(), "StartSession".into());
        req.insert("HostID".into(), pairing_file.host_id.clone().into());
        req.insert("SystemBUID".into(), pairing_file.system_buid.clone().into());
        self.link.send_plist(plist::Value::Dictionary(req)).await?;

        let resp = self.link.read_plist().await?;
        let session_id = match resp.get("SessionID").and_then(|v| v.as_string()) {
            Some(id) => id.to_string(),
            None => {
                return Err(match resp.get("Error").and_then(|v| v.as_string()) {
                    Some(err) => Error::from_device_error_type(err).unwrap_or(Error::LockdownError(err.to_string())),
                    None => Error::UnexpectedResponse,
                });
            }
        };
        self.session_id = Some(session_id);

        if matches!(resp.get("EnableSessionSSL"), Some(plist::Value::Boolean(true))) {
            self.link.start_tls(pairing_file, legacy).await?;
        }

        self.session_active = true;
        self.paired = true;

        if let Ok(v) = self.get_value(Some("UniqueDeviceID"), None).await {
            self.udid = v.as_string().map(str::to_string);
        }
        Ok(())
    }

    /// Requests a service by identifier, returning its port and whether the
    /// caller must TLS-upgrade the resulting connection. `escrow_bag`, if
    /// given, is forwarded so the device can skip re-confirming trust.
    pub async fn start_service(&mut self, identifier: &str, escrow_bag: Option<&[u8]>) -> Result<(u16, bool)> {
        if !self.paired {
            return Err(Error::NotPairedError);
        }
        if identifier.is_empty() {
            return Err(Error::InvalidArgument("service name must not be empty".into()));
        }

        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.label.clone().into());
        req.insert("Request".into(), "StartService".into());
        req.insert("Service".into(), identifier.into());
        if let Some(bag) = escrow_bag {
            req.insert("EscrowBag".into(), plist::Value::Data(bag.to_vec()));
        }
        self.link.send_plist(plist::Value::Dictionary(req)).await?;

        let resp = self.link.read_plist().await.map_err(|e| match e {
            Error::LockdownError(msg) => Error::StartServiceError(identifier.to_string(), msg),
            other => other,
        })?;

        let ssl = matches!(resp.get("EnableServiceSSL"), Some(plist::Value::Boolean(true)));
        match resp.get("Port").and_then(|v| v.as_unsigned_integer()) {
            Some(port) => Ok((port as u16, ssl)),
            None => {
                error!("StartService reply for {identifier} had no Port");
                Err(Error::UnexpectedResponse)
            }
        }
    }

    pub async fn stop_session(&mut self) -> Result<()> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.label.clone().into());
        req.insert("Request".into(), "StopSession".into());
        if let Some(session_id) = self.session_id.take() {
            req.insert("SessionID".into(), session_id.into());
        }
        self.link.send_plist(plist::Value::Dictionary(req)).await?;
        self.link
            .read_plist()
            .await
            .map_err(|_| Error::CannotStopSessionError)?;
        self.session_active = false;
        Ok(())
    }

    /// The device's iOS version, cached after the first successful fetch.
    pub async fn product_version(&mut self) -> Result<String> {
        if let Some(v) = &self.product_version {
            return Ok(v.clone());
        }
        let v = self
            .get_value(Some("ProductVersion"), None)
            .await?
            .as_string()
            .map(str::to_string)
            .ok_or(Error::UnexpectedResponse)?;
        self.product_version = Some(v.clone());
        Ok(v)
    }

    /// The device's UDID, cached from `StartSession` if available, else fetched fresh.
    pub async fn udid(&mut self) -> Result<String> {
        if let Some(u) = &self.udid {
            return Ok(u.clone());
        }
        let u = self
            .get_value(Some("UniqueDeviceID"), None)
            .await?
            .as_string()
            .map(str::to_string)
            .ok_or(Error::InitializationError)?;
        self.udid = Some(u.clone());
        Ok(u)
    }

    pub fn into_socket(self) -> Option<Box<dyn ReadWrite>> {
        self.link.into_socket()
    }

    pub(crate) fn link_mut(&mut self) -> &mut DeviceLink {
        &mut self.link
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }
}
