// Error taxonomy for the mux, lockdown and instruments layers.

use thiserror::Error;

/// Errors surfaced by every layer of the client: the usbmux transport,
/// the lockdown pairing/session protocol, and the instruments RPC layer.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// No usbmuxd-advertised device matched the request within the polling budget.
    #[error("no mux device found")]
    NoMuxDeviceFound,

    /// The mux daemon replied with a different wire version than the one we sent.
    #[error("mux version mismatch: expected {expected}, got {got}")]
    MuxVersionError { expected: u32, got: u32 },

    /// A malformed or out-of-sequence mux control packet.
    #[error("mux protocol error: {0}")]
    MuxError(String),

    /// The underlying socket made zero progress on a read or write.
    #[error("transport broken")]
    TransportBroken,

    /// Lockdown could not determine the device's identifier (UDID/ECID).
    #[error("failed to initialize device identity")]
    InitializationError,

    /// The device reported `PasswordProtected` while pairing.
    #[error("device is locked and not trusted")]
    NotTrustedError,

    /// Pairing failed but may succeed on retry (e.g. trust dialog dismissed).
    #[error("pairing error: {0}")]
    PairingError(String),

    /// Pairing failed in a way that retrying will not fix.
    #[error("fatal pairing error: {0}")]
    FatalPairingError(String),

    /// No usable pair record could be found or produced for this device.
    #[error("device is not paired")]
    NotPairedError,

    /// A caller-supplied argument failed validation before any request was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `StartService` was rejected by lockdown.
    #[error("failed to start service {0}: {1}")]
    StartServiceError(String, String),

    /// `StopSession` was rejected by lockdown.
    #[error("failed to stop lockdown session")]
    CannotStopSessionError,

    /// The RPC session was torn down while a call was outstanding.
    #[error("instruments session closed")]
    SessionClosed,

    /// An instruments message referenced a channel we don't know about.
    #[error("unknown channel {0}")]
    UnknownChannel(u32),

    /// The device returned something we didn't ask for or can't parse.
    #[error("unexpected response from device")]
    UnexpectedResponse,

    /// No pairing file is available and none could be produced.
    #[error("no pairing file available")]
    NoPairingFile,

    /// An untyped `Error` field in a lockdown reply we don't special-case.
    #[error("lockdown error: {0}")]
    LockdownError(String),

    #[error("device socket io failed")]
    Io(#[from] std::io::Error),

    #[error("tls error")]
    Tls(#[from] openssl::ssl::Error),

    #[error("tls handshake error")]
    TlsStack(#[from] openssl::error::ErrorStack),

    #[error("plist (de)serialization failed")]
    Plist(#[from] plist::Error),

    #[error("nskeyedarchive conversion failed")]
    Archive(#[from] ns_keyed_archive::ConverterError),

    #[error("bytes are not valid utf8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("certificate generation failed: {0}")]
    Cert(String),

    #[error("not enough bytes: expected {expected}, got {got}")]
    NotEnoughBytes { expected: usize, got: usize },

    /// An instruments auxiliary value carried a type tag we don't decode.
    #[error("unknown aux value type {0}")]
    UnknownAuxValueType(u32),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Maps a lockdown `Error` string (from a `GetValue`/`SetValue`/`StartService`/... reply)
    /// to a typed variant. Unknown strings become an `UnexpectedResponse`-carrying string
    /// wrapped in `PairingError`/`StartServiceError` by the caller, which knows the context.
    pub(crate) fn from_device_error_type(e: &str) -> Option<Self> {
        match e {
            "PasswordProtected" => Some(Self::NotTrustedError),
            "PairingDialogResponsePending" => Some(Self::PairingError(e.to_string())),
            "UserDeniedPairing" => Some(Self::FatalPairingError(e.to_string())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_device_error_types() {
        assert!(matches!(
            Error::from_device_error_type("PasswordProtected"),
            Some(Error::NotTrustedError)
        ));
        assert!(matches!(
            Error::from_device_error_type("UserDeniedPairing"),
            Some(Error::FatalPairingError(_))
        ));
        assert!(matches!(
            Error::from_device_error_type("PairingDialogResponsePending"),
            Some(Error::PairingError(_))
        ));
    }

    #[test]
    fn unknown_device_error_type_maps_to_none() {
        assert!(Error::from_device_error_type("SomethingElse").is_none());
    }
}
