//! Caller-overridable configuration, mirroring the teacher's `IdeviceProvider`
//! abstraction plus usbmuxd's `USBMUXD_SOCKET_ADDRESS` environment override.

use crate::util::{host_id, system_buid, system_lockdown_dir, user_cache_dir};

/// Everything the mux/lockdown/instruments layers need that isn't part of a
/// single request: where to find usbmuxd, where to cache pair records, and
/// the host identity fields lockdown pairing sends.
///
/// `Config::default()` derives every field from the OS the way the reference
/// client does; callers override only the fields they care about.
#[derive(Debug, Clone)]
pub struct Config {
    /// Overrides `USBMUXD_SOCKET_ADDRESS` for this process when set, instead
    /// of relying on the ambient environment variable the mux layer already
    /// honors.
    pub mux_socket_override: Option<String>,
    /// Program name used both as this client's mux connection label and as
    /// the subdirectory of the user cache dir where pair records are stored.
    pub program_name: String,
    /// Root of the pair-record cache; defaults to the OS cache dir joined
    /// with `program_name`.
    pub cache_dir: std::path::PathBuf,
    /// `HostID` sent during pairing.
    pub host_id: String,
    /// `SystemBUID` sent during pairing.
    pub system_buid: String,
}

impl Config {
    /// Builds a `Config` with OS-derived defaults for everything but the
    /// program name, which the caller must supply (it shapes the cache path
    /// and the mux connection label).
    pub fn new(program_name: impl Into<String>) -> Self {
        let program_name = program_name.into();
        Self {
            mux_socket_override: None,
            cache_dir: user_cache_dir(&program_name),
            program_name,
            host_id: host_id(),
            system_buid: system_buid(),
        }
    }

    /// The OS-managed lockdown pair-record directory (read-only to us; see
    /// [`crate::lockdown::store`]).
    pub fn system_lockdown_dir(&self) -> std::path::PathBuf {
        system_lockdown_dir()
    }

    /// Applies `mux_socket_override` to this process's environment, so the
    /// next [`crate::mux::MuxClient::connect`] picks it up. A no-op if unset.
    pub fn apply_mux_override(&self) {
        if let Some(addr) = &self.mux_socket_override {
            // SAFETY: single-threaded call site expected at startup, before
            // any mux connection is opened; matches the env-var contract
            // `USBMUXD_SOCKET_ADDRESS` already has in the mux layer.
            unsafe { std::env::set_var("USBMUXD_SOCKET_ADDRESS", addr) };
        }
    }
}
