//! Pair-record persistence: the same priority chain the reference client
//! uses to locate a usable pair record before falling back to a fresh pairing.

use crate::error::Result;
use crate::mux::MuxClient;
use crate::pairing_file::PairingFile;
use crate::util::{system_lockdown_dir, user_cache_dir};

/// Looks up a pair record for `identifier` (UDID or hex ECID), trying in order:
/// 1. the OS-managed lockdown directory (iTunes/usbmuxd's own store)
/// 2. usbmuxd's `ReadPairRecord`, for iOS >= 13 devices usbmuxd paired itself
/// 3. this program's own user cache directory, from a previous full pairing
///
/// Returns `Ok(None)` if none of the three have a record; this is not an
/// error; the caller falls back to [`super::pairing::pair_full`].
pub async fn load_pair_record(
    identifier: &str,
    mux: &mut MuxClient,
    ios_major_version: Option<u8>,
    program_name: &str,
) -> Result<Option<PairingFile>> {
    let system_path = system_lockdown_dir().join(format!("{identifier}.plist"));
    if let Ok(bytes) = std::fs::read(&system_path) {
        tracing::debug!(path = %system_path.display(), "using system lockdown pair record");
        return Ok(Some(PairingFile::from_bytes(&bytes)?));
    }

    if ios_major_version.map(|v| v >= 13).unwrap_or(false) {
        if let Ok(bytes) = mux.read_pair_record(identifier).await {
            tracing::debug!("using pair record from usbmuxd");
            return Ok(Some(PairingFile::from_bytes(&bytes)?));
        }
    }

    let cache_path = user_cache_dir(program_name).join(format!("{identifier}.plist"));
    if let Ok(bytes) = std::fs::read(&cache_path) {
        tracing::debug!(path = %cache_path.display(), "using cached pair record");
        return Ok(Some(PairingFile::from_bytes(&bytes)?));
    }

    Ok(None)
}

/// Persists a freshly produced pair record to this program's user cache
/// directory (the system lockdown directory is typically root-owned and
/// not writable by an unprivileged client).
pub fn store_pair_record(pairing_file: PairingFile, identifier: &str, program_name: &str) -> Result<()> {
    let dir = user_cache_dir(program_name);
    std::fs::create_dir_all(&dir)?;
    pairing_file.write_atomically(dir.join(format!("{identifier}.plist")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::generate_certificates;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::X509;
    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::{RsaPrivateKey, RsaPublicKey};

    fn sample_pairing_file() -> PairingFile {
        let mut rng = rsa::rand_core::OsRng;
        let device_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let device_public_pem = RsaPublicKey::from(&device_key)
            .to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();
        let ca = generate_certificates(device_public_pem.as_bytes(), None).unwrap();
        let host_pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

        PairingFile {
            device_certificate: X509::from_pem(&ca.dev_cert).unwrap(),
            host_private_key: PKey::private_key_from_pem(&ca.private_key).unwrap(),
            host_certificate: X509::from_pem(&ca.host_cert).unwrap(),
            root_private_key: host_pkey,
            root_certificate: X509::from_pem(&ca.host_cert).unwrap(),
            system_buid: "test-buid".into(),
            host_id: "test-host-id".into(),
            escrow_bag: vec![],
            wifi_mac_address: None,
            udid: None,
        }
    }

    #[test]
    fn store_then_user_cache_lookup_finds_it() {
        let program_name = format!("devscope-store-test-{}", std::process::id());
        let identifier = "test-device-udid";

        store_pair_record(sample_pairing_file(), identifier, &program_name).unwrap();

        let cache_path = user_cache_dir(&program_name).join(format!("{identifier}.plist"));
        assert!(cache_path.exists());
        let loaded = PairingFile::from_bytes(&std::fs::read(&cache_path).unwrap()).unwrap();
        assert_eq!(loaded.host_id, "test-host-id");

        std::fs::remove_dir_all(user_cache_dir(&program_name)).unwrap();
    }
}
