//! Pair-record validation and first-time pairing.
//!
//! Mirrors the reference client's `_pair`/`_validate_pairing`/`_pair_full`
//! sequence: try an existing pair record first, and only fall back to a full
//! re-pairing (which triggers the on-device trust dialog) when validation fails.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use super::LockdownClient;
use crate::ca::generate_certificates;
use crate::error::{Error, Result};
use crate::pairing_file::PairingFile;

/// Runs the full pairing pipeline: validate `existing`, if given, against
/// `lockdown`; on success, that's the pair record to use. If validation is
/// refused (or no record was given), perform a full pair, persist it via
/// `persist_new_record`, reopen the lockdown connection with `reconnect`
/// (full pairing makes the device drop the old one), and validate the new
/// record on the fresh connection. A second validation failure is fatal.
pub async fn pair<F, Fut, P>(
    mut lockdown: LockdownClient,
    existing: Option<PairingFile>,
    host_id: &str,
    system_buid: &str,
    reconnect: F,
    persist_new_record: P,
) -> Result<(LockdownClient, PairingFile)>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<LockdownClient>>,
    P: FnOnce(&PairingFile) -> Result<()>,
{
    if let Some(pairing_file) = existing {
        if validate_pair(&mut lockdown, &pairing_file).await.is_ok() {
            return Ok((lockdown, pairing_file));
        }
    }

    let pairing_file = pair_full(&mut lockdown, host_id, system_buid).await?;
    persist_new_record(&pairing_file)?;

    let mut lockdown = reconnect().await?;
    if validate_pair(&mut lockdown, &pairing_file).await.is_ok() {
        return Ok((lockdown, pairing_file));
    }

    Err(Error::FatalPairingError(
        "pair record rejected validation after full pairing".into(),
    ))
}

/// `ValidatePair` + `StartSession` against an existing pair record.
///
/// `ValidatePair` is only sent to devices older than iOS 11, which require
/// the extra round trip; newer devices accept `StartSession` directly.
pub async fn validate_pair(lockdown: &mut LockdownClient, pairing_file: &PairingFile) -> Result<()> {
    let needs_validate_pair = lockdown
        .product_version()
        .await
        .ok()
        .and_then(|v| v.split('.').next().map(str::to_string))
        .and_then(|major| major.parse::<u8>().ok())
        .map(|major| major < 11)
        .unwrap_or(true);

    if needs_validate_pair {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), lockdown.label().to_string().into());
        req.insert("Request".into(), "ValidatePair".into());
        req.insert(
            "PairRecord".into(),
            plist::Value::Dictionary(pair_record_dict(pairing_file)?),
        );
        lockdown.link_mut().send_plist(plist::Value::Dictionary(req)).await?;
        lockdown.link_mut().read_plist().await?;
    }

    lockdown.start_session(pairing_file).await
}

/// Drives a full pairing exchange: fetches the device's public key, mints a
/// host/device certificate pair, and sends `Pair`. Retries while the device
/// reports `PairingDialogResponsePending` (the user hasn't dismissed the
/// trust prompt yet).
pub async fn pair_full(lockdown: &mut LockdownClient, host_id: &str, system_buid: &str) -> Result<PairingFile> {
    let device_public_key = lockdown
        .get_value(Some("DevicePublicKey"), None)
        .await?
        .into_data()
        .ok_or(Error::UnexpectedResponse)?;

    debug!("generating host certificate for pairing");
    let ca = generate_certificates(&device_public_key, None)?;

    let mut pair_record = plist::Dictionary::new();
    pair_record.insert("DevicePublicKey".into(), plist::Value::Data(device_public_key));
    pair_record.insert("DeviceCertificate".into(), plist::Value::Data(ca.dev_cert.clone()));
    pair_record.insert("HostCertificate".into(), plist::Value::Data(ca.host_cert.clone()));
    pair_record.insert("HostID".into(), host_id.into());
    pair_record.insert("RootCertificate".into(), plist::Value::Data(ca.host_cert.clone()));
    pair_record.insert("SystemBUID".into(), system_buid.into());

    if let Ok(wifi) = lockdown.get_value(Some("WiFiAddress"), None).await {
        if let Some(wifi) = wifi.as_string() {
            pair_record.insert("WiFiMACAddress".into(), wifi.into());
        }
    }

    let mut req = plist::Dictionary::new();
    req.insert("Label".into(), lockdown.label().to_string().into());
    req.insert("Request".into(), "Pair".into());
    req.insert("PairRecord".into(), plist::Value::Dictionary(pair_record.clone()));
    req.insert("ProtocolVersion".into(), "2".into());
    let mut options = plist::Dictionary::new();
    options.insert("ExtendedPairingErrors".into(), true.into());
    req.insert("PairingOptions".into(), plist::Value::Dictionary(options));

    loop {
        lockdown
            .link_mut()
            .send_plist(plist::Value::Dictionary(req.clone()))
            .await?;
        match lockdown.link_mut().read_plist().await {
            Ok(escrow) => {
                pair_record.insert("HostPrivateKey".into(), plist::Value::Data(ca.private_key.clone()));
                pair_record.insert("RootPrivateKey".into(), plist::Value::Data(ca.private_key.clone()));
                if let Some(bag) = escrow.get("EscrowBag").and_then(|v| v.as_data()) {
                    pair_record.insert("EscrowBag".into(), plist::Value::Data(bag.to_vec()));
                }
                let udid = lockdown.udid().await.ok();
                if let Some(udid) = &udid {
                    pair_record.insert("UDID".into(), udid.clone().into());
                }
                return PairingFile::from_value(&plist::Value::Dictionary(pair_record));
            }
            Err(Error::PairingError(_)) => {
                warn!("trust dialog not yet dismissed, retrying pairing in 1s");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn pair_record_dict(pairing_file: &PairingFile) -> Result<plist::Dictionary> {
    let mut dict = plist::Dictionary::new();
    dict.insert(
        "HostCertificate".into(),
        plist::Value::Data(pairing_file.host_certificate.to_pem()?),
    );
    dict.insert("HostID".into(), pairing_file.host_id.clone().into());
    dict.insert(
        "RootCertificate".into(),
        plist::Value::Data(pairing_file.root_certificate.to_pem()?),
    );
    dict.insert(
        "DeviceCertificate".into(),
        plist::Value::Data(pairing_file.device_certificate.to_pem()?),
    );
    dict.insert("SystemBUID".into(), pairing_file.system_buid.clone().into());
    Ok(dict)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;

    async fn send_plist(socket: &mut DuplexStream, value: plist::Value) {
        let mut buf = Vec::new();
        value.to_writer_xml(&mut buf).unwrap();
        socket.write_all(&(buf.len() as u32).to_be_bytes()).await.unwrap();
        socket.write_all(&buf).await.unwrap();
    }

    async fn recv_plist(socket: &mut DuplexStream) -> plist::Dictionary {
        let mut len_buf = [0u8; 4];
        socket.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        socket.read_exact(&mut buf).await.unwrap();
        let value: plist::Value = plist::from_bytes(&buf).unwrap();
        value.into_dictionary().unwrap()
    }

    fn device_public_key_pem() -> Vec<u8> {
        use rsa::pkcs1::EncodeRsaPublicKey;
        let mut rng = rsa::rand_core::OsRng;
        let key = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
        rsa::RsaPublicKey::from(&key)
            .to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap()
            .into_bytes()
    }

    #[tokio::test]
    async fn pair_full_builds_a_pairing_file_from_the_device_exchange() {
        let (client, mut server) = tokio::io::duplex(16384);
        let device_pubkey = device_public_key_pem();
        let device_pubkey_for_server = device_pubkey.clone();

        let handle = tokio::spawn(async move {
            // QueryType handshake.
            recv_plist(&mut server).await;
            let mut greeting = plist::Dictionary::new();
            greeting.insert("Type".into(), "com.apple.mobile.lockdown".into());
            send_plist(&mut server, plist::Value::Dictionary(greeting)).await;

            // GetValue(DevicePublicKey).
            let req = recv_plist(&mut server).await;
            assert_eq!(req.get("Key").and_then(|v| v.as_string()), Some("DevicePublicKey"));
            let mut reply = plist::Dictionary::new();
            reply.insert("Value".into(), plist::Value::Data(device_pubkey_for_server));
            send_plist(&mut server, plist::Value::Dictionary(reply)).await;

            // GetValue(WiFiAddress).
            let req = recv_plist(&mut server).await;
            assert_eq!(req.get("Key").and_then(|v| v.as_string()), Some("WiFiAddress"));
            let mut reply = plist::Dictionary::new();
            reply.insert("Value".into(), "02:00:00:00:00:00".into());
            send_plist(&mut server, plist::Value::Dictionary(reply)).await;

            // Pair.
            let req = recv_plist(&mut server).await;
            assert_eq!(req.get("Request").and_then(|v| v.as_string()), Some("Pair"));
            let mut reply = plist::Dictionary::new();
            reply.insert("EscrowBag".into(), plist::Value::Data(vec![1, 2, 3, 4]));
            send_plist(&mut server, plist::Value::Dictionary(reply)).await;

            // GetValue(UniqueDeviceID), from `lockdown.udid()`.
            let req = recv_plist(&mut server).await;
            assert_eq!(req.get("Key").and_then(|v| v.as_string()), Some("UniqueDeviceID"));
            let mut reply = plist::Dictionary::new();
            reply.insert("Value".into(), "00008030-ABCDEF".into());
            send_plist(&mut server, plist::Value::Dictionary(reply)).await;
        });

        let mut lockdown = LockdownClient::connect(Box::new(client), "test-client").await.unwrap();
        let pairing_file = pair_full(&mut lockdown, "test-host-id", "test-system-buid").await.unwrap();

        assert_eq!(pairing_file.host_id, "test-host-id");
        assert_eq!(pairing_file.system_buid, "test-system-buid");
        assert_eq!(pairing_file.escrow_bag, vec![1, 2, 3, 4]);
        assert_eq!(pairing_file.udid.as_deref(), Some("00008030-ABCDEF"));
        assert_eq!(pairing_file.wifi_mac_address.as_deref(), Some("02:00:00:00:00:00"));

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn validate_pair_skips_the_extra_round_trip_on_modern_ios() {
        let (client, mut server) = tokio::io::duplex(16384);
        let handle = tokio::spawn(async move {
            recv_plist(&mut server).await;
            let mut greeting = plist::Dictionary::new();
            greeting.insert("Type".into(), "com.apple.mobile.lockdown".into());
            send_plist(&mut server, plist::Value::Dictionary(greeting)).await;

            // product_version() check.
            let req = recv_plist(&mut server).await;
            assert_eq!(req.get("Key").and_then(|v| v.as_string()), Some("ProductVersion"));
            let mut reply = plist::Dictionary::new();
            reply.insert("Value".into(), "17.0".into());
            send_plist(&mut server, plist::Value::Dictionary(reply)).await;

            // No ValidatePair expected (iOS 17 >= 11): straight to StartSession.
            let req = recv_plist(&mut server).await;
            assert_eq!(req.get("Request").and_then(|v| v.as_string()), Some("StartSession"));
            let mut reply = plist::Dictionary::new();
            reply.insert("SessionID".into(), "test-session".into());
            reply.insert("EnableSessionSSL".into(), false.into());
            send_plist(&mut server, plist::Value::Dictionary(reply)).await;

            // Post-session UniqueDeviceID lookup.
            let req = recv_plist(&mut server).await;
            assert_eq!(req.get("Key").and_then(|v| v.as_string()), Some("UniqueDeviceID"));
            let mut reply = plist::Dictionary::new();
            reply.insert("Value".into(), "00008030-ABCDEF".into());
            send_plist(&mut server, plist::Value::Dictionary(reply)).await;
        });

        let mut lockdown = LockdownClient::connect(Box::new(client), "test-client").await.unwrap();

        let device_pubkey = device_public_key_pem();
        let ca = crate::ca::generate_certificates(&device_pubkey, None).unwrap();
        let pairing_file = PairingFile {
            device_certificate: openssl::x509::X509::from_pem(&ca.dev_cert).unwrap(),
            host_private_key: openssl::pkey::PKey::private_key_from_pem(&ca.private_key).unwrap(),
            host_certificate: openssl::x509::X509::from_pem(&ca.host_cert).unwrap(),
            root_private_key: openssl::pkey::PKey::private_key_from_pem(&ca.private_key).unwrap(),
            root_certificate: openssl::x509::X509::from_pem(&ca.host_cert).unwrap(),
            system_buid: "test-buid".into(),
            host_id: "test-host".into(),
            escrow_bag: vec![],
            wifi_mac_address: None,
            udid: None,
        };

        validate_pair(&mut lockdown, &pairing_file).await.unwrap();

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn pair_fails_validation_falls_back_then_reports_fatal_on_second_failure() {
        let (client, mut server) = tokio::io::duplex(16384);
        let device_pubkey = device_public_key_pem();
        let device_pubkey_for_server = device_pubkey.clone();

        let handle = tokio::spawn(async move {
            // First connection: existing record fails validation.
            recv_plist(&mut server).await;
            let mut greeting = plist::Dictionary::new();
            greeting.insert("Type".into(), "com.apple.mobile.lockdown".into());
            send_plist(&mut server, plist::Value::Dictionary(greeting)).await;

            let req = recv_plist(&mut server).await;
            assert_eq!(req.get("Key").and_then(|v| v.as_string()), Some("ProductVersion"));
            let mut reply = plist::Dictionary::new();
            reply.insert("Value".into(), "10.0".into());
            send_plist(&mut server, plist::Value::Dictionary(reply)).await;

            let req = recv_plist(&mut server).await;
            assert_eq!(req.get("Request").and_then(|v| v.as_string()), Some("ValidatePair"));
            let mut reply = plist::Dictionary::new();
            reply.insert("Error".into(), "InvalidHostID".into());
            send_plist(&mut server, plist::Value::Dictionary(reply)).await;

            // Full pairing on the same (still open) connection.
            let req = recv_plist(&mut server).await;
            assert_eq!(req.get("Key").and_then(|v| v.as_string()), Some("DevicePublicKey"));
            let mut reply = plist::Dictionary::new();
            reply.insert("Value".into(), plist::Value::Data(device_pubkey_for_server));
            send_plist(&mut server, plist::Value::Dictionary(reply)).await;

            let req = recv_plist(&mut server).await;
            assert_eq!(req.get("Key").and_then(|v| v.as_string()), Some("WiFiAddress"));
            let mut reply = plist::Dictionary::new();
            reply.insert("Value".into(), "02:00:00:00:00:00".into());
            send_plist(&mut server, plist::Value::Dictionary(reply)).await;

            let req = recv_plist(&mut server).await;
            assert_eq!(req.get("Request").and_then(|v| v.as_string()), Some("Pair"));
            let mut reply = plist::Dictionary::new();
            reply.insert("EscrowBag".into(), plist::Value::Data(vec![1, 2, 3]));
            send_plist(&mut server, plist::Value::Dictionary(reply)).await;

            let req = recv_plist(&mut server).await;
            assert_eq!(req.get("Key").and_then(|v| v.as_string()), Some("UniqueDeviceID"));
            let mut reply = plist::Dictionary::new();
            reply.insert("Value".into(), "00008030-ABCDEF".into());
            send_plist(&mut server, plist::Value::Dictionary(reply)).await;
        });

        let (reopened_client, mut reopened_server) = tokio::io::duplex(16384);
        let reopen_handle = tokio::spawn(async move {
            recv_plist(&mut reopened_server).await;
            let mut greeting = plist::Dictionary::new();
            greeting.insert("Type".into(), "com.apple.mobile.lockdown".into());
            send_plist(&mut reopened_server, plist::Value::Dictionary(greeting)).await;

            let req = recv_plist(&mut reopened_server).await;
            assert_eq!(req.get("Key").and_then(|v| v.as_string()), Some("ProductVersion"));
            let mut reply = plist::Dictionary::new();
            reply.insert("Value".into(), "10.0".into());
            send_plist(&mut reopened_server, plist::Value::Dictionary(reply)).await;

            let req = recv_plist(&mut reopened_server).await;
            assert_eq!(req.get("Request").and_then(|v| v.as_string()), Some("ValidatePair"));
            let mut reply = plist::Dictionary::new();
            reply.insert("Error".into(), "InvalidHostID".into());
            send_plist(&mut reopened_server, plist::Value::Dictionary(reply)).await;
        });

        let lockdown = LockdownClient::connect(Box::new(client), "test-client").await.unwrap();
        let ca = crate::ca::generate_certificates(&device_pubkey, None).unwrap();
        let existing = PairingFile {
            device_certificate: openssl::x509::X509::from_pem(&ca.dev_cert).unwrap(),
            host_private_key: openssl::pkey::PKey::private_key_from_pem(&ca.private_key).unwrap(),
            host_certificate: openssl::x509::X509::from_pem(&ca.host_cert).unwrap(),
            root_private_key: openssl::pkey::PKey::private_key_from_pem(&ca.private_key).unwrap(),
            root_certificate: openssl::x509::X509::from_pem(&ca.host_cert).unwrap(),
            system_buid: "test-system-buid".into(),
            host_id: "test-host-id".into(),
            escrow_bag: vec![],
            wifi_mac_address: None,
            udid: None,
        };

        let mut reopened_client_opt = Some(reopened_client);
        let result = pair(
            lockdown,
            Some(existing),
            "test-host-id",
            "test-system-buid",
            || {
                let socket = reopened_client_opt.take().expect("reconnect called once");
                async move { LockdownClient::connect(Box::new(socket), "test-client").await }
            },
            |_pf| Ok(()),
        )
        .await;

        assert!(matches!(result, Err(Error::FatalPairingError(_))));

        handle.await.unwrap();
        reopen_handle.await.unwrap();
    }
}

