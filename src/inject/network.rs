//! Wi-Fi profiles as NetworkManager keyfiles

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::Path;

use sha2::{Digest, Sha256};

use super::files::{restrict_permissions, staged, write_atomic};
use super::DomainError;
use crate::settings::{self, NetworkSettings, SecurityMode, WifiNetwork};
use crate::utils::sanitize_file_name;

pub(super) fn apply(boot: &Path, network: &NetworkSettings) -> Result<(), DomainError> {
    let issues = settings::network_issues(network);
    if !issues.is_empty() {
        return Err(DomainError::Invalid(issues));
    }

    let mut names = HashSet::new();
    for (priority, net) in network.networks().enumerate() {
        let mut name = sanitize_file_name(&net.ssid);
        let mut n = 1;
        while !names.insert(name.clone()) {
            n += 1;
            name = format!("{}-{}", sanitize_file_name(&net.ssid), n);
        }

        let path = staged(boot, &format!("network/{}.nmconnection", name));
        // Primary network first; NetworkManager prefers higher priorities
        let keyfile = render_keyfile(net, 100 - priority.min(99) as i32);
        write_atomic(&path, &keyfile)?;
        restrict_permissions(&path);
    }

    if let Some(country) = &network.country {
        write_atomic(&staged(boot, "network/country"), &format!("{}\n", country))?;
    }
    Ok(())
}

/// Stable connection UUID derived from the SSID
fn connection_uuid(ssid: &str) -> String {
    let digest = Sha256::digest(ssid.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    // RFC 4122 name-based layout
    bytes[6] = (bytes[6] & 0x0f) | 0x50;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\")
}

pub(super) fn render_keyfile(net: &WifiNetwork, priority: i32) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[connection]");
    let _ = writeln!(out, "id={}", escape(&net.ssid));
    let _ = writeln!(out, "uuid={}", connection_uuid(&net.ssid));
    let _ = writeln!(out, "type=wifi");
    let _ = writeln!(out, "autoconnect=true");
    let _ = writeln!(out, "autoconnect-priority={}", priority);
    out.push('\n');

    let _ = writeln!(out, "[wifi]");
    let _ = writeln!(out, "mode=infrastructure");
    let _ = writeln!(out, "ssid={}", escape(&net.ssid));
    if net.hidden {
        let _ = writeln!(out, "hidden=true");
    }
    out.push('\n');

    let psk = net.password.as_deref().unwrap_or_default();
    match net.security_mode {
        SecurityMode::Open => {}
        SecurityMode::Wpa2Personal => {
            let _ = writeln!(out, "[wifi-security]");
            let _ = writeln!(out, "key-mgmt=wpa-psk");
            let _ = writeln!(out, "psk={}", escape(psk));
            out.push('\n');
        }
        SecurityMode::Wpa3Personal => {
            let _ = writeln!(out, "[wifi-security]");
            if net.transition_mode {
                // Mixed WPA2/WPA3 network: PSK with optional PMF
                let _ = writeln!(out, "key-mgmt=wpa-psk");
                let _ = writeln!(out, "psk={}", escape(psk));
                let _ = writeln!(out, "pmf=2");
            } else {
                let _ = writeln!(out, "key-mgmt=sae");
                let _ = writeln!(out, "psk={}", escape(psk));
                let _ = writeln!(out, "pmf=3");
            }
            out.push('\n');
        }
        SecurityMode::Wpa2Enterprise | SecurityMode::Wpa3Enterprise => {
            let _ = writeln!(out, "[wifi-security]");
            let _ = writeln!(out, "key-mgmt=wpa-eap");
            if net.security_mode == SecurityMode::Wpa3Enterprise {
                let _ = writeln!(out, "pmf=3");
            }
            out.push('\n');

            let creds = net.enterprise.clone().unwrap_or_default();
            let _ = writeln!(out, "[802-1x]");
            let _ = writeln!(out, "eap={};", creds.eap);
            let _ = writeln!(out, "identity={}", escape(&creds.identity));
            let _ = writeln!(out, "password={}", escape(&creds.password));
            let _ = writeln!(out, "phase2-auth={}", creds.phase2_auth);
            out.push('\n');
        }
    }

    let _ = writeln!(out, "[ipv4]");
    let _ = writeln!(out, "method=auto");
    out.push('\n');
    let _ = writeln!(out, "[ipv6]");
    let _ = writeln!(out, "addr-gen-mode=default");
    let _ = writeln!(out, "method=auto");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::EnterpriseCredentials;

    fn wifi(ssid: &str, mode: SecurityMode) -> WifiNetwork {
        WifiNetwork {
            ssid: ssid.to_string(),
            password: Some("correct horse".to_string()),
            security_mode: mode,
            ..Default::default()
        }
    }

    #[test]
    fn test_open_network_has_no_security_section() {
        let keyfile = render_keyfile(&wifi("Cafe", SecurityMode::Open), 100);
        assert!(!keyfile.contains("[wifi-security]"));
        assert!(keyfile.contains("ssid=Cafe"));
    }

    #[test]
    fn test_wpa3_requires_pmf() {
        let keyfile = render_keyfile(&wifi("Lab", SecurityMode::Wpa3Personal), 100);
        assert!(keyfile.contains("key-mgmt=sae\n"));
        assert!(keyfile.contains("pmf=3\n"));
    }

    #[test]
    fn test_wpa3_transition_mode() {
        let mut net = wifi("Lab", SecurityMode::Wpa3Personal);
        net.transition_mode = true;
        let keyfile = render_keyfile(&net, 100);
        assert!(keyfile.contains("key-mgmt=wpa-psk\n"));
        assert!(keyfile.contains("pmf=2\n"));
        assert!(!keyfile.contains("sae"));
    }

    #[test]
    fn test_enterprise_block() {
        let mut net = wifi("Corp", SecurityMode::Wpa3Enterprise);
        net.enterprise = Some(EnterpriseCredentials {
            identity: "alice".to_string(),
            password: "pw".to_string(),
            ..Default::default()
        });
        let keyfile = render_keyfile(&net, 100);
        assert!(keyfile.contains("key-mgmt=wpa-eap\npmf=3\n"));
        assert!(keyfile.contains("[802-1x]\neap=peap;\nidentity=alice\npassword=pw\nphase2-auth=mschapv2\n"));
    }

    #[test]
    fn test_uuid_is_stable_and_shaped() {
        let uuid = connection_uuid("Lab");
        assert_eq!(uuid, connection_uuid("Lab"));
        assert_eq!(uuid.len(), 36);
        assert_eq!(&uuid[14..15], "5");
    }

    #[test]
    fn test_apply_writes_one_file_per_network() {
        let dir = tempfile::tempdir().unwrap();
        let settings = NetworkSettings {
            primary: wifi("Home Net", SecurityMode::Wpa2Personal),
            country: Some("DE".to_string()),
            additional: vec![wifi("Home/Net", SecurityMode::Wpa2Personal)],
        };
        apply(dir.path(), &settings).unwrap();

        let net_dir = dir.path().join("flashkit/network");
        assert!(net_dir.join("Home_Net.nmconnection").is_file());
        assert!(net_dir.join("Home_Net-2.nmconnection").is_file());
        assert_eq!(std::fs::read_to_string(net_dir.join("country")).unwrap(), "DE\n");
    }

    #[test]
    fn test_malformed_ssid_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let settings = NetworkSettings {
            primary: wifi("", SecurityMode::Open),
            ..Default::default()
        };
        assert!(matches!(
            apply(dir.path(), &settings),
            Err(DomainError::Invalid(_))
        ));
        assert!(!dir.path().join("flashkit").exists());
    }
}
