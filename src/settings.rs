//! Install settings
//!
//! One version-tagged settings tree supplied per job. Every domain is
//! optional; an absent domain is simply not applied to the card.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Newest settings schema this build understands
pub const SETTINGS_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed settings: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Settings version {found} is not supported (newest is {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("Invalid settings: {}", format_issues(.0))]
    Invalid(Vec<SettingsIssue>),
}

pub(crate) fn format_issues(issues: &[SettingsIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Independent unit of first-boot configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingsDomain {
    Network,
    Ssh,
    System,
    Users,
    Scripts,
    Packages,
    Boot,
    FirstRun,
}

impl SettingsDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            SettingsDomain::Network => "network",
            SettingsDomain::Ssh => "ssh",
            SettingsDomain::System => "system",
            SettingsDomain::Users => "users",
            SettingsDomain::Scripts => "scripts",
            SettingsDomain::Packages => "packages",
            SettingsDomain::Boot => "boot",
            SettingsDomain::FirstRun => "firstrun",
        }
    }
}

impl fmt::Display for SettingsDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingsIssue {
    pub domain: SettingsDomain,
    pub field: String,
    pub message: String,
}

impl SettingsIssue {
    fn new(domain: SettingsDomain, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            domain,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SettingsIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.domain, self.field, self.message)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    Open,
    #[default]
    Wpa2Personal,
    Wpa3Personal,
    Wpa2Enterprise,
    Wpa3Enterprise,
}

impl SecurityMode {
    pub fn is_personal(self) -> bool {
        matches!(self, SecurityMode::Wpa2Personal | SecurityMode::Wpa3Personal)
    }

    pub fn is_enterprise(self) -> bool {
        matches!(
            self,
            SecurityMode::Wpa2Enterprise | SecurityMode::Wpa3Enterprise
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnterpriseCredentials {
    pub eap: String,
    pub identity: String,
    pub password: String,
    pub phase2_auth: String,
}

impl Default for EnterpriseCredentials {
    fn default() -> Self {
        Self {
            eap: "peap".to_string(),
            identity: String::new(),
            password: String::new(),
            phase2_auth: "mschapv2".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiNetwork {
    pub ssid: String,
    pub password: Option<String>,
    pub security_mode: SecurityMode,
    /// WPA3 network that must also admit WPA2 clients
    pub transition_mode: bool,
    pub hidden: bool,
    pub enterprise: Option<EnterpriseCredentials>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    #[serde(flatten)]
    pub primary: WifiNetwork,
    /// ISO 3166 regulatory domain
    pub country: Option<String>,
    pub additional: Vec<WifiNetwork>,
}

impl NetworkSettings {
    pub fn networks(&self) -> impl Iterator<Item = &WifiNetwork> {
        std::iter::once(&self.primary).chain(self.additional.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub enabled: bool,
    pub port: u16,
    pub authorized_keys: Vec<String>,
    pub password_auth: bool,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 22,
            authorized_keys: Vec::new(),
            password_auth: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceToggles {
    pub i2c: bool,
    pub spi: bool,
    pub serial: bool,
    pub camera: bool,
    pub onewire: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    pub hostname: Option<String>,
    pub locale: Option<String>,
    pub timezone: Option<String>,
    pub keyboard_layout: Option<String>,
    pub interfaces: InterfaceToggles,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAccount {
    pub username: String,
    /// crypt(3) hash, never a clear-text password
    pub password_hash: String,
    pub sudo: bool,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptSettings {
    pub pre: Option<String>,
    pub post: Option<String>,
    pub first_boot: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageSettings {
    pub update: bool,
    pub upgrade: bool,
    pub install: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootSettings {
    /// `config.txt` key=value overrides
    pub overrides: BTreeMap<String, String>,
    pub gpu_mem: Option<u32>,
    pub serial_console: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallSettings {
    pub version: u32,
    pub network: Option<NetworkSettings>,
    pub ssh: Option<SshSettings>,
    pub system: Option<SystemSettings>,
    pub users: Vec<UserAccount>,
    pub scripts: Option<ScriptSettings>,
    pub packages: Option<PackageSettings>,
    pub boot: Option<BootSettings>,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            network: None,
            ssh: None,
            system: None,
            users: Vec::new(),
            scripts: None,
            packages: None,
            boot: None,
        }
    }
}

impl InstallSettings {
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        let settings: InstallSettings = serde_json::from_str(json)?;
        if settings.version == 0 || settings.version > SETTINGS_VERSION {
            return Err(SettingsError::UnsupportedVersion {
                found: settings.version,
                supported: SETTINGS_VERSION,
            });
        }
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let json = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// True when no domain would write anything
    pub fn is_empty(&self) -> bool {
        self.requested_domains().is_empty()
    }

    /// Domains this tree asks to configure, in apply order
    pub fn requested_domains(&self) -> Vec<SettingsDomain> {
        let mut domains = Vec::new();
        if self.network.is_some() {
            domains.push(SettingsDomain::Network);
        }
        if self.ssh.is_some() {
            domains.push(SettingsDomain::Ssh);
        }
        if self.system.is_some() {
            domains.push(SettingsDomain::System);
        }
        if !self.users.is_empty() {
            domains.push(SettingsDomain::Users);
        }
        if self.scripts.is_some() {
            domains.push(SettingsDomain::Scripts);
        }
        if self.packages.is_some() {
            domains.push(SettingsDomain::Packages);
        }
        if self.boot.is_some() {
            domains.push(SettingsDomain::Boot);
        }
        domains
    }

    /// Every problem across all domains
    pub fn issues(&self) -> Vec<SettingsIssue> {
        let mut issues = Vec::new();
        if let Some(network) = &self.network {
            issues.extend(network_issues(network));
        }
        if let Some(ssh) = &self.ssh {
            issues.extend(ssh_issues(ssh));
        }
        if let Some(system) = &self.system {
            issues.extend(system_issues(system));
        }
        issues.extend(user_issues(&self.users));
        if let Some(packages) = &self.packages {
            issues.extend(package_issues(packages));
        }
        if let Some(boot) = &self.boot {
            issues.extend(boot_issues(boot));
        }
        issues
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let issues = self.issues();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(SettingsError::Invalid(issues))
        }
    }
}

pub fn network_issues(network: &NetworkSettings) -> Vec<SettingsIssue> {
    let mut issues = Vec::new();
    let d = SettingsDomain::Network;

    for (i, net) in network.networks().enumerate() {
        let prefix = if i == 0 {
            String::new()
        } else {
            format!("additional[{}].", i - 1)
        };

        if net.ssid.is_empty() || net.ssid.len() > 32 {
            issues.push(SettingsIssue::new(
                d,
                format!("{}ssid", prefix),
                "must be 1-32 bytes",
            ));
        }
        if net.ssid.contains(['\n', '\r']) {
            issues.push(SettingsIssue::new(
                d,
                format!("{}ssid", prefix),
                "must not contain line breaks",
            ));
        }

        if net.security_mode.is_personal() {
            match net.password.as_deref() {
                Some(psk) if valid_psk(psk) => {}
                Some(_) => issues.push(SettingsIssue::new(
                    d,
                    format!("{}password", prefix),
                    "must be 8-63 printable characters or 64 hex digits",
                )),
                None => issues.push(SettingsIssue::new(
                    d,
                    format!("{}password", prefix),
                    "required for personal security modes",
                )),
            }
        }

        if net.security_mode.is_enterprise() {
            match &net.enterprise {
                Some(creds) if !creds.identity.is_empty() && !creds.password.is_empty() => {}
                _ => issues.push(SettingsIssue::new(
                    d,
                    format!("{}enterprise", prefix),
                    "identity and password are required",
                )),
            }
        }

        if net.transition_mode && net.security_mode != SecurityMode::Wpa3Personal {
            issues.push(SettingsIssue::new(
                d,
                format!("{}transition_mode", prefix),
                "only applies to wpa3_personal",
            ));
        }
    }

    if let Some(country) = &network.country {
        if country.len() != 2 || !country.chars().all(|c| c.is_ascii_uppercase()) {
            issues.push(SettingsIssue::new(
                d,
                "country",
                "must be a two-letter uppercase code",
            ));
        }
    }
    issues
}

pub fn ssh_issues(ssh: &SshSettings) -> Vec<SettingsIssue> {
    let mut issues = Vec::new();
    if ssh.port == 0 {
        issues.push(SettingsIssue::new(SettingsDomain::Ssh, "port", "must not be 0"));
    }
    for (i, key) in ssh.authorized_keys.iter().enumerate() {
        if key.trim().is_empty() || key.contains('\n') {
            issues.push(SettingsIssue::new(
                SettingsDomain::Ssh,
                format!("authorized_keys[{}]", i),
                "must be a single non-empty line",
            ));
        }
    }
    if ssh.enabled && !ssh.password_auth && ssh.authorized_keys.is_empty() {
        issues.push(SettingsIssue::new(
            SettingsDomain::Ssh,
            "authorized_keys",
            "key login is the only method left but no keys are given",
        ));
    }
    issues
}

pub fn system_issues(system: &SystemSettings) -> Vec<SettingsIssue> {
    let mut issues = Vec::new();
    let d = SettingsDomain::System;
    if let Some(hostname) = &system.hostname {
        if !valid_hostname(hostname) {
            issues.push(SettingsIssue::new(
                d,
                "hostname",
                "must be 1-63 letters, digits or hyphens, not starting or ending with a hyphen",
            ));
        }
    }
    for (field, value) in [
        ("locale", &system.locale),
        ("timezone", &system.timezone),
        ("keyboard_layout", &system.keyboard_layout),
    ] {
        if let Some(value) = value {
            if value.is_empty() || value.chars().any(|c| c.is_whitespace()) {
                issues.push(SettingsIssue::new(d, field, "must be a single word"));
            }
        }
    }
    issues
}

pub fn user_issues(users: &[UserAccount]) -> Vec<SettingsIssue> {
    let mut issues = Vec::new();
    let d = SettingsDomain::Users;
    let mut seen = std::collections::HashSet::new();
    for (i, user) in users.iter().enumerate() {
        if !valid_posix_name(&user.username) {
            issues.push(SettingsIssue::new(
                d,
                format!("users[{}].username", i),
                "must be a POSIX user name",
            ));
        } else if !seen.insert(user.username.as_str()) {
            issues.push(SettingsIssue::new(
                d,
                format!("users[{}].username", i),
                "duplicate user name",
            ));
        }
        if !valid_crypt_hash(&user.password_hash) {
            issues.push(SettingsIssue::new(
                d,
                format!("users[{}].password_hash", i),
                "must be a crypt(3) hash like $6$salt$hash",
            ));
        }
        for group in &user.groups {
            if !valid_posix_name(group) {
                issues.push(SettingsIssue::new(
                    d,
                    format!("users[{}].groups", i),
                    format!("invalid group name '{}'", group),
                ));
            }
        }
    }
    issues
}

pub fn package_issues(packages: &PackageSettings) -> Vec<SettingsIssue> {
    packages
        .install
        .iter()
        .filter(|p| p.is_empty() || p.chars().any(|c| c.is_whitespace()))
        .map(|p| {
            SettingsIssue::new(
                SettingsDomain::Packages,
                "install",
                format!("invalid package name '{}'", p),
            )
        })
        .collect()
}

pub fn boot_issues(boot: &BootSettings) -> Vec<SettingsIssue> {
    let mut issues = Vec::new();
    for (key, value) in &boot.overrides {
        if key.is_empty() || key.contains(['=', '\n', '[', ']']) || key.trim() != key {
            issues.push(SettingsIssue::new(
                SettingsDomain::Boot,
                "overrides",
                format!("invalid key '{}'", key),
            ));
        }
        if value.contains('\n') {
            issues.push(SettingsIssue::new(
                SettingsDomain::Boot,
                "overrides",
                format!("value for '{}' spans lines", key),
            ));
        }
    }
    if boot.gpu_mem == Some(0) {
        issues.push(SettingsIssue::new(SettingsDomain::Boot, "gpu_mem", "must be positive"));
    }
    issues
}

fn valid_psk(psk: &str) -> bool {
    if psk.len() == 64 {
        return psk.chars().all(|c| c.is_ascii_hexdigit());
    }
    (8..=63).contains(&psk.len()) && psk.chars().all(|c| (' '..='~').contains(&c))
}

/// RFC 1123 label
fn valid_hostname(name: &str) -> bool {
    (1..=63).contains(&name.len())
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn valid_posix_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 32
        && (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// `$id$salt$hash` or `$id$params$salt$hash`
fn valid_crypt_hash(hash: &str) -> bool {
    if !hash.starts_with('$') || hash.contains([':', '\n']) {
        return false;
    }
    let parts: Vec<&str> = hash.split('$').collect();
    parts.len() >= 4
        && parts[1..].iter().all(|p| !p.is_empty())
        && parts[1].chars().all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "$6$salt$abcdefghijklmnopqrstuv";

    #[test]
    fn test_defaults_and_partial_json() {
        let settings = InstallSettings::from_json(
            r#"{"ssh": {"enabled": true}, "network": {"ssid": "Lab", "password": "secret123", "security_mode": "wpa3_personal"}}"#,
        )
        .unwrap();
        assert_eq!(settings.version, SETTINGS_VERSION);
        let ssh = settings.ssh.as_ref().unwrap();
        assert_eq!(ssh.port, 22);
        assert!(ssh.password_auth);
        let net = settings.network.as_ref().unwrap();
        assert_eq!(net.primary.ssid, "Lab");
        assert_eq!(net.primary.security_mode, SecurityMode::Wpa3Personal);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_newer_version_rejected() {
        assert!(matches!(
            InstallSettings::from_json(r#"{"version": 2}"#),
            Err(SettingsError::UnsupportedVersion { found: 2, .. })
        ));
    }

    #[test]
    fn test_validate_collects_every_issue() {
        let settings = InstallSettings {
            network: Some(NetworkSettings {
                primary: WifiNetwork {
                    ssid: "x".repeat(33),
                    password: Some("short".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ssh: Some(SshSettings {
                port: 0,
                ..Default::default()
            }),
            system: Some(SystemSettings {
                hostname: Some("-bad".to_string()),
                ..Default::default()
            }),
            users: vec![UserAccount {
                username: "Root".to_string(),
                password_hash: "plaintext".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let issues = settings.issues();
        let fields: Vec<String> = issues
            .iter()
            .map(|i| format!("{}.{}", i.domain, i.field))
            .collect();
        assert!(fields.contains(&"network.ssid".to_string()));
        assert!(fields.contains(&"network.password".to_string()));
        assert!(fields.contains(&"ssh.port".to_string()));
        assert!(fields.contains(&"system.hostname".to_string()));
        assert!(fields.contains(&"users.users[0].username".to_string()));
        assert!(fields.contains(&"users.users[0].password_hash".to_string()));
        assert!(matches!(settings.validate(), Err(SettingsError::Invalid(v)) if v.len() == issues.len()));
    }

    #[test]
    fn test_psk_rules() {
        assert!(valid_psk("12345678"));
        assert!(valid_psk(&"a".repeat(63)));
        assert!(!valid_psk(&"a".repeat(64)));
        assert!(valid_psk(&"ab".repeat(32)));
        assert!(!valid_psk("1234567"));
    }

    #[test]
    fn test_enterprise_requires_credentials() {
        let network = NetworkSettings {
            primary: WifiNetwork {
                ssid: "Corp".to_string(),
                security_mode: SecurityMode::Wpa3Enterprise,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(network_issues(&network)[0].field, "enterprise");
    }

    #[test]
    fn test_crypt_hash_shapes() {
        assert!(valid_crypt_hash(HASH));
        assert!(valid_crypt_hash("$y$j9T$salt$hash"));
        assert!(!valid_crypt_hash("$6$$hash"));
        assert!(!valid_crypt_hash("hunter2"));
    }
}
