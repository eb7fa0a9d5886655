//! Connection configuration.
//!
//! Every key is optional in the TOML source; missing keys take the
//! defaults below. Integer settings are range-checked by
//! [`Config::validate`], which [`Config::from_toml_str`] and
//! [`Config::load`] call for you.
//!
//! ```toml
//! tls = true
//! sasl = true
//! sasl_mechanism = "SCRAM-SHA-256"
//! sasl_username = "alice"
//! sasl_password = "hunter2"
//! reconnect_retries = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// TLS cipher-suite policy.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CipherSuite {
    /// TLS 1.3 only.
    Secure,
    /// TLS 1.3 plus TLS 1.2 ECDHE with AEAD.
    #[default]
    Compat,
    /// Everything the provider offers.
    Legacy,
    /// Everything the provider offers.
    All,
}

/// Configured SASL mechanism. Names are matched case-insensitively.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String")]
pub enum SaslMechanismKind {
    /// RFC 4616.
    #[default]
    Plain,
    /// P-256 challenge signing.
    EcdsaNist256pChallenge,
    /// RFC 5802 with SHA-1.
    ScramSha1,
    /// RFC 7677.
    ScramSha256,
    /// SCRAM with SHA-512.
    ScramSha512,
}

impl SaslMechanismKind {
    /// Wire name sent in `AUTHENTICATE <mechanism>`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::EcdsaNist256pChallenge => "ECDSA-NIST256P-CHALLENGE",
            Self::ScramSha1 => "SCRAM-SHA-1",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }

    /// Parse a mechanism name, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "ECDSA-NIST256P-CHALLENGE" => Some(Self::EcdsaNist256pChallenge),
            "SCRAM-SHA-1" => Some(Self::ScramSha1),
            "SCRAM-SHA-256" => Some(Self::ScramSha256),
            "SCRAM-SHA-512" => Some(Self::ScramSha512),
            _ => None,
        }
    }
}

impl TryFrom<String> for SaslMechanismKind {
    type Error = String;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::parse(&name).ok_or_else(|| format!("unknown SASL mechanism `{}`", name))
    }
}

impl std::fmt::Display for SaslMechanismKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address type used in the SOCKS5 CONNECT request.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SocksAddrType {
    /// Let the proxy resolve the host name.
    #[default]
    Domain,
    /// Resolve locally, send an IPv4 address.
    Ipv4,
    /// Resolve locally, send an IPv6 address.
    Ipv6,
}

/// Settings consumed by the connection engine.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Enable SASL authentication.
    #[serde(default)]
    pub sasl: bool,
    /// Mechanism to request.
    #[serde(default)]
    pub sasl_mechanism: SaslMechanismKind,
    /// SASL authentication identity.
    #[serde(default)]
    pub sasl_username: String,
    /// SASL password (PLAIN, SCRAM).
    #[serde(default)]
    pub sasl_password: String,
    /// PEM-encoded P-256 private key (ECDSA-NIST256P-CHALLENGE).
    #[serde(default)]
    pub sasl_key_file: Option<PathBuf>,

    /// Upgrade the connection to TLS.
    #[serde(default)]
    pub tls: bool,
    /// Reject certificates not issued for the requested host.
    #[serde(default = "default_true")]
    pub hostname_checking: bool,
    /// Client-side cipher policy.
    #[serde(default)]
    pub cipher_suite: CipherSuite,
    /// Cipher policy of the embedded TLS server.
    #[serde(default)]
    pub server_cipher_suite: CipherSuite,
    /// Extra trust anchors, PEM.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,

    /// Seconds to wait for the server's welcome after registration is sent.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Seconds added per consecutive failure.
    #[serde(default = "default_reconnect_backoff_delay")]
    pub reconnect_backoff_delay: u64,
    /// Seconds before the first retry.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
    /// Ceiling for the retry delay in seconds.
    #[serde(default = "default_reconnect_delay_max")]
    pub reconnect_delay_max: u64,
    /// Retries granted before giving up.
    #[serde(default = "default_reconnect_retries")]
    pub reconnect_retries: u32,
    /// Reconnect automatically after a detected loss.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Tunnel through a SOCKS5 proxy.
    #[serde(default)]
    pub socks: bool,
    /// Proxy host.
    #[serde(default = "default_socks_host")]
    pub socks_host: String,
    /// Proxy port.
    #[serde(default = "default_socks_port")]
    pub socks_port: String,
    /// Address type in the CONNECT request.
    #[serde(default)]
    pub socks_atyp: SocksAddrType,

    /// Speak ICB instead of IRC.
    #[serde(default)]
    pub icb: bool,

    /// Request `account-notify`.
    #[serde(default)]
    pub account_notify: bool,
    /// Request `away-notify`.
    #[serde(default)]
    pub away_notify: bool,
    /// Request `batch`.
    #[serde(default)]
    pub batch: bool,
    /// Request `chghost`.
    #[serde(default)]
    pub chghost: bool,
    /// Request `extended-join`.
    #[serde(default)]
    pub extended_join: bool,
    /// Request `invite-notify`.
    #[serde(default)]
    pub invite_notify: bool,
    /// Request `multi-prefix`.
    #[serde(default)]
    pub multi_prefix: bool,
    /// Request `server-time`.
    #[serde(default)]
    pub server_time: bool,

    /// Seconds of silence before the listener sends PING.
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    /// Seconds of silence after which the session counts as lost.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
    /// Longest assembled line accepted from the peer.
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sasl: false,
            sasl_mechanism: SaslMechanismKind::default(),
            sasl_username: String::new(),
            sasl_password: String::new(),
            sasl_key_file: None,
            tls: false,
            hostname_checking: true,
            cipher_suite: CipherSuite::default(),
            server_cipher_suite: CipherSuite::default(),
            ca_file: None,
            connection_timeout: default_connection_timeout(),
            reconnect_backoff_delay: default_reconnect_backoff_delay(),
            reconnect_delay: default_reconnect_delay(),
            reconnect_delay_max: default_reconnect_delay_max(),
            reconnect_retries: default_reconnect_retries(),
            auto_reconnect: true,
            socks: false,
            socks_host: default_socks_host(),
            socks_port: default_socks_port(),
            socks_atyp: SocksAddrType::default(),
            icb: false,
            account_notify: false,
            away_notify: false,
            batch: false,
            chghost: false,
            extended_join: false,
            invite_notify: false,
            multi_prefix: false,
            server_time: false,
            ping_interval: default_ping_interval(),
            ping_timeout: default_ping_timeout(),
            max_line_len: default_max_line_len(),
        }
    }
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Check every integer setting against its permitted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("connection_timeout", self.connection_timeout, 0, 300)?;
        check_range("reconnect_backoff_delay", self.reconnect_backoff_delay, 0, 99)?;
        check_range("reconnect_delay", self.reconnect_delay, 0, 999)?;
        check_range("reconnect_delay_max", self.reconnect_delay_max, 0, 999)?;
        check_range("reconnect_retries", u64::from(self.reconnect_retries), 0, 999)?;
        check_range("ping_interval", self.ping_interval, 1, 3600)?;
        check_range("ping_timeout", self.ping_timeout, 1, 3600)?;
        check_range("max_line_len", self.max_line_len as u64, 512, 65535)?;
        Ok(())
    }

    /// How long to wait for the registration-complete reply.
    pub fn welcome_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    /// Interval between liveness PINGs.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval)
    }

    /// Silence tolerated before declaring loss.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout)
    }
}

fn check_range(key: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            key,
            value,
            min,
            max,
        });
    }
    Ok(())
}

// =============================================================================
// Defaults
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_connection_timeout() -> u64 {
    45
}

fn default_reconnect_backoff_delay() -> u64 {
    60
}

fn default_reconnect_delay() -> u64 {
    10
}

fn default_reconnect_delay_max() -> u64 {
    240
}

fn default_reconnect_retries() -> u32 {
    30
}

fn default_socks_host() -> String {
    "127.0.0.1".to_string()
}

fn default_socks_port() -> String {
    "1080".to_string()
}

fn default_ping_interval() -> u64 {
    60
}

fn default_ping_timeout() -> u64 {
    120
}

fn default_max_line_len() -> usize {
    8191
}
