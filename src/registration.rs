//! Registration commands sent right after the transport is up.

use tracing::{info, warn};

use crate::config::{Config, SaslMechanismKind};

/// Who to register as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Server host name or address.
    pub server: String,
    /// Server port.
    pub port: String,
    /// Ident user name.
    pub username: String,
    /// Real name (gecos).
    pub realname: String,
    /// Nickname.
    pub nickname: String,
    /// Server password.
    pub password: Option<String>,
}

impl ConnectionRequest {
    /// Request with username and real name defaulting to the nickname.
    pub fn new(server: impl Into<String>, port: impl Into<String>, nickname: impl Into<String>) -> Self {
        let nickname = nickname.into();
        Self {
            server: server.into(),
            port: port.into(),
            username: nickname.clone(),
            realname: nickname.clone(),
            nickname,
            password: None,
        }
    }

    /// Set the ident user name.
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Set the real name.
    #[must_use]
    pub fn with_realname(mut self, realname: impl Into<String>) -> Self {
        self.realname = realname.into();
        self
    }

    /// Set the server password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// Capabilities requested at registration, in wire order.
///
/// `sasl` is withheld when the mechanism is PLAIN and TLS is off.
pub fn requested_caps(config: &Config) -> Vec<&'static str> {
    let gated = [
        (config.account_notify, "account-notify"),
        (config.away_notify, "away-notify"),
        (config.batch, "batch"),
        (config.chghost, "chghost"),
        (config.extended_join, "extended-join"),
        (config.invite_notify, "invite-notify"),
        (config.multi_prefix, "multi-prefix"),
        (config.server_time, "server-time"),
    ];
    let mut caps: Vec<&'static str> = gated
        .into_iter()
        .filter_map(|(enabled, cap)| enabled.then_some(cap))
        .collect();

    if sasl_requested(config) {
        caps.push("sasl");
    }
    caps
}

/// True if registration will ask for SASL.
pub fn sasl_requested(config: &Config) -> bool {
    if !config.sasl {
        return false;
    }
    if config.sasl_mechanism == SaslMechanismKind::Plain && !config.tls {
        warn!("SASL mechanism is PLAIN and TLS is not enabled; not requesting SASL authentication");
        return false;
    }
    true
}

/// Lines to write before handing the transport to the listener.
///
/// `CAP REQ` lines come first so the server holds registration open for
/// negotiation, then `PASS`, `NICK` and `USER`.
pub fn registration_lines(req: &ConnectionRequest, caps: &[&str]) -> Vec<String> {
    let mut lines = Vec::with_capacity(caps.len() + 3);
    for cap in caps {
        info!("Requesting {}", cap);
        lines.push(format!("CAP REQ :{}", cap));
    }
    if let Some(password) = req.password.as_deref().filter(|p| !p.is_empty()) {
        lines.push(format!("PASS {}", password));
    }
    lines.push(format!("NICK {}", req.nickname));
    lines.push(format!("USER {} 8 * :{}", req.username, req.realname));
    lines
}
