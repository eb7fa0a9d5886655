//! SASL authentication inside IRCv3 capability negotiation.
//!
//! [`SaslEngine`] is fed every `CAP`, `AUTHENTICATE` and `90x` message the
//! listener receives and returns the lines to send back. It also owns the
//! decision of when to send `CAP END`: once every requested capability has
//! been answered and no SASL exchange is still open.
//!
//! # Supported Mechanisms
//!
//! - **PLAIN**: username/password (RFC 4616)
//! - **ECDSA-NIST256P-CHALLENGE**: P-256 signature over a server challenge
//! - **SCRAM-SHA-1 / -256 / -512**: salted challenge-response (RFC 5802, RFC 7677)
//!
//! # Reference
//! - IRCv3 SASL: <https://ircv3.net/specs/extensions/sasl-3.2>

pub mod challenge;
pub mod plain;
pub mod scram;

use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::config::{Config, SaslMechanismKind};
use crate::error::SaslError;
use crate::message::Message;

pub use self::challenge::ChallengeResponder;
pub use self::scram::{ScramClient, ScramDigest};

/// Maximum length of a single SASL message chunk (400 bytes).
///
/// SASL payloads that exceed this length are split into multiple
/// AUTHENTICATE commands.
pub const SASL_CHUNK_SIZE: usize = 400;

/// Decode a base64-encoded SASL payload; `+` is the empty payload.
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    if encoded == "+" {
        return Ok(Vec::new());
    }
    BASE64.decode(encoded)
}

/// `AUTHENTICATE` lines carrying `encoded`.
///
/// Payloads are cut into [`SASL_CHUNK_SIZE`] pieces; a payload that is an
/// exact multiple of the chunk size (or empty) is terminated by
/// `AUTHENTICATE +`.
pub fn authenticate_lines(encoded: &str) -> Vec<String> {
    let mut lines: Vec<String> = encoded
        .as_bytes()
        .chunks(SASL_CHUNK_SIZE)
        .map(|chunk| format!("AUTHENTICATE {}", String::from_utf8_lossy(chunk)))
        .collect();
    if encoded.len() % SASL_CHUNK_SIZE == 0 {
        lines.push("AUTHENTICATE +".to_owned());
    }
    lines
}

/// Where the authentication exchange stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaslState {
    /// Not started.
    Idle,
    /// `AUTHENTICATE <mechanism>` sent, answering server payloads.
    AwaitingChallenge,
    /// The server confirmed success (PLAIN reaches this optimistically).
    Completed,
    /// Given up; the connection continues unauthenticated.
    Aborted,
}

impl SaslState {
    /// True once the exchange can make no further progress.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

enum Responder {
    Plain,
    Challenge(ChallengeResponder),
    Scram(ScramClient),
}

/// SASL and `CAP END` driver for one connection.
pub struct SaslEngine {
    mechanism: SaslMechanismKind,
    username: String,
    password: Zeroizing<String>,
    key_file: Option<PathBuf>,
    state: SaslState,
    responder: Option<Responder>,
    inbound: String,
    pending_caps: usize,
    negotiating: bool,
    exchange_open: bool,
}

impl std::fmt::Debug for SaslEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslEngine")
            .field("mechanism", &self.mechanism)
            .field("state", &self.state)
            .field("pending_caps", &self.pending_caps)
            .field("negotiating", &self.negotiating)
            .finish_non_exhaustive()
    }
}

impl SaslEngine {
    /// Engine for a registration that requested `requested_caps`.
    pub fn new(config: &Config, requested_caps: usize) -> Self {
        Self {
            mechanism: config.sasl_mechanism,
            username: config.sasl_username.clone(),
            password: Zeroizing::new(config.sasl_password.clone()),
            key_file: config.sasl_key_file.clone(),
            state: SaslState::Idle,
            responder: None,
            inbound: String::new(),
            pending_caps: requested_caps,
            negotiating: requested_caps > 0,
            exchange_open: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> SaslState {
        self.state
    }

    /// True until `CAP END` has been sent.
    pub fn is_negotiating(&self) -> bool {
        self.negotiating
    }

    /// True for the commands this engine consumes.
    pub fn handles(command: &str) -> bool {
        matches!(
            command,
            "CAP" | "AUTHENTICATE" | "900" | "902" | "903" | "904" | "905" | "906" | "907" | "908"
        )
    }

    /// Process one server message; returns the lines to send.
    pub fn handle(&mut self, msg: &Message) -> Vec<String> {
        match msg.command.as_str() {
            "CAP" => self.on_cap(msg),
            "AUTHENTICATE" => self.on_authenticate(msg.param(0).unwrap_or("+")),
            "900" => {
                info!("{}", msg.trailing().unwrap_or("logged in"));
                Vec::new()
            }
            "903" => {
                info!("SASL authentication successful");
                self.finish(SaslState::Completed);
                self.maybe_end()
            }
            "902" | "904" | "905" | "907" | "908" => {
                warn!(
                    numeric = %msg.command,
                    "SASL authentication failed: {}",
                    msg.trailing().unwrap_or("")
                );
                if self.exchange_open {
                    self.abort()
                } else {
                    Vec::new()
                }
            }
            "906" => {
                info!("SASL authentication aborted");
                self.finish(SaslState::Aborted);
                self.maybe_end()
            }
            _ => Vec::new(),
        }
    }

    fn on_cap(&mut self, msg: &Message) -> Vec<String> {
        let ack = match msg.param(1).map(str::to_ascii_uppercase).as_deref() {
            Some("ACK") => true,
            Some("NAK") => false,
            _ => return Vec::new(),
        };
        let Some(list) = msg.params.get(2..).and_then(<[String]>::last) else {
            return Vec::new();
        };

        let mut lines = Vec::new();
        for cap in list.split_whitespace() {
            let name = cap.trim_start_matches(['-', '~', '=']);
            self.pending_caps = self.pending_caps.saturating_sub(1);

            if name.eq_ignore_ascii_case("sasl") {
                if ack {
                    lines.extend(self.start());
                } else {
                    warn!("server refused the sasl capability");
                }
            } else if ack {
                info!("{} enabled", name);
            } else {
                warn!("{} refused", name);
            }
        }
        lines.extend(self.maybe_end());
        lines
    }

    fn start(&mut self) -> Vec<String> {
        match self.responder_for_mechanism() {
            Ok(responder) => {
                self.responder = Some(responder);
                self.state = SaslState::AwaitingChallenge;
                self.exchange_open = true;
                vec![format!("AUTHENTICATE {}", self.mechanism.as_str())]
            }
            Err(e) => {
                warn!(mechanism = %self.mechanism, "cannot start SASL: {}", e);
                self.finish(SaslState::Aborted);
                Vec::new()
            }
        }
    }

    fn responder_for_mechanism(&self) -> Result<Responder, SaslError> {
        if self.username.is_empty() {
            return Err(SaslError::MissingCredentials);
        }
        match self.mechanism {
            SaslMechanismKind::Plain => Ok(Responder::Plain),
            SaslMechanismKind::EcdsaNist256pChallenge => {
                let path = self
                    .key_file
                    .as_deref()
                    .ok_or_else(|| SaslError::Key("sasl_key_file is not set".to_owned()))?;
                let key = challenge::load_key(path)?;
                Ok(Responder::Challenge(ChallengeResponder::new(&self.username, key)))
            }
            kind => {
                let digest =
                    ScramDigest::for_mechanism(kind).ok_or(SaslError::UnexpectedMessage("mechanism"))?;
                let client = ScramClient::new(digest, &self.username, &self.password)?;
                Ok(Responder::Scram(client))
            }
        }
    }

    fn on_authenticate(&mut self, payload: &str) -> Vec<String> {
        if self.state != SaslState::AwaitingChallenge {
            debug!(state = ?self.state, "ignoring AUTHENTICATE");
            return Vec::new();
        }
        // Server payloads are split into 400-byte pieces the same way ours are.
        if payload.len() == SASL_CHUNK_SIZE {
            self.inbound.push_str(payload);
            return Vec::new();
        }
        let data = if self.inbound.is_empty() {
            payload.to_owned()
        } else {
            let mut joined = std::mem::take(&mut self.inbound);
            if payload != "+" {
                joined.push_str(payload);
            }
            joined
        };

        let result = match self.responder.as_mut() {
            Some(Responder::Plain) => {
                self.state = SaslState::Completed;
                Ok(plain::response(&self.username, &self.password))
            }
            Some(Responder::Challenge(responder)) => responder.respond(&data),
            Some(Responder::Scram(client)) => client.respond(&data),
            None => Err(SaslError::UnexpectedMessage("no mechanism")),
        };

        match result {
            Ok(encoded) => authenticate_lines(&encoded),
            Err(e) => {
                warn!(mechanism = %self.mechanism, "SASL exchange failed: {}", e);
                self.abort()
            }
        }
    }

    /// `AUTHENTICATE *`, then `CAP END` if negotiation is still open.
    fn abort(&mut self) -> Vec<String> {
        let mut lines = Vec::with_capacity(2);
        if self.exchange_open {
            lines.push("AUTHENTICATE *".to_owned());
        }
        self.finish(SaslState::Aborted);
        lines.extend(self.maybe_end());
        lines
    }

    fn finish(&mut self, state: SaslState) {
        self.state = state;
        self.exchange_open = false;
        self.responder = None;
        self.inbound.clear();
        self.password.zeroize();
    }

    fn maybe_end(&mut self) -> Vec<String> {
        if self.negotiating && self.pending_caps == 0 && !self.exchange_open {
            self.negotiating = false;
            debug!("capability negotiation finished");
            return vec!["CAP END".to_owned()];
        }
        Vec::new()
    }
}
