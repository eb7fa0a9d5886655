//! SCRAM client (RFC 5802, RFC 7677) over SHA-1, SHA-256 or SHA-512.
//!
//! # Protocol Flow
//!
//! 1. Client sends `client-first-message`: `n,,n=user,r=nonce`
//! 2. Server sends `server-first-message`: `r=nonce+server,s=salt,i=iterations`
//! 3. Client sends `client-final-message`: `c=biws,r=nonce+server,p=proof`
//! 4. Server sends `server-final-message`: `v=verifier`
//!
//! Every message is base64-wrapped at the `AUTHENTICATE` layer.
//!
//! # Reference
//! - RFC 5802: <https://tools.ietf.org/html/rfc5802>
//! - RFC 7677: <https://tools.ietf.org/html/rfc7677>

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Digest;
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use super::decode_base64;
use crate::config::SaslMechanismKind;
use crate::error::SaslError;

/// Length of the generated client nonce.
pub const NONCE_LEN: usize = 63;

/// Largest server-requested iteration count accepted. The salted password
/// is derived inline on the listener task, so this caps how long one
/// exchange can stall it.
pub const MAX_ITERATIONS: u32 = 1_000_000;

/// Printable characters allowed in a nonce (everything but `,`).
const NONCE_ALPHABET: &[u8] =
    b"!\"#$%&'()*+-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefghijklmnopqrstuvwxyz{|}~";

/// Channel-binding attribute for `n,,` (base64 of the GS2 header).
const CHANNEL_BINDING: &str = "biws";

/// Hash function backing a SCRAM variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScramDigest {
    /// SCRAM-SHA-1.
    Sha1,
    /// SCRAM-SHA-256.
    Sha256,
    /// SCRAM-SHA-512.
    Sha512,
}

impl ScramDigest {
    /// Digest for a configured mechanism, if it is a SCRAM one.
    pub fn for_mechanism(kind: SaslMechanismKind) -> Option<Self> {
        match kind {
            SaslMechanismKind::ScramSha1 => Some(Self::Sha1),
            SaslMechanismKind::ScramSha256 => Some(Self::Sha256),
            SaslMechanismKind::ScramSha512 => Some(Self::Sha512),
            _ => None,
        }
    }

    fn output_len(self) -> usize {
        match self {
            Self::Sha1 => <sha1::Sha1 as Digest>::output_size(),
            Self::Sha256 => <sha2::Sha256 as Digest>::output_size(),
            Self::Sha512 => <sha2::Sha512 as Digest>::output_size(),
        }
    }

    fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => sha1::Sha1::digest(data).to_vec(),
            Self::Sha256 => sha2::Sha256::digest(data).to_vec(),
            Self::Sha512 => sha2::Sha512::digest(data).to_vec(),
        }
    }

    fn hmac(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, SaslError> {
        macro_rules! mac {
            ($d:ty) => {{
                let mut mac = <Hmac<$d> as Mac>::new_from_slice(key)
                    .map_err(|e| SaslError::Crypto(e.to_string()))?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }};
        }
        Ok(match self {
            Self::Sha1 => mac!(sha1::Sha1),
            Self::Sha256 => mac!(sha2::Sha256),
            Self::Sha512 => mac!(sha2::Sha512),
        })
    }

    /// `Hi()` from RFC 5802, i.e. PBKDF2 with this digest's HMAC.
    fn hi(self, password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>, SaslError> {
        let mut out = vec![0u8; self.output_len()];
        let res = match self {
            Self::Sha1 => pbkdf2::pbkdf2::<Hmac<sha1::Sha1>>(password, salt, iterations, &mut out),
            Self::Sha256 => {
                pbkdf2::pbkdf2::<Hmac<sha2::Sha256>>(password, salt, iterations, &mut out)
            }
            Self::Sha512 => {
                pbkdf2::pbkdf2::<Hmac<sha2::Sha512>>(password, salt, iterations, &mut out)
            }
        };
        res.map_err(|e| SaslError::Crypto(e.to_string()))?;
        Ok(out)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Initial,
    ClientFirstSent,
    ClientFinalSent,
    Done,
}

impl Step {
    fn name(self) -> &'static str {
        match self {
            Step::Initial => "initial",
            Step::ClientFirstSent => "client-first sent",
            Step::ClientFinalSent => "client-final sent",
            Step::Done => "done",
        }
    }
}

/// SCRAM client state machine.
///
/// Secrets are zeroized on drop and as soon as the server-final message
/// has been checked, whatever the outcome.
pub struct ScramClient {
    digest: ScramDigest,
    username: String,
    password: Zeroizing<String>,
    client_nonce: String,
    client_first_bare: String,
    server_signature: Zeroizing<Vec<u8>>,
    step: Step,
}

impl std::fmt::Debug for ScramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScramClient")
            .field("digest", &self.digest)
            .field("username", &self.username)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

impl ScramClient {
    /// Create a client with a freshly generated nonce.
    pub fn new(digest: ScramDigest, username: &str, password: &str) -> Result<Self, SaslError> {
        Ok(Self::with_nonce(digest, username, password, &generate_nonce()?))
    }

    /// Create a client with a caller-supplied nonce (known-answer checks).
    pub fn with_nonce(digest: ScramDigest, username: &str, password: &str, nonce: &str) -> Self {
        Self {
            digest,
            username: username.to_owned(),
            password: Zeroizing::new(password.to_owned()),
            client_nonce: nonce.to_owned(),
            client_first_bare: String::new(),
            server_signature: Zeroizing::new(Vec::new()),
            step: Step::Initial,
        }
    }

    /// Digest in use.
    pub fn digest(&self) -> ScramDigest {
        self.digest
    }

    /// Client nonce; empty once the exchange has finished.
    pub fn client_nonce(&self) -> &str {
        &self.client_nonce
    }

    /// True while nonce or expected-signature state is held.
    pub fn has_pending_state(&self) -> bool {
        !self.client_nonce.is_empty() || !self.server_signature.is_empty()
    }

    /// Answer the next server payload. An empty result stands for `+`.
    pub fn respond(&mut self, payload: &str) -> Result<String, SaslError> {
        match self.step {
            Step::Initial => self.client_first(),
            Step::ClientFirstSent => self.handle_server_first(payload),
            Step::ClientFinalSent => self.verify_server_final(payload).map(|()| String::new()),
            Step::Done => Err(SaslError::UnexpectedMessage(self.step.name())),
        }
    }

    /// Build the base64 `client-first-message`.
    pub fn client_first(&mut self) -> Result<String, SaslError> {
        if self.step != Step::Initial {
            return Err(SaslError::UnexpectedMessage(self.step.name()));
        }
        self.client_first_bare = format!("n={},r={}", escape_username(&self.username), self.client_nonce);
        self.step = Step::ClientFirstSent;
        Ok(BASE64.encode(format!("n,,{}", self.client_first_bare)))
    }

    /// Consume the base64 `server-first-message` and build the base64
    /// `client-final-message`.
    pub fn handle_server_first(&mut self, encoded: &str) -> Result<String, SaslError> {
        if self.step != Step::ClientFirstSent {
            return Err(SaslError::UnexpectedMessage(self.step.name()));
        }
        let server_first = decode_utf8(encoded)?;
        let parsed = parse_server_first(&server_first)?;

        if !parsed.nonce.starts_with(&self.client_nonce)
            || parsed.nonce.len() <= self.client_nonce.len()
        {
            return Err(SaslError::NonceMismatch);
        }

        let without_proof = format!("c={},r={}", CHANNEL_BINDING, parsed.nonce);
        let auth_message = format!("{},{},{}", self.client_first_bare, server_first, without_proof);

        let d = self.digest;
        let salted = Zeroizing::new(d.hi(self.password.as_bytes(), &parsed.salt, parsed.iterations)?);
        let client_key = Zeroizing::new(d.hmac(&salted, b"Client Key")?);
        let server_key = Zeroizing::new(d.hmac(&salted, b"Server Key")?);
        let stored_key = Zeroizing::new(d.hash(&client_key));
        let client_signature = Zeroizing::new(d.hmac(&stored_key, auth_message.as_bytes())?);

        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        self.server_signature = Zeroizing::new(d.hmac(&server_key, auth_message.as_bytes())?);
        self.step = Step::ClientFinalSent;

        let client_final = format!("{},p={}", without_proof, BASE64.encode(proof));
        Ok(BASE64.encode(client_final))
    }

    /// Check the base64 `server-final-message` against the expected
    /// server signature. Nonce and signature state are cleared either way.
    pub fn verify_server_final(&mut self, encoded: &str) -> Result<(), SaslError> {
        if self.step != Step::ClientFinalSent {
            return Err(SaslError::UnexpectedMessage(self.step.name()));
        }
        let result = self.check_server_final(encoded);
        self.clear();
        result
    }

    fn check_server_final(&self, encoded: &str) -> Result<(), SaslError> {
        let server_final = decode_utf8(encoded)?;
        if let Some(err) = server_final.strip_prefix("e=") {
            debug!(error = err, "server rejected SCRAM proof");
            return Err(SaslError::ServerVerificationFailed);
        }
        let verifier = server_final
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or(SaslError::ServerVerificationFailed)?;
        let verifier = BASE64
            .decode(verifier)
            .map_err(|_| SaslError::InvalidEncoding)?;

        if verifier.as_slice() != self.server_signature.as_slice() {
            return Err(SaslError::ServerVerificationFailed);
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.client_nonce.zeroize();
        self.client_first_bare.zeroize();
        self.server_signature.zeroize();
        self.password.zeroize();
        self.step = Step::Done;
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct ServerFirst {
    nonce: String,
    salt: Vec<u8>,
    iterations: u32,
}

fn parse_server_first(message: &str) -> Result<ServerFirst, SaslError> {
    let mut parts = message.split(',');

    let nonce = parts
        .next()
        .and_then(|p| p.strip_prefix("r="))
        .filter(|n| !n.is_empty())
        .ok_or(SaslError::MissingNonce)?;
    let salt = parts
        .next()
        .and_then(|p| p.strip_prefix("s="))
        .ok_or(SaslError::MissingSalt)?;
    let iterations = parts
        .next()
        .and_then(|p| p.strip_prefix("i="))
        .ok_or(SaslError::MissingIterations)?;

    let salt = BASE64.decode(salt).map_err(|_| SaslError::InvalidEncoding)?;
    let iterations: u32 = iterations
        .parse()
        .map_err(|_| SaslError::InvalidIterations)?;
    if iterations == 0 || iterations > MAX_ITERATIONS {
        debug!(iterations, "rejecting SCRAM iteration count");
        return Err(SaslError::InvalidIterations);
    }

    Ok(ServerFirst {
        nonce: nonce.to_owned(),
        salt,
        iterations,
    })
}

fn decode_utf8(encoded: &str) -> Result<String, SaslError> {
    let bytes = decode_base64(encoded).map_err(|_| SaslError::InvalidEncoding)?;
    String::from_utf8(bytes).map_err(|_| SaslError::InvalidEncoding)
}

/// `=` and `,` must be escaped in the SCRAM user name.
fn escape_username(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

/// Generate a nonce of [`NONCE_LEN`] characters from the OS RNG.
pub fn generate_nonce() -> Result<String, SaslError> {
    // Largest multiple of the alphabet size that fits in a byte.
    let limit = (256 / NONCE_ALPHABET.len() * NONCE_ALPHABET.len()) as u8;
    let mut nonce = String::with_capacity(NONCE_LEN);
    let mut buf = [0u8; 64];

    while nonce.len() < NONCE_LEN {
        getrandom::getrandom(&mut buf).map_err(|e| SaslError::Crypto(e.to_string()))?;
        for &b in buf.iter().filter(|&&b| b < limit) {
            if nonce.len() == NONCE_LEN {
                break;
            }
            nonce.push(NONCE_ALPHABET[b as usize % NONCE_ALPHABET.len()] as char);
        }
    }
    Ok(nonce)
}
