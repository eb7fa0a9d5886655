//! PLAIN mechanism (RFC 4616).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use zeroize::Zeroizing;

/// Encode `authzid NUL authcid NUL password` as base64.
pub fn encode(authzid: &str, authcid: &str, password: &str) -> String {
    let payload = Zeroizing::new(format!("{}\0{}\0{}", authzid, authcid, password));
    BASE64.encode(payload.as_bytes())
}

/// Response for the initial `AUTHENTICATE +`; the user authorizes as itself.
pub fn response(username: &str, password: &str) -> String {
    encode(username, username, password)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_with_authzid() {
        let decoded = BASE64.decode(encode("admin", "testuser", "testpass")).unwrap();
        assert_eq!(decoded, b"admin\0testuser\0testpass");
    }

    #[test]
    fn test_response_repeats_user() {
        let decoded = BASE64.decode(response("alice", "hunter2")).unwrap();
        assert_eq!(decoded, b"alice\0alice\0hunter2");
    }
}
