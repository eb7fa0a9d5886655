//! SASL during registration against a scripted server.

mod common;

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use common::{config, listen, Peer};
use hmac::{Hmac, Mac};
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::Signature;
use sha2::{Digest, Sha256};
use slirc_net::sasl::challenge;
use slirc_net::{Config, ConnectionManager, ConnectionRequest, SaslMechanismKind};
use tokio::net::TcpStream;

const SALT: &[u8] = b"pepper and salt";
const ITERATIONS: u32 = 4096;

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn b64_decode_str(payload: &str) -> String {
    String::from_utf8(BASE64.decode(payload).unwrap()).unwrap()
}

fn authenticate_payload(line: &str) -> &str {
    line.strip_prefix("AUTHENTICATE ").expect("AUTHENTICATE line")
}

/// Server half of SCRAM-SHA-256. Returns false if the client proof is wrong.
async fn scram_server(peer: &mut Peer<TcpStream>, password: &str, tamper_final: bool) -> bool {
    peer.send("AUTHENTICATE +").await;

    let client_first = b64_decode_str(authenticate_payload(&peer.line().await));
    let client_first_bare = client_first.strip_prefix("n,,").unwrap().to_owned();
    let client_nonce = client_first_bare.split_once(",r=").unwrap().1.to_owned();
    assert_eq!(client_nonce.len(), 63);

    let nonce = format!("{}srv-nonce", client_nonce);
    let server_first = format!("r={},s={},i={}", nonce, BASE64.encode(SALT), ITERATIONS);
    peer.send(&format!("AUTHENTICATE {}", BASE64.encode(&server_first)))
        .await;

    let client_final = b64_decode_str(authenticate_payload(&peer.line().await));
    let (without_proof, proof) = client_final.rsplit_once(",p=").unwrap();
    assert_eq!(without_proof, format!("c=biws,r={}", nonce));
    let proof = BASE64.decode(proof).unwrap();

    let mut salted = [0u8; 32];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), SALT, ITERATIONS, &mut salted).unwrap();
    let client_key = hmac_sha256(&salted, b"Client Key");
    let stored_key = Sha256::digest(&client_key).to_vec();
    let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
    let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
    let recovered: Vec<u8> = proof
        .iter()
        .zip(&client_signature)
        .map(|(p, s)| p ^ s)
        .collect();
    if Sha256::digest(&recovered).to_vec() != stored_key {
        return false;
    }

    let server_key = hmac_sha256(&salted, b"Server Key");
    let mut server_signature = hmac_sha256(&server_key, auth_message.as_bytes());
    if tamper_final {
        server_signature[0] ^= 0xff;
    }
    let server_final = format!("v={}", BASE64.encode(server_signature));
    peer.send(&format!("AUTHENTICATE {}", BASE64.encode(server_final)))
        .await;
    true
}

fn scram_config() -> Config {
    Config {
        sasl: true,
        sasl_mechanism: SaslMechanismKind::ScramSha256,
        sasl_username: "alice".to_owned(),
        sasl_password: "correct horse".to_owned(),
        ..config()
    }
}

#[tokio::test]
async fn test_scram_sha256_during_registration() {
    let (listener, port) = listen().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut peer = Peer::new(stream);
        let registration = peer.registration().await;
        assert_eq!(
            registration,
            vec!["CAP REQ :sasl", "NICK alice", "USER alice 8 * :alice"]
        );

        peer.send(":irc.test CAP * ACK :sasl").await;
        assert_eq!(peer.line().await, "AUTHENTICATE SCRAM-SHA-256");
        assert!(scram_server(&mut peer, "correct horse", false).await);

        assert_eq!(peer.line().await, "AUTHENTICATE +");
        peer.send(":irc.test 900 alice alice!alice@host alice :You are now logged in as alice")
            .await;
        peer.send(":irc.test 903 alice :SASL authentication successful")
            .await;
        assert_eq!(peer.line().await, "CAP END");
        peer.send(":irc.test 001 alice :Welcome").await;
        peer.until_closed().await
    });

    let (manager, _events) = ConnectionManager::new(Arc::new(scram_config()));
    let req = ConnectionRequest::new("127.0.0.1", port, "alice");
    manager.connect(&req).await.unwrap();
    manager.disconnect(None).await;

    assert_eq!(server.await.unwrap(), vec!["QUIT"]);
}

#[tokio::test]
async fn test_bad_server_signature_aborts_but_registers() {
    let (listener, port) = listen().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut peer = Peer::new(stream);
        peer.registration().await;
        peer.send(":irc.test CAP * ACK :sasl").await;
        assert_eq!(peer.line().await, "AUTHENTICATE SCRAM-SHA-256");
        assert!(scram_server(&mut peer, "correct horse", true).await);

        assert_eq!(peer.line().await, "AUTHENTICATE *");
        assert_eq!(peer.line().await, "CAP END");
        peer.send(":irc.test 906 alice :SASL authentication aborted")
            .await;
        peer.send(":irc.test 001 alice :Welcome").await;
        peer.until_closed().await
    });

    let (manager, _events) = ConnectionManager::new(Arc::new(scram_config()));
    let req = ConnectionRequest::new("127.0.0.1", port, "alice");
    manager.connect(&req).await.unwrap();
    manager.disconnect(Some("later")).await;

    assert_eq!(server.await.unwrap(), vec!["QUIT :later"]);
}

#[tokio::test]
async fn test_cap_nak_ends_negotiation() {
    let (listener, port) = listen().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut peer = Peer::new(stream);
        let registration = peer.registration().await;
        assert_eq!(
            &registration[..2],
            &["CAP REQ :server-time".to_owned(), "CAP REQ :sasl".to_owned()]
        );
        peer.send(":irc.test CAP * ACK :server-time").await;
        peer.send(":irc.test CAP * NAK :sasl").await;
        assert_eq!(peer.line().await, "CAP END");
        peer.send(":irc.test 001 alice :Welcome").await;
        peer.until_closed().await
    });

    let config = Config {
        server_time: true,
        ..scram_config()
    };
    let (manager, _events) = ConnectionManager::new(Arc::new(config));
    let req = ConnectionRequest::new("127.0.0.1", port, "alice");
    manager.connect(&req).await.unwrap();
    manager.disconnect(None).await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_plain_without_tls_is_not_requested() {
    let (listener, port) = listen().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut peer = Peer::new(stream);
        let registration = peer.welcome("alice").await;
        peer.until_closed().await;
        registration
    });

    let config = Config {
        sasl_mechanism: SaslMechanismKind::Plain,
        ..scram_config()
    };
    let (manager, _events) = ConnectionManager::new(Arc::new(config));
    let req = ConnectionRequest::new("127.0.0.1", port, "alice");
    manager.connect(&req).await.unwrap();
    manager.disconnect(None).await;

    assert_eq!(
        server.await.unwrap(),
        vec!["NICK alice", "USER alice 8 * :alice"]
    );
}

#[tokio::test]
async fn test_ecdsa_challenge_signature_verifies() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("alice.pem");
    let key = challenge::generate_key(&key_path, false).unwrap();
    let verifying_key = key.verifying_key().clone();

    let (listener, port) = listen().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut peer = Peer::new(stream);
        peer.registration().await;
        peer.send(":irc.test CAP * ACK :sasl").await;
        assert_eq!(peer.line().await, "AUTHENTICATE ECDSA-NIST256P-CHALLENGE");

        peer.send("AUTHENTICATE +").await;
        let account = b64_decode_str(authenticate_payload(&peer.line().await));
        assert_eq!(account, "alice");

        let nonce = [0x5au8; 32];
        peer.send(&format!("AUTHENTICATE {}", BASE64.encode(nonce)))
            .await;
        let der = BASE64
            .decode(authenticate_payload(&peer.line().await))
            .unwrap();
        let signature = Signature::from_der(&der).unwrap();
        assert!(verifying_key.verify_prehash(&nonce, &signature).is_ok());

        peer.send(":irc.test 903 alice :SASL authentication successful")
            .await;
        assert_eq!(peer.line().await, "CAP END");
        peer.send(":irc.test 001 alice :Welcome").await;
        peer.until_closed().await
    });

    let config = Config {
        sasl: true,
        sasl_mechanism: SaslMechanismKind::EcdsaNist256pChallenge,
        sasl_username: "alice".to_owned(),
        sasl_key_file: Some(key_path),
        ..config()
    };
    let (manager, _events) = ConnectionManager::new(Arc::new(config));
    let req = ConnectionRequest::new("127.0.0.1", port, "alice");
    manager.connect(&req).await.unwrap();
    manager.disconnect(None).await;
    server.await.unwrap();
}
