//! TLS upgrade, custom trust anchors and hostname checking.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use common::{config, listen, Peer};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use slirc_net::manager::{REASON_CONNECT, REASON_HOSTNAME};
use slirc_net::{CipherSuite, Config, ConnectionManager, ConnectionRequest};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

struct TlsAssets {
    _dir: tempfile::TempDir,
    ca_path: PathBuf,
    acceptor: TlsAcceptor,
}

fn build_ca() -> (Certificate, KeyPair) {
    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, "slirc-net-test-ca");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let key_pair = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    (cert, key_pair)
}

/// CA on disk plus an acceptor serving a leaf for `names`.
fn tls_assets(names: &[&str]) -> TlsAssets {
    let (ca_cert, ca_key) = build_ca();

    let mut params =
        CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>()).unwrap();
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, names[0]);
    params.is_ca = IsCa::NoCa;
    let leaf_key = KeyPair::generate().unwrap();
    let leaf = params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let ca_path = dir.path().join("ca.pem");
    std::fs::write(&ca_path, ca_cert.pem()).unwrap();

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let server = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(leaf.der().to_vec())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
        )
        .unwrap();

    TlsAssets {
        _dir: dir,
        ca_path,
        acceptor: TlsAcceptor::from(Arc::new(server)),
    }
}

fn tls_config(assets: &TlsAssets) -> Config {
    Config {
        tls: true,
        ca_file: Some(assets.ca_path.clone()),
        ..config()
    }
}

/// Accept one TLS client, welcome it and wait for it to leave.
fn serve_welcome(listener: TcpListener, acceptor: TlsAcceptor) -> tokio::task::JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let tls = acceptor.accept(stream).await.unwrap();
        let mut peer = Peer::new(tls);
        peer.welcome("alice").await;
        peer.until_closed().await
    })
}

#[tokio::test]
async fn test_tls_with_custom_ca() {
    let assets = tls_assets(&["localhost"]);
    let (listener, port) = listen().await;
    let server = serve_welcome(listener, assets.acceptor.clone());

    let (manager, _events) = ConnectionManager::new(Arc::new(tls_config(&assets)));
    let req = ConnectionRequest::new("localhost", port, "alice");
    let established = manager.connect(&req).await.unwrap();
    assert!(established.tls);

    manager.disconnect(Some("tls bye")).await;
    assert_eq!(server.await.unwrap(), vec!["QUIT :tls bye"]);
}

#[tokio::test]
async fn test_tls13_only_policy() {
    let assets = tls_assets(&["localhost"]);
    let (listener, port) = listen().await;
    let server = serve_welcome(listener, assets.acceptor.clone());

    let config = Config {
        cipher_suite: CipherSuite::Secure,
        ..tls_config(&assets)
    };
    let (manager, _events) = ConnectionManager::new(Arc::new(config));
    let req = ConnectionRequest::new("localhost", port, "alice");
    assert!(manager.connect(&req).await.unwrap().tls);
    manager.disconnect(None).await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_hostname_mismatch_is_reported() {
    let assets = tls_assets(&["irc.elsewhere.test"]);
    let (listener, port) = listen().await;
    let acceptor = assets.acceptor.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ = acceptor.accept(stream).await;
    });

    let (manager, _events) = ConnectionManager::new(Arc::new(tls_config(&assets)));
    let req = ConnectionRequest::new("localhost", port, "alice");
    let err = manager.connect(&req).await.unwrap_err();
    assert_eq!(err.reason(), REASON_HOSTNAME);
    assert!(!manager.is_connected());
}

#[tokio::test]
async fn test_hostname_checking_off_accepts_mismatch() {
    let assets = tls_assets(&["irc.elsewhere.test"]);
    let (listener, port) = listen().await;
    let server = serve_welcome(listener, assets.acceptor.clone());

    let config = Config {
        hostname_checking: false,
        ..tls_config(&assets)
    };
    let (manager, _events) = ConnectionManager::new(Arc::new(config));
    let req = ConnectionRequest::new("localhost", port, "alice");
    assert!(manager.connect(&req).await.unwrap().tls);
    manager.disconnect(None).await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_unknown_issuer_fails_even_without_hostname_checking() {
    let assets = tls_assets(&["localhost"]);
    let (listener, port) = listen().await;
    let acceptor = assets.acceptor.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ = acceptor.accept(stream).await;
    });

    let config = Config {
        tls: true,
        hostname_checking: false,
        ..config()
    };
    let (manager, _events) = ConnectionManager::new(Arc::new(config));
    let req = ConnectionRequest::new("localhost", port, "alice");
    let err = manager.connect(&req).await.unwrap_err();
    assert_eq!(err.reason(), REASON_CONNECT);
}
