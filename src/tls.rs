//! TLS client configuration.
//!
//! Builds a rustls [`ClientConfig`] on the ring provider with the
//! configured cipher-suite policy and trust anchors. Certificate chains
//! are always verified; when hostname checking is off only the
//! name-mismatch error of an otherwise valid chain is forgiven.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    SupportedCipherSuite, SupportedProtocolVersion,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::{CipherSuite, Config};
use crate::error::{NetError, Result};

/// Cipher suites and protocol versions allowed by `policy`.
pub fn provider_for(policy: CipherSuite) -> CryptoProvider {
    let mut provider = ring::default_provider();
    match policy {
        CipherSuite::Secure => {
            provider
                .cipher_suites
                .retain(|s| matches!(s, SupportedCipherSuite::Tls13(_)));
        }
        CipherSuite::Compat => {
            provider.cipher_suites.retain(|s| match s {
                SupportedCipherSuite::Tls13(_) => true,
                SupportedCipherSuite::Tls12(_) => is_ecdhe_aead(s.suite()),
            });
        }
        CipherSuite::Legacy | CipherSuite::All => {}
    }
    provider
}

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Protocol versions allowed by `policy`.
pub fn versions_for(policy: CipherSuite) -> &'static [&'static SupportedProtocolVersion] {
    match policy {
        CipherSuite::Secure => TLS13_ONLY,
        _ => rustls::ALL_VERSIONS,
    }
}

fn is_ecdhe_aead(suite: rustls::CipherSuite) -> bool {
    use rustls::CipherSuite as Cs;
    matches!(
        suite,
        Cs::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
            | Cs::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
            | Cs::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
            | Cs::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
            | Cs::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
            | Cs::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
    )
}

/// Built-in web roots plus the PEM certificates in `ca_file`.
pub fn root_store(ca_file: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = ca_file {
        let mut reader = BufReader::new(File::open(path)?);
        let mut added = 0usize;
        for cert in rustls_pemfile::certs(&mut reader) {
            roots.add(cert?)?;
            added += 1;
        }
        debug!(path = %path.display(), added, "loaded extra trust anchors");
    }

    Ok(roots)
}

/// Chain verifier that can forgive a name mismatch.
#[derive(Debug)]
pub struct HostnamePolicyVerifier {
    inner: Arc<WebPkiServerVerifier>,
    check_hostname: bool,
}

impl HostnamePolicyVerifier {
    /// Wrap a WebPKI verifier built from `roots`.
    pub fn new(
        roots: RootCertStore,
        provider: Arc<CryptoProvider>,
        check_hostname: bool,
    ) -> Result<Self> {
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| NetError::Tls(rustls::Error::General(e.to_string())))?;
        Ok(Self {
            inner,
            check_hostname,
        })
    }
}

impl ServerCertVerifier for HostnamePolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) if !self.check_hostname => {
                warn!(server = ?server_name, "certificate name mismatch ignored");
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Build the client configuration described by `config`.
pub fn client_config(config: &Config) -> Result<ClientConfig> {
    let provider = Arc::new(provider_for(config.cipher_suite));
    let roots = root_store(config.ca_file.as_deref())?;
    let verifier =
        HostnamePolicyVerifier::new(roots, Arc::clone(&provider), config.hostname_checking)?;

    let tls = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(versions_for(config.cipher_suite))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(tls)
}

/// Perform the client handshake for `host` over `stream`.
///
/// # Errors
///
/// [`NetError::Tls`] carries the rustls error (use
/// [`NetError::is_hostname_mismatch`] to tell name failures apart).
pub async fn handshake<S>(
    connector: &TlsConnector,
    host: &str,
    stream: S,
) -> Result<TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let name = ServerName::try_from(host.to_owned())
        .map_err(|_| NetError::InvalidServerName(host.to_owned()))?;

    connector.connect(name, stream).await.map_err(unwrap_tls_error)
}

fn unwrap_tls_error(err: std::io::Error) -> NetError {
    if let Some(tls) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        return NetError::Tls(tls.clone());
    }
    NetError::Io(err)
}
