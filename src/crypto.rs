//! # TLS Identity Binding
//!
//! Every validator connection is a QUIC connection with mutual TLS:
//!
//! - **Self-Signed Certs**: each node generates its certificate from its Ed25519 keypair
//! - **Identity = Public Key**: the certificate's subject public key IS the peer identity
//! - **Mutual Auth**: the dialer pins the expected identity through the SNI,
//!   the listener extracts the dialer's identity from its client certificate
//!
//! No PKI is involved: trust comes from the topology, which names every
//! validator's identity up front.
//!
//! Certificate chains are never validated; the identity check above takes
//! their place through rustls' `dangerous()` verifier hooks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::ClientConfig;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::identity::{Identity, Keypair};

static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier shared by every mesh participant.
pub const ALPN: &[u8] = b"valmesh";

/// QUIC idle timeout; keep-alives below keep validator links open.
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

const MAX_CONCURRENT_BIDI_STREAMS: u32 = 256;

/// DER prefix of a PKCS#8 v1 Ed25519 private key; the 32-byte seed follows.
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04, 0x20,
];

/// Self-signed certificate whose subject key is the validator identity.
pub fn generate_ed25519_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut der = ED25519_PKCS8_PREFIX.to_vec();
    der.extend_from_slice(&keypair.secret_key_bytes());
    let pkcs8 = PrivatePkcs8KeyDer::from(der);

    let signer = rcgen::KeyPair::try_from(&pkcs8).context("invalid Ed25519 key material")?;
    let mut params = rcgen::CertificateParams::new(vec!["valmesh".to_string()])
        .context("invalid certificate parameters")?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, keypair.identity().to_hex());
    let cert = params
        .self_signed(&signer)
        .context("failed to self-sign validator certificate")?;

    Ok((vec![cert.der().clone()], PrivateKeyDer::Pkcs8(pkcs8)))
}

fn transport_config() -> Result<quinn::TransportConfig> {
    let idle = quinn::IdleTimeout::try_from(MAX_IDLE_TIMEOUT).context("idle timeout out of range")?;
    let mut transport = quinn::TransportConfig::default();
    transport
        .max_idle_timeout(Some(idle))
        .keep_alive_interval(Some(KEEP_ALIVE_INTERVAL))
        .max_concurrent_bidi_streams(MAX_CONCURRENT_BIDI_STREAMS.into());
    Ok(transport)
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut tls = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unavailable")?
        .with_client_cert_verifier(Arc::new(ValidatorClientVerifier))
        .with_single_cert(certs, key)
        .context("failed to build server TLS config")?;
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let quic = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
        .context("failed to build QUIC server config")?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(quic));
    config.transport_config(Arc::new(transport_config()?));
    Ok(config)
}

pub fn create_client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig> {
    let mut tls = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unavailable")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to build client TLS config")?;
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let quic = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .context("failed to build QUIC client config")?;
    let mut config = ClientConfig::new(Arc::new(quic));
    config.transport_config(Arc::new(transport_config()?));
    Ok(config)
}

/// Raw Ed25519 subject key of a DER certificate.
pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    <[u8; 32]>::try_from(&cert.public_key().subject_public_key.data[..]).ok()
}

/// Identity proven by the peer's certificate during the handshake.
pub fn extract_verified_identity(connection: &quinn::Connection) -> Option<Identity> {
    let presented = connection.peer_identity()?;
    let chain = presented.downcast_ref::<Vec<CertificateDer<'static>>>()?;
    extract_public_key_from_cert(chain.first()?.as_ref()).map(Identity::from_bytes)
}

/// Encode an identity as a DNS name (two 32-char labels, each under the 63 byte limit).
pub(crate) fn identity_to_sni(identity: &Identity) -> String {
    let hex = identity.to_hex();
    format!("{}.{}", &hex[..32], &hex[32..])
}

fn parse_identity_from_sni(sni: &str) -> Option<Identity> {
    Identity::from_hex(&sni.replace('.', "")).ok()
}

fn cert_error(e: rustls::CertificateError) -> rustls::Error {
    rustls::Error::InvalidCertificate(e)
}

fn cert_identity(cert: &CertificateDer<'_>) -> Result<Identity, rustls::Error> {
    extract_public_key_from_cert(cert.as_ref())
        .map(Identity::from_bytes)
        .ok_or_else(|| cert_error(rustls::CertificateError::BadEncoding))
}

fn check_tls12(
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &rustls::DigitallySignedStruct,
) -> Result<HandshakeSignatureValid, rustls::Error> {
    rustls::crypto::verify_tls12_signature(message, cert, dss, &CRYPTO_PROVIDER.signature_verification_algorithms)
}

fn check_tls13(
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &rustls::DigitallySignedStruct,
) -> Result<HandshakeSignatureValid, rustls::Error> {
    rustls::crypto::verify_tls13_signature(message, cert, dss, &CRYPTO_PROVIDER.signature_verification_algorithms)
}

/// Accepts any client presenting a well-formed Ed25519 key; the key becomes
/// the connection's peer identity.
#[derive(Debug)]
struct ValidatorClientVerifier;

impl rustls::server::danger::ClientCertVerifier for ValidatorClientVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        if !cert_identity(end_entity)?.is_valid() {
            return Err(cert_error(rustls::CertificateError::ApplicationVerificationFailure));
        }
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        check_tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        check_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// Accepts the server only if its key matches the identity encoded in SNI.
#[derive(Debug)]
struct PinnedServerVerifier;

impl rustls::client::danger::ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let rustls::pki_types::ServerName::DnsName(name) = server_name else {
            return Err(cert_error(rustls::CertificateError::ApplicationVerificationFailure));
        };
        let pinned = parse_identity_from_sni(name.as_ref())
            .ok_or_else(|| cert_error(rustls::CertificateError::BadEncoding))?;

        if cert_identity(end_entity)? != pinned {
            return Err(cert_error(rustls::CertificateError::NotValidForName));
        }
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        check_tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        check_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn certificate_subject_key_is_identity() {
        let mut seen = HashSet::new();
        for _ in 0..20 {
            let keypair = Keypair::generate();
            let (certs, _key) = generate_ed25519_cert(&keypair).unwrap();
            let key = extract_public_key_from_cert(certs[0].as_ref()).unwrap();
            assert_eq!(key, *keypair.identity().as_bytes());
            assert!(seen.insert(key));
        }
    }

    #[test]
    fn same_seed_same_certificate_key() {
        let keypair = Keypair::from_secret_key_bytes(&[3u8; 32]);
        let (a, _) = generate_ed25519_cert(&keypair).unwrap();
        let (b, _) = generate_ed25519_cert(&keypair).unwrap();
        assert_eq!(
            extract_public_key_from_cert(a[0].as_ref()),
            extract_public_key_from_cert(b[0].as_ref())
        );
    }

    #[test]
    fn sni_roundtrip() {
        let identity = Keypair::generate().identity();
        let sni = identity_to_sni(&identity);
        assert!(sni.split('.').all(|label| label.len() <= 63));
        assert_eq!(parse_identity_from_sni(&sni), Some(identity));
    }

    #[test]
    fn sni_rejects_garbage() {
        assert_eq!(parse_identity_from_sni("localhost"), None);
        assert_eq!(parse_identity_from_sni("abcd.ef"), None);
    }

    #[test]
    fn configs_build_from_generated_cert() {
        let keypair = Keypair::generate();
        let (certs, key) = generate_ed25519_cert(&keypair).unwrap();
        create_server_config(certs, key).expect("server config");
        let (certs, key) = generate_ed25519_cert(&keypair).unwrap();
        create_client_config(certs, key).expect("client config");
    }
}
