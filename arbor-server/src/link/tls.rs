//! The TLS hook for server links.
//!
//! Link TLS does not use the web PKI: peers present whatever
//! certificate they like and the CAPAB layer enforces the pinned
//! SHA-256 fingerprint from the link block. The verifiers here
//! therefore accept any chain and only surface the certificate for
//! pinning.

use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector, client, server};

use crate::config::ServerConfig;

/// Hex SHA-256 of a certificate's DER encoding, the form pinned in
/// link blocks.
pub fn cert_fingerprint(cert: &CertificateDer<'_>) -> String {
    let digest = Sha256::digest(cert.as_ref());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// The installed TLS hook. Built once at startup when link TLS is
/// configured.
pub struct TlsHook {
    connector: TlsConnector,
    acceptor: Option<TlsAcceptor>,
}

impl TlsHook {
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let identity = match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => Some(load_identity(cert, key)?),
            _ => None,
        };

        let client_builder = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinTrustVerifier));
        let client_config = match identity.as_ref().map(|(chain, key)| (chain.clone(), key.clone_key())) {
            Some((chain, key)) => client_builder
                .with_client_auth_cert(chain, key)
                .context("loading client certificate for link TLS")?,
            None => client_builder.with_no_client_auth(),
        };

        let acceptor = match identity {
            Some((chain, key)) => {
                let server_config = rustls::ServerConfig::builder()
                    .with_client_cert_verifier(Arc::new(PinTrustClientVerifier))
                    .with_single_cert(chain, key)
                    .context("loading server certificate for link TLS")?;
                Some(TlsAcceptor::from(Arc::new(server_config)))
            }
            None => None,
        };

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config)),
            acceptor,
        })
    }

    /// Wraps an outbound stream. Returns the stream and the peer's
    /// certificate fingerprint, if one was presented.
    pub async fn on_connect(
        &self,
        stream: TcpStream,
        host: &str,
    ) -> Result<(client::TlsStream<TcpStream>, Option<String>)> {
        let name = ServerName::try_from(host.to_string())
            .unwrap_or_else(|_| ServerName::try_from("localhost".to_string()).expect("static name"));
        let stream = self
            .connector
            .connect(name, stream)
            .await
            .context("TLS handshake (outbound link)")?;
        let fp = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(cert_fingerprint);
        Ok((stream, fp))
    }

    /// Wraps an inbound stream, if an acceptor is configured.
    pub async fn on_accept(
        &self,
        stream: TcpStream,
    ) -> Result<(server::TlsStream<TcpStream>, Option<String>)> {
        let acceptor = self
            .acceptor
            .as_ref()
            .context("inbound TLS links need --tls-cert and --tls-key")?;
        let stream = acceptor
            .accept(stream)
            .await
            .context("TLS handshake (inbound link)")?;
        let fp = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(cert_fingerprint);
        Ok((stream, fp))
    }
}

type Identity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

fn load_identity(cert_path: &str, key_path: &str) -> Result<Identity> {
    let cert_pem = std::fs::read(cert_path).with_context(|| format!("reading {cert_path}"))?;
    let key_pem = std::fs::read(key_path).with_context(|| format!("reading {key_path}"))?;
    let chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::io::Result<Vec<_>>>()
        .context("parsing certificate chain")?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("parsing private key")?
        .context("no private key found")?;
    Ok((chain, key))
}

/// Accepts any server certificate; authentication happens by
/// fingerprint pin, not chain validation.
#[derive(Debug)]
struct PinTrustVerifier;

impl rustls::client::danger::ServerCertVerifier for PinTrustVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default()
    }
}

/// Requests (but does not require) a client certificate so inbound
/// links can be fingerprint-pinned too.
#[derive(Debug)]
struct PinTrustClientVerifier;

impl rustls::server::danger::ClientCertVerifier for PinTrustClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default()
    }
}
