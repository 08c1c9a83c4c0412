//! TLS security layer: rustls configs built from stream settings.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::common::{Destination, IntoStream, Stream};
use crate::error::{Error, Result};

use super::TlsSettings;

/// Build a server-side acceptor from certificate and key files.
pub fn acceptor(settings: &TlsSettings) -> Result<TlsAcceptor> {
    let cert_path = settings
        .certificate_file
        .as_ref()
        .ok_or_else(|| Error::Config("TLS server requires a certificate file".into()))?;
    let key_path = settings
        .key_file
        .as_ref()
        .ok_or_else(|| Error::Config("TLS server requires a key file".into()))?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<std::io::Result<Vec<_>>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| Error::Config(format!("no private key found in {}", key_path)))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("invalid TLS certificate: {}", e)))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client configuration: system roots, or no verification at all when
/// `allow_insecure` is set.
fn client_config(settings: &TlsSettings) -> rustls::ClientConfig {
    if settings.allow_insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
            .with_no_client_auth()
    } else {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }
}

/// Wrap an outgoing stream in a client-side TLS handshake. SNI comes from
/// the configured server name, falling back to the destination host.
pub async fn wrap_client<S>(conn: S, dest: &Destination, settings: &TlsSettings) -> Result<Stream>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let server_name = settings
        .server_name
        .clone()
        .unwrap_or_else(|| dest.address.to_string());
    let name = ServerName::try_from(server_name.clone())
        .map_err(|_| Error::InvalidAddress(server_name))?;

    let connector = TlsConnector::from(Arc::new(client_config(settings)));
    let stream = connector
        .connect(name, conn)
        .await
        .map_err(|e| Error::Transport(format!("TLS handshake failed: {}", e)))?;
    Ok(stream.into_stream())
}

/// Accepts any server certificate. Installed only when the settings ask
/// for `allow_insecure`.
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acceptor_requires_certificate() {
        let settings = TlsSettings::default();
        assert!(matches!(acceptor(&settings), Err(Error::Config(_))));
    }

    #[test]
    fn test_client_config_insecure_builds() {
        let settings = TlsSettings {
            allow_insecure: true,
            ..Default::default()
        };
        // Must not panic; verifier installation is the interesting part.
        let _ = client_config(&settings);
    }
}
