//! Fetches a node's TLS leaf certificate by performing a one-shot handshake against its
//! REST port, mirroring `ssl.get_server_certificate`'s "pin on first connect" trust model: no
//! chain validation, the presented leaf is captured and returned PEM-encoded.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

#[derive(Debug)]
struct CaptureAnyCert {
    captured: std::sync::Mutex<Option<CertificateDer<'static>>>,
}

impl ServerCertVerifier for CaptureAnyCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        *self.captured.lock().unwrap() = Some(end_entity.clone().into_owned());
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

/// Connects to `address:port`, performs a TLS handshake accepting any presented certificate,
/// and returns the leaf certificate PEM-encoded.
pub async fn fetch_leaf_cert_pem(address: &str, port: u16) -> Result<String, std::io::Error> {
    let capture = Arc::new(CaptureAnyCert { captured: std::sync::Mutex::new(None) });

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(capture.clone())
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let tcp = TcpStream::connect((address, port)).await?;
    let server_name = ServerName::try_from(address.to_string())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    // The handshake itself fails cert validation paths never, since our verifier accepts
    // anything; errors here are transport-level only.
    let _tls = connector.connect(server_name, tcp).await?;

    let der = capture
        .captured
        .lock()
        .unwrap()
        .clone()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no certificate presented"))?;

    Ok(der_to_pem(der.as_ref()))
}

fn der_to_pem(der: &[u8]) -> String {
    use base64::Engine;
    let b64 = base64::engine::general_purpose::STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).unwrap());
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn der_to_pem_wraps_in_markers() {
        let pem = der_to_pem(&[1, 2, 3, 4]);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));
    }

    #[tokio::test]
    async fn fetch_from_unreachable_port_fails() {
        let result = fetch_leaf_cert_pem("127.0.0.1", 1).await;
        assert!(result.is_err());
    }
}
