use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rustls_pki_types::CertificateDer;
use tokio_rustls::rustls::ServerConnection;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::http::headers::HeaderList;

/// Facts about a client's TLS session, captured right after the handshake
/// so they survive the stream being boxed away.
#[derive(Debug, Clone, Default)]
pub struct TlsInfo {
    pub cipher: Option<String>,
    pub client_cert: Option<ClientCertInfo>,
}

#[derive(Debug, Clone)]
pub struct ClientCertInfo {
    pub subject: String,
    pub issuer: String,
    pub not_before: String,
    pub not_after: String,
    pub serial: String,
    /// The whole certificate, PEM body without line breaks.
    pub pem_oneline: String,
}

impl TlsInfo {
    pub fn from_connection(conn: &ServerConnection) -> TlsInfo {
        let cipher = match (conn.protocol_version(), conn.negotiated_cipher_suite()) {
            (Some(ver), Some(suite)) => Some(format!("{ver:?}/{:?}", suite.suite())),
            _ => None,
        };
        let client_cert = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .and_then(parse_client_cert);
        TlsInfo { cipher, client_cert }
    }

    /// Inject the X-SSL request headers a backend uses to see the client
    /// side of the TLS session.
    pub fn append_headers(&self, headers: &mut HeaderList) {
        if let Some(cipher) = &self.cipher {
            headers.append_line(&format!("X-SSL-cipher: {cipher}"));
        }
        if let Some(cert) = &self.client_cert {
            headers.append_line(&format!("X-SSL-Subject: {}", cert.subject));
            headers.append_line(&format!("X-SSL-Issuer: {}", cert.issuer));
            headers.append_line(&format!("X-SSL-notBefore: {}", cert.not_before));
            headers.append_line(&format!("X-SSL-notAfter: {}", cert.not_after));
            headers.append_line(&format!("X-SSL-serial: {}", cert.serial));
            headers.append_line(&format!("X-SSL-certificate: {}", cert.pem_oneline));
        }
    }
}

fn parse_client_cert(der: &CertificateDer<'_>) -> Option<ClientCertInfo> {
    let (_, cert) = X509Certificate::from_der(der.as_ref()).ok()?;
    Some(ClientCertInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before: cert.validity().not_before.to_string(),
        not_after: cert.validity().not_after.to_string(),
        serial: cert.tbs_certificate.serial.to_string(),
        pem_oneline: BASE64.encode(der.as_ref()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_reflect_available_facts() {
        let info = TlsInfo {
            cipher: Some("TLSv1_3/TLS13_AES_128_GCM_SHA256".into()),
            client_cert: None,
        };
        let mut headers = HeaderList::new();
        info.append_headers(&mut headers);
        assert_eq!(
            headers.named_value("X-SSL-cipher"),
            Some("TLSv1_3/TLS13_AES_128_GCM_SHA256")
        );
        assert!(headers.named_value("X-SSL-Subject").is_none());
    }
}
