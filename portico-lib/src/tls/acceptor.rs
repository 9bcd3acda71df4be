use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::ring::sign::any_supported_type;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, Error as RustlsError, RootCertStore, ServerConfig,
    SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::error::{ProxyError, Result};

/// One certificate context: the names it answers for and the key material.
struct SniCert {
    names: Vec<String>,
    key: Arc<CertifiedKey>,
}

/// SNI dispatch: fnmatch the ServerName against each context's CN and DNS
/// subjectAltNames; first hit wins; fallback is the first context.
#[derive(Debug)]
struct SniResolver {
    certs: Vec<SniCert>,
}

impl std::fmt::Debug for SniCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniCert").field("names", &self.names).finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        if let Some(server_name) = hello.server_name() {
            for cert in &self.certs {
                if cert.names.iter().any(|pat| fnmatch(pat, server_name)) {
                    return Some(Arc::clone(&cert.key));
                }
            }
            debug!(%server_name, "no SNI match, using first certificate");
        }
        self.certs.first().map(|c| Arc::clone(&c.key))
    }
}

/// Shell-style wildcard match (`*` and `?`), the way certificate names
/// are compared against a TLS ServerName. Case-insensitive.
pub fn fnmatch(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(a), Some(b)) if a.eq_ignore_ascii_case(b) => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

/// Names a certificate answers for: subject CN plus DNS subjectAltNames.
fn cert_names(der: &CertificateDer<'_>) -> Vec<String> {
    let mut names = Vec::new();
    let Ok((_, cert)) = X509Certificate::from_der(der.as_ref()) else {
        return names;
    };
    for cn in cert.subject().iter_common_name() {
        if let Ok(s) = cn.as_str() {
            names.push(s.to_string());
        }
    }
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for gn in &san.value.general_names {
            if let GeneralName::DNSName(dns) = gn {
                names.push((*dns).to_string());
            }
        }
    }
    names.dedup();
    names
}

/// Load one PEM file holding the private key and the certificate chain,
/// leaf first.
fn load_cert_file(path: &Path) -> Result<SniCert> {
    let bytes = std::fs::read(path)
        .map_err(|e| ProxyError::Tls(format!("can't read {}: {e}", path.display())))?;

    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_slice_iter(&bytes)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("bad certificate in {}: {e:?}", path.display())))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }

    let key = PrivateKeyDer::pem_slice_iter(&bytes)
        .next()
        .ok_or(ProxyError::NoPrivateKey)?
        .map_err(|e| ProxyError::Tls(format!("bad private key in {}: {e:?}", path.display())))?;
    let signing_key = any_supported_type(&key)
        .map_err(|e| ProxyError::Tls(format!("unusable key in {}: {e}", path.display())))?;

    let names = cert_names(&certs[0]);
    Ok(SniCert {
        names,
        key: Arc::new(CertifiedKey::new(certs, signing_key)),
    })
}

fn load_crls(path: &Path) -> Result<Vec<rustls_pki_types::CertificateRevocationListDer<'static>>> {
    let bytes = std::fs::read(path)
        .map_err(|e| ProxyError::Tls(format!("can't read {}: {e}", path.display())))?;
    rustls_pki_types::CertificateRevocationListDer::pem_slice_iter(&bytes)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("bad CRL in {}: {e:?}", path.display())))
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let bytes = std::fs::read(path)
        .map_err(|e| ProxyError::Tls(format!("can't read {}: {e}", path.display())))?;
    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(&bytes) {
        let cert =
            cert.map_err(|e| ProxyError::Tls(format!("bad CA cert in {}: {e:?}", path.display())))?;
        roots
            .add(cert)
            .map_err(|e| ProxyError::Tls(format!("can't add CA cert: {e}")))?;
    }
    Ok(roots)
}

/// The TLS termination context of one HTTPS listener.
pub struct TlsServer {
    pub acceptor: TlsAcceptor,
}

impl std::fmt::Debug for TlsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsServer").finish_non_exhaustive()
    }
}

impl TlsServer {
    /// Build from a list of combined key+chain PEM files (a path that is
    /// a directory contributes every regular file inside). `client_cert`
    /// is the verify mode 0..3; 1 demands a verified certificate, 2 and 3
    /// request one but proceed without.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        cert_paths: &[PathBuf],
        client_cert: u8,
        ca_list: Option<&Path>,
        crl_list: Option<&Path>,
        ciphers: Option<&str>,
        disable_tls12: bool,
    ) -> Result<TlsServer> {
        let mut certs = Vec::new();
        for path in cert_paths {
            if path.is_dir() {
                let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
                    .map_err(|e| ProxyError::Tls(format!("can't list {}: {e}", path.display())))?
                    .filter_map(|ent| ent.ok().map(|e| e.path()))
                    .filter(|p| p.is_file())
                    .collect();
                entries.sort();
                for file in entries {
                    certs.push(load_cert_file(&file)?);
                }
            } else {
                certs.push(load_cert_file(path)?);
            }
        }
        if certs.is_empty() {
            return Err(ProxyError::Tls("HTTPS listener without certificates".into()));
        }

        // rustls picks cipher suites from its provider; an explicit spec
        // filters that set by suite name
        let provider = Arc::new(filtered_provider(ciphers)?);

        let builder = if disable_tls12 {
            ServerConfig::builder_with_provider(provider)
                .with_protocol_versions(&[&tokio_rustls::rustls::version::TLS13])
        } else {
            ServerConfig::builder_with_provider(provider)
                .with_protocol_versions(tokio_rustls::rustls::ALL_VERSIONS)
        }
        .map_err(|e| ProxyError::Tls(format!("protocol setup: {e}")))?;

        let builder = match client_cert {
            0 => builder.with_no_client_auth(),
            mode => {
                let ca = ca_list.ok_or_else(|| {
                    ProxyError::Tls("client certificate verification requires a CA list".into())
                })?;
                let roots = Arc::new(load_roots(ca)?);
                let mut vb = WebPkiClientVerifier::builder(roots);
                if let Some(crl_path) = crl_list {
                    vb = vb.with_crls(load_crls(crl_path)?);
                }
                if mode != 1 {
                    vb = vb.allow_unauthenticated();
                }
                let verifier = vb
                    .build()
                    .map_err(|e| ProxyError::Tls(format!("client verifier: {e}")))?;
                builder.with_client_cert_verifier(verifier)
            }
        };

        let mut config = builder.with_cert_resolver(Arc::new(SniResolver { certs }));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(TlsServer { acceptor: TlsAcceptor::from(Arc::new(config)) })
    }
}

fn filtered_provider(ciphers: Option<&str>) -> Result<CryptoProvider> {
    let mut provider = tokio_rustls::rustls::crypto::ring::default_provider();
    if let Some(spec) = ciphers {
        let wanted: Vec<String> = spec
            .split([':', ','])
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !wanted.is_empty() {
            provider
                .cipher_suites
                .retain(|cs| wanted.iter().any(|w| format!("{:?}", cs.suite()).ends_with(w)));
            if provider.cipher_suites.is_empty() {
                return Err(ProxyError::Tls(format!("no usable ciphers in {spec:?}")));
            }
        }
    }
    Ok(provider)
}

/// Backend connections do not verify the server certificate; upstream
/// servers habitually run self-signed material and the trust decision was
/// made in the configuration.
#[derive(Debug)]
struct NoCertVerification;

impl ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        tokio_rustls::rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Connector for HTTPS backends.
pub fn build_backend_connector() -> TlsConnector {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertVerification))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}
