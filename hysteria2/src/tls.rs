//! TLS 客户端配置构建

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};

use common::{Error, Result};

use crate::config::{TlsConfig, VerifyPeerCertificate};

/// HTTP/3 的 ALPN 标识
pub const ALPN_H3: &[u8] = b"h3";

/// 按配置构建 rustls 客户端配置（仅 TLS 1.3，ALPN 为 `h3`）
pub fn build_client_config(tls: &TlsConfig) -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let chain = if tls.insecure_skip_verify {
        None
    } else {
        let roots = root_store(&tls.root_cas)?;
        let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(Error::connect)?;
        Some(verifier)
    };

    let verifier = PeerVerifier {
        chain,
        callback: tls.verify_peer_certificate.clone(),
        algorithms: provider.signature_verification_algorithms,
    };

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(Error::connect)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_H3.to_vec()];
    Ok(config)
}

fn root_store(root_cas: &[CertificateDer<'static>]) -> Result<RootCertStore> {
    if root_cas.is_empty() {
        return Ok(RootCertStore::from_iter(
            webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
        ));
    }
    let mut roots = RootCertStore::empty();
    for cert in root_cas {
        roots.add(cert.clone()).map_err(Error::connect)?;
    }
    Ok(roots)
}

/// 服务器证书校验器
///
/// `chain` 为空时跳过证书链校验（`insecure_skip_verify`），握手签名仍然校验。
/// 配置了回调时，在证书链校验通过后再交给回调判定。
#[derive(Clone)]
struct PeerVerifier {
    chain: Option<Arc<WebPkiServerVerifier>>,
    callback: Option<VerifyPeerCertificate>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl std::fmt::Debug for PeerVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerVerifier")
            .field("verify_chain", &self.chain.is_some())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl ServerCertVerifier for PeerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if let Some(chain) = &self.chain {
            chain.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;
        }
        if let Some(callback) = &self.callback {
            let mut certs = Vec::with_capacity(intermediates.len() + 1);
            certs.push(end_entity.clone());
            certs.extend(intermediates.iter().cloned());
            callback(&certs).map_err(rustls::Error::General)?;
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
