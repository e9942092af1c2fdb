//! TLS transport
//!
//! SIP over TLS on top of the shared stream framing. The server side needs
//! a PEM certificate chain and key; the client side verifies against the
//! platform trust anchors unless `insecure_skip_verify` is set (lab and
//! test deployments with self-signed certificates).

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::error::{Result, SipError};
use super::tcp::{adopt_stream, ConnTable};
use super::{Incoming, TransportKind};

/// Certificates and verification policy for the TLS transport
#[derive(Clone, Default)]
pub struct TlsConfig {
    /// PEM certificate chain presented by the listener
    pub cert_pem: Vec<u8>,
    /// PEM private key for the listener certificate
    pub key_pem: Vec<u8>,
    /// Skip server certificate verification on outbound connections.
    /// Never enable outside test and lab setups.
    pub insecure_skip_verify: bool,
}

/// A bound TLS listener plus its connection table
pub struct TlsTransport {
    local: SocketAddr,
    conns: ConnTable,
    inbound: mpsc::Sender<Incoming>,
    connector: TlsConnector,
}

impl TlsTransport {
    pub async fn bind(
        addr: SocketAddr,
        config: TlsConfig,
        inbound: mpsc::Sender<Incoming>,
    ) -> Result<Arc<Self>> {
        let acceptor = TlsAcceptor::from(Arc::new(server_config(&config)?));
        let connector = TlsConnector::from(Arc::new(client_config(&config)?));

        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        debug!(%local, "SIP TLS transport bound");

        let transport = Arc::new(TlsTransport {
            local,
            conns: Arc::new(Mutex::new(std::collections::HashMap::new())),
            inbound,
            connector,
        });

        let accept_self = transport.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "TLS accept loop ended");
                        return;
                    }
                };
                let acceptor = acceptor.clone();
                let conns = accept_self.conns.clone();
                let inbound = accept_self.inbound.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls) => {
                            adopt_stream(tls, peer, TransportKind::Tls, conns, inbound)
                        }
                        Err(e) => warn!(%peer, error = %e, "TLS handshake failed"),
                    }
                });
            }
        });

        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub async fn send(self: &Arc<Self>, dest: SocketAddr, data: &[u8]) -> Result<()> {
        let sender = self.conns.lock().get(&dest).cloned();
        let sender = match sender {
            Some(s) => s,
            None => {
                let tcp = TcpStream::connect(dest).await?;
                let name = ServerName::try_from(dest.ip().to_string())
                    .map_err(|_| SipError::Parse(format!("bad TLS server name {}", dest)))?;
                let tls = self
                    .connector
                    .connect(name, tcp)
                    .await
                    .map_err(SipError::Transport)?;
                adopt_stream(
                    tls,
                    dest,
                    TransportKind::Tls,
                    self.conns.clone(),
                    self.inbound.clone(),
                );
                self.conns.lock().get(&dest).cloned().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection died on open")
                })?
            }
        };
        sender
            .send(data.to_vec())
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection closed"))?;
        Ok(())
    }
}

fn server_config(config: &TlsConfig) -> Result<rustls::ServerConfig> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut &config.cert_pem[..])
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| SipError::Parse(format!("bad TLS certificate PEM: {}", e)))?;
    let key = rustls_pemfile::private_key(&mut &config.key_pem[..])
        .map_err(|e| SipError::Parse(format!("bad TLS key PEM: {}", e)))?
        .ok_or_else(|| SipError::Parse("no private key in TLS key PEM".into()))?;
    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| SipError::Parse(format!("TLS server config rejected: {}", e)))
}

fn client_config(config: &TlsConfig) -> Result<rustls::ClientConfig> {
    if config.insecure_skip_verify {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        return Ok(rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify(provider)))
            .with_no_client_auth());
    }
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Accept-anything verifier backing `insecure_skip_verify`
#[derive(Debug)]
struct NoVerify(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for NoVerify {
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
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}
