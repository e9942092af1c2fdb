//! Endpoint configuration

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use voxide_media_core::{Codec, PCMA, PCMU, TELEPHONE_EVENT};
use voxide_sip_core::auth::DigestCredentials;
use voxide_sip_core::{TlsConfig, TransportKind};

/// One SIP listener to bind
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub bind: SocketAddr,
}

impl TransportConfig {
    pub fn udp(bind: SocketAddr) -> Self {
        TransportConfig {
            kind: TransportKind::Udp,
            bind,
        }
    }

    pub fn tcp(bind: SocketAddr) -> Self {
        TransportConfig {
            kind: TransportKind::Tcp,
            bind,
        }
    }

    /// Requires `EndpointConfig::tls` to be set
    pub fn tls(bind: SocketAddr) -> Self {
        TransportConfig {
            kind: TransportKind::Tls,
            bind,
        }
    }
}

/// Endpoint-wide configuration
#[derive(Clone)]
pub struct EndpointConfig {
    /// User part of the endpoint's identity and Contact
    pub user: String,
    /// Listeners to bind; at least one is required
    pub transports: Vec<TransportConfig>,
    /// Certificates for the TLS transport, when one is configured
    pub tls: Option<TlsConfig>,
    /// Address RTP sessions bind on
    pub media_ip: IpAddr,
    /// Address advertised in SDP instead of the bind address, when set
    pub external_media_ip: Option<IpAddr>,
    /// Host advertised in Contact instead of the bound address, when set
    pub external_sip_host: Option<String>,
    /// Port advertised in Contact together with `external_sip_host`
    pub external_sip_port: Option<u16>,
    /// Codec preference for offers and answers
    pub codecs: Vec<Codec>,
    /// Credentials for answering digest challenges (REGISTER, INVITE)
    pub credentials: Option<DigestCredentials>,
    /// How long an answer waits for its ACK
    pub ack_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            user: "voxide".to_string(),
            transports: vec![TransportConfig::udp("0.0.0.0:5060".parse().unwrap())],
            tls: None,
            media_ip: "0.0.0.0".parse().unwrap(),
            external_media_ip: None,
            external_sip_host: None,
            external_sip_port: None,
            codecs: vec![PCMU, PCMA, TELEPHONE_EVENT],
            credentials: None,
            ack_timeout: Duration::from_secs(10),
        }
    }
}

/// The media knobs a session needs, shared by the endpoint
#[derive(Debug, Clone)]
pub struct MediaEnv {
    pub media_ip: IpAddr,
    pub external_media_ip: Option<IpAddr>,
    pub codecs: Vec<Codec>,
    pub ack_timeout: Duration,
}

impl From<&EndpointConfig> for MediaEnv {
    fn from(config: &EndpointConfig) -> Self {
        MediaEnv {
            media_ip: config.media_ip,
            external_media_ip: config.external_media_ip,
            codecs: config.codecs.clone(),
            ack_timeout: config.ack_timeout,
        }
    }
}
