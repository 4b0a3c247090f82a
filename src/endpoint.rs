//! TLS Endpoint Construction
//!
//! Transport glue at the edge of the core: load PEM material, build the
//! mutually-authenticated TLS configurations, and run the accept/connect
//! loops that hand finished streams to the protocol. What the certificates
//! mean (identity, issuance, rotation) is the deployment's business, not
//! this crate's.

use crate::agent::AgentService;
use crate::config::ProtocolConfig;
use crate::control::ControlService;
use crate::error::{VolmeshError, VolmeshResult};
use crate::protocol::Connection;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, warn};

/// Load all certificates from a PEM file.
pub fn load_certs(path: &Path) -> VolmeshResult<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)?;
    let mut reader = std::io::BufReader::new(&pem[..]);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| VolmeshError::Tls(format!("failed to parse {path:?}: {error}")))
}

/// Load the first private key from a PEM file.
pub fn load_private_key(path: &Path) -> VolmeshResult<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)?;
    let mut reader = std::io::BufReader::new(&pem[..]);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|error| VolmeshError::Tls(format!("failed to parse {path:?}: {error}")))?
        .ok_or_else(|| VolmeshError::Tls(format!("no private key in {path:?}")))
}

fn root_store(ca_certs: Vec<CertificateDer<'static>>) -> VolmeshResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots
            .add(cert)
            .map_err(|error| VolmeshError::Tls(format!("bad CA certificate: {error}")))?;
    }
    Ok(roots)
}

/// TLS configuration for the control service: server-authenticated to
/// agents, requiring client certificates signed by the cluster CA.
pub fn control_tls_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    ca_certs: Vec<CertificateDer<'static>>,
) -> VolmeshResult<Arc<ServerConfig>> {
    let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(ca_certs)?))
        .build()
        .map_err(|error| VolmeshError::Tls(format!("client verifier: {error}")))?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|error| VolmeshError::Tls(format!("server config: {error}")))?;
    Ok(Arc::new(config))
}

/// TLS configuration for an agent: trusts the cluster CA and presents its
/// own node certificate.
pub fn agent_tls_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    ca_certs: Vec<CertificateDer<'static>>,
) -> VolmeshResult<Arc<ClientConfig>> {
    let config = ClientConfig::builder()
        .with_root_certificates(root_store(ca_certs)?)
        .with_client_auth_cert(certs, key)
        .map_err(|error| VolmeshError::Tls(format!("client config: {error}")))?;
    Ok(Arc::new(config))
}

/// Accept agent connections forever, handing each finished TLS stream to
/// the control service.
pub async fn serve_control(
    service: ControlService,
    listener: TcpListener,
    tls: Arc<ServerConfig>,
) -> VolmeshResult<()> {
    let acceptor = TlsAcceptor::from(tls);
    loop {
        let (stream, peer) = listener.accept().await?;
        if service.is_stopped() {
            return Ok(());
        }
        let acceptor = acceptor.clone();
        let service = service.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(stream) => {
                    info!(%peer, "agent transport established");
                    service.register_transport(stream);
                }
                Err(error) => {
                    warn!(%peer, %error, "TLS handshake failed");
                }
            }
        });
    }
}

/// Connect an agent to the control service over TLS and start the protocol.
pub async fn connect_agent(
    agent: &AgentService,
    address: &str,
    server_name: &str,
    tls: Arc<ClientConfig>,
    config: ProtocolConfig,
) -> VolmeshResult<Connection> {
    let connector = TlsConnector::from(tls);
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|error| VolmeshError::Tls(format!("bad server name: {error}")))?;
    let stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|error| VolmeshError::Tls(format!("TLS handshake failed: {error}")))?;
    Ok(agent.spawn_on(stream, config).await)
}
