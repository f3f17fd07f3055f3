use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;
use std::sync::Arc;

use crate::TunnelError;

/// ALPN protocol pinned on both ends of the control connection.
const ALPN_H2: &[u8] = b"h2";

fn load_certs(reader: &mut dyn Read) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    let mut reader = BufReader::new(reader);
    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Certificate(format!("failed to parse certificates: {e}")))
}

fn load_key(reader: &mut dyn Read) -> Result<PrivateKeyDer<'static>, TunnelError> {
    let mut reader = BufReader::new(reader);
    private_key(&mut reader)
        .map_err(|e| TunnelError::Certificate(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| TunnelError::Certificate("no private key found".to_string()))
}

fn root_store(ca_certs: Vec<CertificateDer<'static>>) -> Result<RootCertStore, TunnelError> {
    let mut store = RootCertStore::empty();
    for cert in ca_certs {
        store
            .add(cert)
            .map_err(|e| TunnelError::Certificate(format!("failed to add CA certificate: {e}")))?;
    }
    Ok(store)
}

fn open(path: &Path) -> Result<File, TunnelError> {
    File::open(path)
        .map_err(|e| TunnelError::Certificate(format!("failed to open {}: {e}", path.display())))
}

fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    ca_certs: Vec<CertificateDer<'static>>,
) -> Result<ServerConfig, TunnelError> {
    let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(ca_certs)?))
        .build()
        .map_err(|e| TunnelError::Tls(format!("failed to build client verifier: {e}")))?;

    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| TunnelError::Tls(format!("failed to build server config: {e}")))?;
    config.alpn_protocols = vec![ALPN_H2.to_vec()];

    Ok(config)
}

fn client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    ca_certs: Vec<CertificateDer<'static>>,
) -> Result<ClientConfig, TunnelError> {
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store(ca_certs)?)
        .with_client_auth_cert(certs, key)
        .map_err(|e| TunnelError::Tls(format!("failed to build client config: {e}")))?;
    config.alpn_protocols = vec![ALPN_H2.to_vec()];

    Ok(config)
}

/// Loads the control-plane server TLS config: server certificate plus
/// mandatory client certificate verification against `ca_path`.
pub fn load_server_config(
    cert_path: &Path,
    key_path: &Path,
    ca_path: &Path,
) -> Result<ServerConfig, TunnelError> {
    server_config(
        load_certs(&mut open(cert_path)?)?,
        load_key(&mut open(key_path)?)?,
        load_certs(&mut open(ca_path)?)?,
    )
}

/// Same as [`load_server_config`] but from in-memory PEM strings.
pub fn load_server_config_from_pem(
    cert_pem: &str,
    key_pem: &str,
    ca_pem: &str,
) -> Result<ServerConfig, TunnelError> {
    server_config(
        load_certs(&mut Cursor::new(cert_pem.as_bytes()))?,
        load_key(&mut Cursor::new(key_pem.as_bytes()))?,
        load_certs(&mut Cursor::new(ca_pem.as_bytes()))?,
    )
}

/// Server TLS without client authentication, for the public HTTPS plane.
pub fn load_server_config_no_client_auth(
    cert_pem: &str,
    key_pem: &str,
) -> Result<ServerConfig, TunnelError> {
    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            load_certs(&mut Cursor::new(cert_pem.as_bytes()))?,
            load_key(&mut Cursor::new(key_pem.as_bytes()))?,
        )
        .map_err(|e| TunnelError::Tls(format!("failed to build server config: {e}")))
}

/// Loads the tunnel-client TLS config: client certificate for mTLS plus the
/// CA used to verify the server.
pub fn load_client_config(
    cert_path: &Path,
    key_path: &Path,
    ca_path: &Path,
) -> Result<ClientConfig, TunnelError> {
    client_config(
        load_certs(&mut open(cert_path)?)?,
        load_key(&mut open(key_path)?)?,
        load_certs(&mut open(ca_path)?)?,
    )
}

/// Same as [`load_client_config`] but from in-memory PEM strings.
pub fn load_client_config_from_pem(
    cert_pem: &str,
    key_pem: &str,
    ca_pem: &str,
) -> Result<ClientConfig, TunnelError> {
    client_config(
        load_certs(&mut Cursor::new(cert_pem.as_bytes()))?,
        load_key(&mut Cursor::new(key_pem.as_bytes()))?,
        load_certs(&mut Cursor::new(ca_pem.as_bytes()))?,
    )
}
