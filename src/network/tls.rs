// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Certificate material for the secure-session layer.
//!
//! The server presents a certificate chain and never asks the peer for one.
//! The client verifies the server against a trust store built from a CA
//! certificate. Both sides accept TLS 1.2 and 1.3.

use std::fmt;
use std::io::{BufReader, Cursor};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::{AppError, AppResult};

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn load_certs(pem: &[u8]) -> AppResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(Cursor::new(pem));
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::InvalidValue(format!("parse certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(AppError::InvalidValue("no certificate found".into()));
    }
    Ok(certs)
}

fn load_private_key(pem: &[u8]) -> AppResult<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(Cursor::new(pem));
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| AppError::InvalidValue(format!("parse private key: {}", e)))?
        .ok_or_else(|| AppError::InvalidValue("no private key found".into()))
}

fn read_file(path: &Path) -> AppResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        AppError::DetailedIoError(format!("read {}: {}", path.to_string_lossy(), e))
    })
}

/// Certificate chain and private key the server presents during the handshake.
#[derive(Clone)]
pub struct ServerCredential {
    acceptor: TlsAcceptor,
}

impl ServerCredential {
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> AppResult<Self> {
        let certs = load_certs(cert_pem)?;
        let key = load_private_key(key_pem)?;
        let config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(ServerCredential {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> AppResult<Self> {
        Self::from_pem(&read_file(cert_path)?, &read_file(key_path)?)
    }

    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }
}

impl fmt::Debug for ServerCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCredential").finish_non_exhaustive()
    }
}

/// Trust store and expected name the client verifies the server against.
#[derive(Clone)]
pub struct ClientTrust {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl ClientTrust {
    pub fn from_pem(ca_pem: &[u8], server_name: &str) -> AppResult<Self> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_pem)? {
            roots.add(cert)?;
        }
        let config = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(server_name)
            .map_err(|_| AppError::InvalidValue(format!("invalid tls server name {:?}", server_name)))?
            .to_owned();
        Ok(ClientTrust {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    pub fn from_pem_file(ca_path: &Path, server_name: &str) -> AppResult<Self> {
        Self::from_pem(&read_file(ca_path)?, server_name)
    }

    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    pub fn server_name(&self) -> ServerName<'static> {
        self.server_name.clone()
    }
}

impl fmt::Debug for ClientTrust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTrust")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}
