// Copyright 2026 the hubwire authors
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

//! TLS transport support.
//!
//! `TlsSession` is the record-layer surface the connection state machine
//! drives; `RustlsSession` implements it over rustls. `TlsContext` holds the
//! certificate material and mints sessions, so handshake initiation never
//! reaches into process-wide state.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::mem;
use std::path::Path;
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use tracing::debug;

use crate::service::TlsConfig;
use crate::{AppError, AppResult};

/// Which side of the handshake a session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Server,
    Client,
}

/// Whether a handshake completed or still needs socket readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsProgress {
    Established,
    InProgress,
}

/// Retry/failure classification for a TLS primitive.
///
/// The `Want*` variants are transient and name what the session is missing;
/// the connection turns them into registration and intent-flag changes.
/// `CleanShutdown` is the peer's orderly close. `Syscall` and `Fatal` end
/// the session. `WantConnect`, `WantAccept` and `WantX509Lookup` are never
/// produced by the rustls backend but belong to the vocabulary for session
/// implementations that drive their own transport setup or defer
/// certificate lookups.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("tls session closed cleanly")]
    CleanShutdown,

    #[error("tls operation needs the socket readable")]
    WantRead,

    #[error("tls operation needs the socket writable")]
    WantWrite,

    #[error("tls operation needs connect completion")]
    WantConnect,

    #[error("tls operation needs accept completion")]
    WantAccept,

    #[error("tls operation awaits a certificate lookup")]
    WantX509Lookup,

    #[error("tls syscall error: {0}")]
    Syscall(#[from] io::Error),

    #[error("tls failure: {0}")]
    Fatal(String),
}

/// Record-layer primitives driven by the connection state machine.
///
/// Implementations own the cryptographic session; the socket is passed in on
/// every call because the connection owns it as part of the transport.
pub trait TlsSession {
    /// Drives the server side of the handshake.
    fn accept(&mut self, sock: &mut TcpStream) -> Result<(), TlsError>;

    /// Drives the client side of the handshake.
    fn connect(&mut self, sock: &mut TcpStream) -> Result<(), TlsError>;

    /// Reads decrypted plaintext into `buf`.
    fn read(&mut self, sock: &mut TcpStream, buf: &mut [u8]) -> Result<usize, TlsError>;

    /// Writes plaintext. `Ok(n)` means `n` bytes were accepted *and* their
    /// records fully flushed; a transient failure keeps the accepted bytes
    /// inside the session so the retry does not re-submit them.
    fn write(&mut self, sock: &mut TcpStream, buf: &[u8]) -> Result<usize, TlsError>;

    /// Queues the close_notify alert and makes a best-effort flush.
    fn send_close_notify(&mut self, _sock: &mut TcpStream) {}
}

/// `TlsSession` over a rustls client or server connection.
pub struct RustlsSession {
    conn: rustls::Connection,
    // plaintext accepted by the session buffer but not yet reported to the
    // caller; reported only once its records are fully flushed
    committed: usize,
}

impl RustlsSession {
    fn new(conn: rustls::Connection) -> RustlsSession {
        RustlsSession { conn, committed: 0 }
    }

    /// Flushes queued records to the socket.
    fn flush_records(&mut self, sock: &mut TcpStream) -> Result<(), TlsError> {
        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Err(TlsError::WantWrite);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(TlsError::Syscall(err)),
            }
        }
        Ok(())
    }

    /// Pulls one batch of records off the socket into the session.
    /// `Ok(true)` means the socket reported end of stream.
    fn pump_records(&mut self, sock: &mut TcpStream) -> Result<bool, TlsError> {
        loop {
            return match self.conn.read_tls(sock) {
                Ok(0) => Ok(true),
                Ok(_) => match self.conn.process_new_packets() {
                    Ok(_) => Ok(false),
                    Err(err) => {
                        // rustls has queued a fatal alert; push it out if the
                        // socket allows
                        let _ = self.conn.write_tls(sock);
                        Err(TlsError::Fatal(err.to_string()))
                    }
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => Err(TlsError::WantRead),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => Err(TlsError::Syscall(err)),
            };
        }
    }

    fn drive_handshake(&mut self, sock: &mut TcpStream) -> Result<(), TlsError> {
        loop {
            self.flush_records(sock)?;
            if !self.conn.is_handshaking() {
                return Ok(());
            }
            if self.pump_records(sock)? {
                return Err(TlsError::Syscall(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed during tls handshake",
                )));
            }
        }
    }
}

impl TlsSession for RustlsSession {
    fn accept(&mut self, sock: &mut TcpStream) -> Result<(), TlsError> {
        self.drive_handshake(sock)
    }

    fn connect(&mut self, sock: &mut TcpStream) -> Result<(), TlsError> {
        self.drive_handshake(sock)
    }

    fn read(&mut self, sock: &mut TcpStream, buf: &mut [u8]) -> Result<usize, TlsError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.conn.is_handshaking() {
            self.drive_handshake(sock)?;
        }
        let mut saw_eof = false;
        loop {
            match self.conn.reader().read(buf) {
                // close_notify received and all plaintext drained
                Ok(0) => return Err(TlsError::CleanShutdown),
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(TlsError::Syscall(err));
                }
                Err(err) => return Err(TlsError::Fatal(err.to_string())),
            }
            if saw_eof {
                return Err(TlsError::Syscall(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed without close_notify",
                )));
            }
            saw_eof = self.pump_records(sock)?;
        }
    }

    fn write(&mut self, sock: &mut TcpStream, buf: &[u8]) -> Result<usize, TlsError> {
        if self.conn.is_handshaking() {
            self.drive_handshake(sock)?;
        }
        if self.committed == 0 && !buf.is_empty() {
            let n = self
                .conn
                .writer()
                .write(buf)
                .map_err(|err| TlsError::Fatal(err.to_string()))?;
            self.committed = n;
        }
        self.flush_records(sock)?;
        Ok(mem::take(&mut self.committed))
    }

    fn send_close_notify(&mut self, sock: &mut TcpStream) {
        self.conn.send_close_notify();
        while self.conn.wants_write() {
            if self.conn.write_tls(sock).is_err() {
                break;
            }
        }
    }
}

/// Certificate material and role for minting TLS sessions.
///
/// Injected explicitly into `Connection::start_tls`; there is no
/// process-wide TLS state.
pub enum TlsContext {
    Server(Arc<ServerConfig>),
    Client {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    },
}

impl TlsContext {
    /// Server context from PEM certificate chain and private key files.
    pub fn server_from_pem(
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
    ) -> AppResult<TlsContext> {
        let certs = load_certs(cert_file.as_ref())?;
        let key = load_private_key(key_file.as_ref())?;
        debug!(
            "loaded {} certificate(s) from {}",
            certs.len(),
            cert_file.as_ref().display()
        );
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|err| AppError::TlsFailure(err.to_string()))?;
        Ok(TlsContext::Server(Arc::new(config)))
    }

    /// Client context trusting the given PEM CA bundle and verifying the
    /// peer against `server_name`.
    pub fn client_from_pem(
        ca_file: impl AsRef<Path>,
        server_name: &str,
    ) -> AppResult<TlsContext> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_file.as_ref())? {
            roots
                .add(cert)
                .map_err(|err| AppError::TlsFailure(err.to_string()))?;
        }
        debug!(
            "loaded {} trust anchor(s) from {}",
            roots.len(),
            ca_file.as_ref().display()
        );
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| AppError::InvalidValue(format!("server name: {}", server_name)))?;
        Ok(TlsContext::Client {
            config: Arc::new(config),
            server_name,
        })
    }

    /// Builds the context described by the `[tls]` configuration section:
    /// cert/key paths make a server context, a CA bundle plus server name
    /// make a client context.
    pub fn from_config(tls: &TlsConfig) -> AppResult<TlsContext> {
        if !tls.cert_file.is_empty() || !tls.key_file.is_empty() {
            if tls.cert_file.is_empty() || tls.key_file.is_empty() {
                return Err(AppError::InvalidValue(
                    "tls server config needs both cert_file and key_file".to_string(),
                ));
            }
            return TlsContext::server_from_pem(&tls.cert_file, &tls.key_file);
        }
        match (&tls.ca_file, &tls.server_name) {
            (Some(ca_file), Some(server_name)) => TlsContext::client_from_pem(ca_file, server_name),
            _ => Err(AppError::InvalidValue(
                "tls client config needs ca_file and server_name".to_string(),
            )),
        }
    }

    pub fn role(&self) -> TlsRole {
        match self {
            TlsContext::Server(_) => TlsRole::Server,
            TlsContext::Client { .. } => TlsRole::Client,
        }
    }

    /// Mints a fresh session for one connection.
    pub fn new_session(&self) -> AppResult<RustlsSession> {
        let conn = match self {
            TlsContext::Server(config) => rustls::Connection::from(
                ServerConnection::new(config.clone())
                    .map_err(|err| AppError::TlsFailure(err.to_string()))?,
            ),
            TlsContext::Client {
                config,
                server_name,
            } => rustls::Connection::from(
                ClientConnection::new(config.clone(), server_name.clone())
                    .map_err(|err| AppError::TlsFailure(err.to_string()))?,
            ),
        };
        Ok(RustlsSession::new(conn))
    }
}

fn load_certs(path: &Path) -> AppResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|err| {
        AppError::InvalidValue(format!("certificate file {}: {}", path.display(), err))
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(AppError::InvalidValue(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> AppResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|err| {
        AppError::InvalidValue(format!("private key file {}: {}", path.display(), err))
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        AppError::InvalidValue(format!("no private key found in {}", path.display()))
    })
}
