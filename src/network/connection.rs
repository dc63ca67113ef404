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

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::tls::{ClientTrust, ServerCredential};
use super::transport::{close_socket, close_step, Transport};
use super::{FrameCodec, Message};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// transport attached, nothing exchanged yet
    Accepted,
    Handshaking,
    Serving,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Accepted => "accepted",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Serving => "serving",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One transport link and, optionally, the secure session wrapped around it.
///
/// The read and write halves are locked independently, so one task can sit in
/// `receive_message` while another sends. Sends are serialized by the write
/// lock. Every in-flight operation also watches the close token, which lets
/// `dispose` called from any task reclaim both halves promptly.
///
/// Lock order is `pending`, then `reader`, then `writer`.
pub struct Connection {
    id: String,
    peer_addr: Option<SocketAddr>,
    codec: FrameCodec,
    encrypted: bool,
    // raw socket of an encrypted connection whose handshake has not run yet
    pending: Mutex<Option<TcpStream>>,
    reader: Mutex<Option<BufReader<ReadHalf<Transport>>>>,
    writer: Mutex<Option<BufWriter<WriteHalf<Transport>>>>,
    last_active: parking_lot::Mutex<Instant>,
    state: parking_lot::Mutex<ConnectionState>,
    closed: AtomicBool,
    close_token: CancellationToken,
}

impl Connection {
    /// Wraps an established socket. With `encrypted` set, framed I/O stays
    /// unavailable until one of the `authenticate_as_*` calls succeeds.
    pub fn new(id: String, socket: TcpStream, encrypted: bool, codec: FrameCodec) -> Connection {
        let peer_addr = socket.peer_addr().ok();
        let (pending, reader, writer) = if encrypted {
            (Some(socket), None, None)
        } else {
            let (reader, writer) = split(Transport::Plain(socket));
            (None, Some(reader), Some(writer))
        };
        Connection {
            id,
            peer_addr,
            codec,
            encrypted,
            pending: Mutex::new(pending),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            last_active: parking_lot::Mutex::new(Instant::now()),
            state: parking_lot::Mutex::new(ConnectionState::Accepted),
            closed: AtomicBool::new(false),
            close_token: CancellationToken::new(),
        }
    }

    /// Remote endpoint as text, or a fresh unique token when the socket
    /// cannot report one.
    pub fn derive_id(socket: &TcpStream) -> String {
        socket
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| Uuid::new_v4().to_string())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        // nothing leaves the closing path
        if matches!(*current, ConnectionState::Closing | ConnectionState::Closed)
            && !matches!(state, ConnectionState::Closed)
        {
            return;
        }
        trace!("connection {} state {} -> {}", self.id, *current, state);
        *current = state;
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active())
    }

    /// Marks activity without exchanging a frame. Never moves backwards.
    pub fn update_last_active(&self) {
        let now = Instant::now();
        let mut last_active = self.last_active.lock();
        if now > *last_active {
            *last_active = now;
        }
    }

    /// Runs the server side of the TLS handshake.
    ///
    /// No peer certificate is requested. A connection without encryption, or
    /// one that already finished its handshake, is left untouched.
    pub async fn authenticate_as_server(&self, credential: &ServerCredential) -> AppResult<()> {
        let mut pending = self.pending.lock().await;
        let Some(socket) = pending.take() else {
            debug!(
                "connection {} has no pending secure session, skip handshake",
                self.id
            );
            return Ok(());
        };
        self.set_state(ConnectionState::Handshaking);
        let tls = tokio::select! {
            res = credential.acceptor().accept(socket) => {
                res.map_err(|e| AppError::HandshakeFailure(format!("{}: {}", self.id, e)))?
            }
            _ = self.close_token.cancelled() => {
                return Err(AppError::ConnectionClosed(self.id.clone()));
            }
        };
        self.install(Transport::ServerTls(Box::new(tls))).await;
        debug!("connection {} secure session established", self.id);
        Ok(())
    }

    /// Runs the client side of the TLS handshake, verifying the server
    /// against `trust`.
    pub async fn authenticate_as_client(&self, trust: &ClientTrust) -> AppResult<()> {
        let mut pending = self.pending.lock().await;
        let Some(socket) = pending.take() else {
            debug!(
                "connection {} has no pending secure session, skip handshake",
                self.id
            );
            return Ok(());
        };
        self.set_state(ConnectionState::Handshaking);
        let tls = tokio::select! {
            res = trust.connector().connect(trust.server_name(), socket) => {
                res.map_err(|e| AppError::HandshakeFailure(format!("{}: {}", self.id, e)))?
            }
            _ = self.close_token.cancelled() => {
                return Err(AppError::ConnectionClosed(self.id.clone()));
            }
        };
        self.install(Transport::ClientTls(Box::new(tls))).await;
        debug!("connection {} secure session established", self.id);
        Ok(())
    }

    async fn install(&self, transport: Transport) {
        let (reader, writer) = split(transport);
        let mut reader_slot = self.reader.lock().await;
        let mut writer_slot = self.writer.lock().await;
        *reader_slot = Some(reader);
        *writer_slot = Some(writer);
    }

    /// Sends one frame and flushes it. `last_active` moves only after the
    /// whole frame is flushed.
    pub async fn send_message(&self, message: &Message) -> AppResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.not_connected())?;
        tokio::select! {
            res = self.codec.write_frame(writer, message.as_payload()) => res?,
            _ = self.close_token.cancelled() => {
                return Err(AppError::ConnectionClosed(self.id.clone()));
            }
        }
        self.update_last_active();
        trace!("connection {} sent {:?}", self.id, message);
        Ok(())
    }

    pub async fn send_text(&self, text: &str) -> AppResult<()> {
        self.send_message(&Message::from(text)).await
    }

    /// Receives one frame.
    ///
    /// `Ok(None)` means the peer closed the stream between frames.
    pub async fn receive_message(&self) -> AppResult<Option<Message>> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or_else(|| self.not_connected())?;
        let payload = tokio::select! {
            res = self.codec.read_frame(reader) => res?,
            _ = self.close_token.cancelled() => {
                return Err(AppError::ConnectionClosed(self.id.clone()));
            }
        };
        let Some(payload) = payload else {
            return Ok(None);
        };
        self.update_last_active();
        Ok(Some(Message::from_payload(payload)))
    }

    /// Resolves once `dispose` has started on this connection.
    pub async fn closed(&self) {
        self.close_token.cancelled().await
    }

    /// Tears the connection down exactly once; later calls return immediately.
    ///
    /// Order: secure session, stream wrapper, socket shutdown for both
    /// directions, socket release. A failing step never stops the rest and
    /// nothing is reported to the caller.
    pub async fn dispose(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ConnectionState::Closing);
        // wake whoever holds a half so the locks below are released
        self.close_token.cancel();

        let pending = self.pending.lock().await.take();
        let reader = self.reader.lock().await.take();
        let writer = self.writer.lock().await.take();

        if let Some(socket) = pending {
            close_socket(&self.id, socket).await;
        }
        match (reader, writer) {
            (Some(reader), Some(mut writer)) => {
                close_step(&self.id, "flush stream", writer.flush()).await;
                let transport = reader.into_inner().unsplit(writer.into_inner());
                transport.close(&self.id).await;
            }
            (None, None) => {}
            _ => warn!("connection {} lost one half of its transport", self.id),
        }
        self.set_state(ConnectionState::Closed);
        debug!("connection {} disposed", self.id);
    }

    fn not_connected(&self) -> AppError {
        AppError::NotConnected(format!(
            "connection {} has no usable transport ({})",
            self.id,
            self.state()
        ))
    }
}

fn split(
    transport: Transport,
) -> (
    BufReader<ReadHalf<Transport>>,
    BufWriter<WriteHalf<Transport>>,
) {
    let (reader, writer) = tokio::io::split(transport);
    (BufReader::new(reader), BufWriter::new(writer))
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("encrypted", &self.encrypted)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace!("connection {} dropped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    async fn plain_pair() -> (Connection, Connection) {
        let (a, b) = tcp_pair().await;
        (
            Connection::new("a".into(), a, false, FrameCodec::default()),
            Connection::new("b".into(), b, false, FrameCodec::default()),
        )
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (a, b) = plain_pair().await;
        let before = b.last_active();

        a.send_text("hello").await.unwrap();
        a.send_message(&Message::Heartbeat).await.unwrap();
        a.send_text("").await.unwrap();

        assert_eq!(
            b.receive_message().await.unwrap(),
            Some(Message::Data("hello".into()))
        );
        assert_eq!(b.receive_message().await.unwrap(), Some(Message::Heartbeat));
        assert_eq!(
            b.receive_message().await.unwrap(),
            Some(Message::Data(String::new()))
        );
        assert!(b.last_active() >= before);
    }

    #[tokio::test]
    async fn test_last_active_is_monotonic() {
        let (a, _b) = plain_pair().await;
        let mut previous = a.last_active();
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            a.update_last_active();
            let current = a.last_active();
            assert!(current >= previous);
            previous = current;
        }
    }

    #[tokio::test]
    async fn test_end_of_stream_before_frame() {
        let (a, b) = tcp_pair().await;
        let conn = Connection::new("b".into(), b, false, FrameCodec::default());
        drop(a);
        assert_eq!(conn.receive_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reset_mid_frame() {
        let (mut a, b) = tcp_pair().await;
        let conn = Connection::new("b".into(), b, false, FrameCodec::default());
        a.write_all(&10i32.to_le_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        a.flush().await.unwrap();
        drop(a);
        assert!(matches!(
            conn.receive_message().await,
            Err(AppError::ConnectionReset(_))
        ));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (a, mut b) = tcp_pair().await;
        let conn = Arc::new(Connection::new("a".into(), a, false, FrameCodec::default()));

        let (c1, c2) = (conn.clone(), conn.clone());
        tokio::join!(c1.dispose(), c2.dispose());
        conn.dispose().await;

        assert!(conn.is_closed());
        assert_eq!(conn.state(), ConnectionState::Closed);
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
        assert!(matches!(
            conn.send_text("late").await,
            Err(AppError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_dispose_interrupts_pending_receive() {
        let (a, _b) = plain_pair().await;
        let a = Arc::new(a);

        let receiver = {
            let a = a.clone();
            tokio::spawn(async move { a.receive_message().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(2), a.dispose())
            .await
            .expect("dispose must not wait for the peer");
        let result = receiver.await.unwrap();
        assert!(matches!(result, Err(AppError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_encrypted_connection_requires_handshake() {
        let (a, b) = tcp_pair().await;
        let encrypted = Connection::new("a".into(), a, true, FrameCodec::default());
        assert!(matches!(
            encrypted.send_text("hello").await,
            Err(AppError::NotConnected(_))
        ));
        encrypted.dispose().await;

        // no secure session to negotiate on a plain connection
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let credential =
            ServerCredential::from_pem(cert.pem().as_bytes(), key_pair.serialize_pem().as_bytes())
                .unwrap();
        let plain = Connection::new("b".into(), b, false, FrameCodec::default());
        assert!(plain.authenticate_as_server(&credential).await.is_ok());
        assert_eq!(plain.state(), ConnectionState::Accepted);
    }

    #[tokio::test]
    async fn test_secure_session_roundtrip() {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let credential =
            ServerCredential::from_pem(cert.pem().as_bytes(), key_pair.serialize_pem().as_bytes())
                .unwrap();
        let trust = ClientTrust::from_pem(cert.pem().as_bytes(), "localhost").unwrap();

        let (a, b) = tcp_pair().await;
        let client = Connection::new("client".into(), a, true, FrameCodec::default());
        let server = Connection::new("server".into(), b, true, FrameCodec::default());
        let (client_res, server_res) = tokio::join!(
            client.authenticate_as_client(&trust),
            server.authenticate_as_server(&credential)
        );
        client_res.unwrap();
        server_res.unwrap();
        // a second handshake is a no-op
        server.authenticate_as_server(&credential).await.unwrap();

        client.send_text("secret").await.unwrap();
        assert_eq!(
            server.receive_message().await.unwrap(),
            Some(Message::Data("secret".into()))
        );

        client.dispose().await;
        assert_eq!(server.receive_message().await.unwrap(), None);
        server.dispose().await;
    }
}
