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
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::FramelinkConfig;
use super::heartbeat::HeartbeatPolicy;
use super::shutdown::{shutdown_channel, Shutdown};
use crate::network::{ClientTrust, Connection, ConnectionState, FrameCodec, Message};
use crate::{AppError, AppResult};

const INBOUND_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// `host:port` of the server
    pub server_addr: String,
    pub enable_heartbeat: bool,
    pub enable_encryption: bool,
    pub trust: Option<ClientTrust>,
    pub policy: HeartbeatPolicy,
    pub close_grace: Duration,
    pub max_frame_size: usize,
    pub handshake_timeout: Duration,
}

impl ClientOptions {
    pub fn new(server_addr: impl Into<String>) -> Self {
        ClientOptions {
            server_addr: server_addr.into(),
            enable_heartbeat: false,
            enable_encryption: false,
            trust: None,
            policy: HeartbeatPolicy::default(),
            close_grace: Duration::from_secs(1),
            max_frame_size: crate::network::DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &FramelinkConfig) -> AppResult<Self> {
        let client = &config.client;
        let trust = if client.enable_encryption {
            let ca_path = client.ca_cert_path.as_deref().ok_or(AppError::InvalidValue(
                "client.ca_cert_path is required when encryption is enabled".into(),
            ))?;
            Some(ClientTrust::from_pem_file(
                Path::new(ca_path),
                &client.server_name,
            )?)
        } else {
            None
        };
        Ok(ClientOptions {
            server_addr: format!("{}:{}", client.host, client.port),
            enable_heartbeat: client.enable_heartbeat,
            enable_encryption: client.enable_encryption,
            trust,
            policy: config.heartbeat.policy()?,
            close_grace: Duration::from_millis(client.close_grace_ms),
            max_frame_size: config.network.max_frame_size,
            handshake_timeout: Duration::from_millis(client.handshake_timeout_ms),
        })
    }

    fn validate(&self) -> AppResult<()> {
        if self.enable_encryption && self.trust.is_none() {
            return Err(AppError::InvalidValue(
                "encryption enabled without a trusted server certificate".into(),
            ));
        }
        if self.enable_heartbeat {
            self.policy.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    Disconnecting,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Handshaking => "handshaking",
            ClientState::Connected => "connected",
            ClientState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// State shared between the caller-facing `Client` and its background tasks.
struct ClientInner {
    options: ClientOptions,
    connection: parking_lot::Mutex<Option<Arc<Connection>>>,
    state: parking_lot::Mutex<ClientState>,
    closing: AtomicBool,
    notify_shutdown: watch::Sender<bool>,
}

impl ClientInner {
    fn set_state(&self, state: ClientState) {
        let mut current = self.state.lock();
        debug!("client state {} -> {}", *current, state);
        *current = state;
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().clone()
    }

    /// Graceful close: disconnect notice, grace period, dispose, forget the
    /// connection. Runs its body once no matter how many callers race here.
    async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ClientState::Disconnecting);
        // stop the heartbeat sender before the last frames go out
        self.notify_shutdown.send_replace(true);

        if let Some(connection) = self.connection() {
            // without a notice the server may see a reset instead of a clean close
            let notice = connection.send_message(&Message::DisconnectNotice);
            match time::timeout(self.options.close_grace, notice).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!("disconnect notice not delivered: {}", err),
                Err(_) => debug!("disconnect notice not delivered within grace period"),
            }
            time::sleep(self.options.close_grace).await;
            connection.dispose().await;
            *self.connection.lock() = None;
            info!("disconnected from {}", self.options.server_addr);
        }
        self.set_state(ClientState::Disconnected);
    }
}

/// One outbound connection with optional heartbeat.
///
/// Application messages received from the server are forwarded to
/// [`Client::recv`]. When the server goes away the client closes itself.
pub struct Client {
    inner: Arc<ClientInner>,
    inbound: mpsc::Receiver<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    pub async fn connect(options: ClientOptions) -> AppResult<Client> {
        options.validate()?;
        let inner = Arc::new(ClientInner {
            options,
            connection: parking_lot::Mutex::new(None),
            state: parking_lot::Mutex::new(ClientState::Connecting),
            closing: AtomicBool::new(false),
            notify_shutdown: shutdown_channel(),
        });
        let options = &inner.options;

        let socket = TcpStream::connect(&options.server_addr).await.map_err(|e| {
            inner.set_state(ClientState::Disconnected);
            AppError::DetailedIoError(format!("connect {}: {}", options.server_addr, e))
        })?;
        info!("connected to {}", options.server_addr);

        let connection = Arc::new(Connection::new(
            Uuid::new_v4().to_string(),
            socket,
            options.enable_encryption,
            FrameCodec::new(options.max_frame_size),
        ));

        if let Some(trust) = options.trust.as_ref().filter(|_| options.enable_encryption) {
            inner.set_state(ClientState::Handshaking);
            let handshake = time::timeout(
                options.handshake_timeout,
                connection.authenticate_as_client(trust),
            )
            .await
            .map_err(|_| {
                AppError::HandshakeFailure(format!(
                    "timed out after {:?}",
                    options.handshake_timeout
                ))
            })
            .and_then(|res| res);
            if let Err(err) = handshake {
                connection.dispose().await;
                inner.set_state(ClientState::Disconnected);
                return Err(err);
            }
        }

        connection.set_state(ConnectionState::Serving);
        *inner.connection.lock() = Some(connection.clone());
        inner.set_state(ClientState::Connected);

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let mut tasks = Vec::with_capacity(2);
        if options.enable_heartbeat {
            tasks.push(tokio::spawn(heartbeat_loop(
                connection.clone(),
                options.policy.interval,
                Shutdown::new(inner.notify_shutdown.subscribe()),
            )));
        }
        tasks.push(tokio::spawn(receive_loop(
            inner.clone(),
            connection,
            inbound_tx,
        )));

        Ok(Client {
            inner,
            inbound: inbound_rx,
            tasks,
        })
    }

    pub async fn send_message(&self, text: &str) -> AppResult<()> {
        let connection = self
            .inner
            .connection()
            .ok_or_else(|| AppError::NotConnected("not connected to server".into()))?;
        connection.send_text(text).await
    }

    /// Next application message from the server, `None` once the connection
    /// is gone and everything received was consumed.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Closes the connection and waits for the heartbeat and receive tasks.
    pub async fn close(&mut self) {
        self.inner.close().await;
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                error!("client task failed during close: {}", err);
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.inner.closing.load(Ordering::Acquire) {
            return;
        }
        // no await here, let the runtime finish the close sequence
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            handle.spawn(async move { inner.close().await });
        }
    }
}

/// Sends a heartbeat every `interval` until shutdown or the first failed send.
async fn heartbeat_loop(connection: Arc<Connection>, interval: Duration, mut shutdown: Shutdown) {
    loop {
        tokio::select! {
            _ = time::sleep(interval) => {}
            _ = shutdown.recv() => break,
        }
        if let Err(err) = connection.send_message(&Message::Heartbeat).await {
            warn!("heartbeat failed, stopped heartbeat: {}", err);
            break;
        }
        debug!("heartbeat sent on {}", connection.id());
    }
}

async fn receive_loop(
    inner: Arc<ClientInner>,
    connection: Arc<Connection>,
    inbound: mpsc::Sender<String>,
) {
    loop {
        match connection.receive_message().await {
            Ok(Some(Message::Data(text))) => {
                info!("received {}", text);
                // a full channel must not keep this task alive past close
                tokio::select! {
                    res = inbound.send(text) => {
                        if res.is_err() {
                            debug!("inbound receiver dropped, message discarded");
                        }
                    }
                    _ = connection.closed() => break,
                }
            }
            Ok(Some(control)) => debug!("ignore control message {} from server", control),
            Ok(None) => {
                info!("server closed the connection");
                break;
            }
            // closed on our side, nothing to report
            Err(_) if connection.is_closed() => break,
            Err(err) => {
                error!("receive failed: {}", err);
                break;
            }
        }
    }
    inner.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_validation() {
        let mut options = ClientOptions::new("127.0.0.1:1");
        options.enable_encryption = true;
        assert!(matches!(
            Client::connect(options).await,
            Err(AppError::InvalidValue(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = Client::connect(ClientOptions::new(format!("127.0.0.1:{}", port))).await;
        assert!(matches!(result, Err(AppError::DetailedIoError(_))));
    }

    #[test]
    fn test_options_from_config() {
        let mut config = FramelinkConfig::default();
        config.client.port = 7070;
        config.client.close_grace_ms = 250;
        let options = ClientOptions::from_config(&config).unwrap();
        assert_eq!(options.server_addr, "127.0.0.1:7070");
        assert_eq!(options.close_grace, Duration::from_millis(250));

        config.client.enable_encryption = true;
        assert!(ClientOptions::from_config(&config).is_err());
    }
}
