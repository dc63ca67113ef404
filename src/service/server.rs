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

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio::signal;
use tracing::{debug, error, info, warn};

use super::config::FramelinkConfig;
use super::heartbeat::HeartbeatPolicy;
use super::registry::ConnectionRegistry;
use super::shutdown::{shutdown_channel, Shutdown};
use crate::network::{Connection, ConnectionState, FrameCodec, Message, ServerCredential};
use crate::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// `host:port`; port 0 picks a free port
    pub listen_addr: String,
    pub enable_heartbeat: bool,
    pub enable_encryption: bool,
    pub credential: Option<ServerCredential>,
    pub policy: HeartbeatPolicy,
    pub max_connections: usize,
    pub max_frame_size: usize,
    pub handshake_timeout: Duration,
}

impl ServerOptions {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        ServerOptions {
            listen_addr: listen_addr.into(),
            enable_heartbeat: false,
            enable_encryption: false,
            credential: None,
            policy: HeartbeatPolicy::default(),
            max_connections: 100,
            max_frame_size: crate::network::DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &FramelinkConfig) -> AppResult<Self> {
        let server = &config.server;
        let credential = if server.enable_encryption {
            let cert_path = server.cert_path.as_deref().ok_or(AppError::InvalidValue(
                "server.cert_path is required when encryption is enabled".into(),
            ))?;
            let key_path = server.key_path.as_deref().ok_or(AppError::InvalidValue(
                "server.key_path is required when encryption is enabled".into(),
            ))?;
            Some(ServerCredential::from_pem_files(
                Path::new(cert_path),
                Path::new(key_path),
            )?)
        } else {
            None
        };
        Ok(ServerOptions {
            listen_addr: format!("{}:{}", server.host, server.port),
            enable_heartbeat: server.enable_heartbeat,
            enable_encryption: server.enable_encryption,
            credential,
            policy: config.heartbeat.policy()?,
            max_connections: server.max_connections,
            max_frame_size: config.network.max_frame_size,
            handshake_timeout: Duration::from_millis(server.handshake_timeout_ms),
        })
    }

    fn validate(&self) -> AppResult<()> {
        if self.enable_encryption && self.credential.is_none() {
            return Err(AppError::InvalidValue(
                "encryption enabled without a server credential".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(AppError::InvalidValue("max_connections must be positive".into()));
        }
        if self.enable_heartbeat {
            self.policy.validate()?;
        }
        Ok(())
    }
}

/// A running server: accept loop, one handling task per connection and, with
/// heartbeat enabled, the idle reaper.
///
/// Every spawned task holds a clone of `shutdown_complete_tx`; `stop` signals
/// shutdown and then waits until all of those clones are gone.
#[derive(Debug)]
pub struct Server {
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    notify_shutdown: watch::Sender<bool>,
    shutdown_complete_rx: mpsc::Receiver<()>,
    accept_task: Option<JoinHandle<()>>,
    reaper_task: Option<JoinHandle<()>>,
}

impl Server {
    /// Binds the listener and starts serving in the background.
    pub async fn start(options: ServerOptions) -> AppResult<Server> {
        options.validate()?;

        let listener = TcpListener::bind(&options.listen_addr)
            .await
            .map_err(|err| {
                let error_msg = format!(
                    "Failed to bind server to address: {} - Error: {}",
                    options.listen_addr, err
                );
                error!("{}", error_msg);
                AppError::IllegalStateError(error_msg)
            })?;
        let local_addr = listener.local_addr()?;
        info!("tcp server binding to {} for listening", local_addr);

        let options = Arc::new(options);
        let registry = Arc::new(ConnectionRegistry::new());
        let notify_shutdown = shutdown_channel();
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

        let reaper_task = if options.enable_heartbeat {
            let reaper = IdleReaper {
                registry: registry.clone(),
                policy: options.policy,
                shutdown: Shutdown::new(notify_shutdown.subscribe()),
                _shutdown_complete_tx: shutdown_complete_tx.clone(),
            };
            Some(tokio::spawn(reaper.run()))
        } else {
            None
        };

        let acceptor = Acceptor {
            listener,
            limit_connections: Arc::new(Semaphore::new(options.max_connections)),
            codec: FrameCodec::new(options.max_frame_size),
            options,
            registry: registry.clone(),
            notify_shutdown: notify_shutdown.clone(),
            shutdown_complete_tx,
        };
        let accept_task = tokio::spawn(async move {
            if let Err(err) = acceptor.run().await {
                error!(cause = %err, "failed to accept");
            }
        });

        Ok(Server {
            local_addr,
            registry,
            notify_shutdown,
            shutdown_complete_rx,
            accept_task: Some(accept_task),
            reaper_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Serves until ctrl-c or until the accept loop gives up, then stops.
    pub async fn run_until_ctrl_c(mut self) -> AppResult<()> {
        if let Some(mut accept_task) = self.accept_task.take() {
            tokio::select! {
                res = &mut accept_task => {
                    if let Err(err) = res {
                        error!("accept loop aborted: {}", err);
                    }
                }
                _ = signal::ctrl_c() => {
                    info!("get shutdown signal");
                    self.accept_task = Some(accept_task);
                }
            }
        }
        self.stop().await;
        Ok(())
    }

    /// Stops accepting, closes every connection and waits for all server
    /// tasks to finish.
    pub async fn stop(mut self) {
        info!("server {} shutting down", self.local_addr);
        self.notify_shutdown.send_replace(true);

        for task in [self.accept_task.take(), self.reaper_task.take()]
            .into_iter()
            .flatten()
        {
            if let Err(err) = task.await {
                error!("server task failed during shutdown: {}", err);
            }
        }
        // resolves with None once every handling task dropped its sender
        let _ = self.shutdown_complete_rx.recv().await;
        info!("server {} shutdown complete", self.local_addr);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // a server dropped without `stop` still winds its tasks down
        self.notify_shutdown.send_replace(true);
        debug!("tcp server dropped");
    }
}

struct Acceptor {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    codec: FrameCodec,
    options: Arc<ServerOptions>,
    registry: Arc<ConnectionRegistry>,
    notify_shutdown: watch::Sender<bool>,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl Acceptor {
    /// Accepts connections and hands each one to its own task.
    ///
    /// Never waits on a single connection: the handshake, registration and
    /// the read loop all happen in the spawned handler.
    async fn run(self) -> AppResult<()> {
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        loop {
            let permit = tokio::select! {
                permit = self.limit_connections.clone().acquire_owned() => {
                    permit.map_err(|e| AppError::IllegalStateError(e.to_string()))?
                }
                _ = shutdown.recv() => break,
            };

            let socket = tokio::select! {
                res = self.accept() => res?,
                _ = shutdown.recv() => break,
            };

            let connection_id = Connection::derive_id(&socket);
            info!("client connected: {}", connection_id);
            let connection = Arc::new(Connection::new(
                connection_id,
                socket,
                self.options.enable_encryption,
                self.codec,
            ));

            let mut handler = ConnectionHandler {
                connection,
                options: self.options.clone(),
                registry: self.registry.clone(),
                shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
                _shutdown_complete_tx: self.shutdown_complete_tx.clone(),
            };

            tokio::spawn(async move {
                handler.run().await;
                // whether gracefully or unexpectedly closed, release the slot
                drop(permit);
            });
        }
        debug!("accept loop exit after recv shutdown signal");
        Ok(())
    }

    async fn accept(&self) -> AppResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::Accept(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                    warn!("accept failed, retry in {}s: {}", backoff, err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

// handler for each connection
struct ConnectionHandler {
    connection: Arc<Connection>,
    options: Arc<ServerOptions>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Shutdown,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl ConnectionHandler {
    async fn run(&mut self) {
        let id = self.connection.id().to_string();
        match self.establish().await {
            Ok(()) => match self.handle_connection().await {
                Ok(()) => debug!("connection {} finished", id),
                Err(AppError::LivenessTimeout(timeout)) => {
                    warn!("client {} timeout after {:?}, closing connection", id, timeout)
                }
                Err(AppError::ConnectionClosed(_)) => {
                    debug!("connection {} was closed by another task", id)
                }
                Err(err) if err.is_disconnect() => info!("client {} disconnected: {}", id, err),
                Err(err) => error!("connection {} error: {}", id, err),
            },
            Err(err) => error!("connection {} not established: {}", id, err),
        }
        self.teardown().await;
    }

    /// Runs the inbound handshake when encryption is on, then registers the
    /// connection. A connection that failed its handshake is never registered.
    async fn establish(&mut self) -> AppResult<()> {
        if let Some(credential) = self.options.credential.as_ref() {
            if self.options.enable_encryption {
                let timeout = self.options.handshake_timeout;
                let handshake = self.connection.authenticate_as_server(credential);
                tokio::select! {
                    res = time::timeout(timeout, handshake) => {
                        res.map_err(|_| {
                            AppError::HandshakeFailure(format!("timed out after {:?}", timeout))
                        })??;
                    }
                    _ = self.shutdown.recv() => {
                        return Err(AppError::ConnectionClosed(self.connection.id().to_string()));
                    }
                }
            }
        }
        self.registry
            .insert(self.connection.id().to_string(), self.connection.clone());
        self.connection.set_state(ConnectionState::Serving);
        Ok(())
    }

    async fn handle_connection(&mut self) -> AppResult<()> {
        let connection = &self.connection;
        loop {
            // Ok(None) when the client closed gracefully, Err when it vanished mid-frame
            let maybe_message = tokio::select! {
                res = receive(connection, &self.options) => res?,
                _ = self.shutdown.recv() => {
                    debug!("connection handler exit read loop after recv shutdown signal");
                    return Ok(());
                }
            };

            let message = match maybe_message {
                Some(message) => message,
                None => {
                    info!("client {} closed the connection", connection.id());
                    break;
                }
            };

            match message {
                Message::Heartbeat => {
                    debug!("[HEARTBEAT] from {}", connection.id());
                    connection.update_last_active();
                }
                Message::DisconnectNotice => {
                    info!("client {} announced disconnect", connection.id());
                }
                Message::Data(text) => {
                    info!("received from {}: {}", connection.id(), text);
                    // a peer that never reads would otherwise pin this task past shutdown
                    let reply = Message::echo(&text);
                    tokio::select! {
                        res = connection.send_message(&reply) => res?,
                        _ = self.shutdown.recv() => {
                            debug!("connection handler abandon echo after recv shutdown signal");
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // the only cleanup path of a handled connection
    async fn teardown(&self) {
        info!("closing for client {}", self.connection.id());
        self.registry.remove_connection(&self.connection);
        self.connection.dispose().await;
        info!("client {} closed", self.connection.id());
    }
}

/// Waits for the next frame, bounded by the liveness timeout when heartbeat
/// is enabled.
async fn receive(connection: &Connection, options: &ServerOptions) -> AppResult<Option<Message>> {
    if !options.enable_heartbeat {
        return connection.receive_message().await;
    }
    let timeout = options.policy.liveness_timeout;
    match time::timeout(timeout, connection.receive_message()).await {
        Ok(res) => res,
        Err(_) => Err(AppError::LivenessTimeout(timeout)),
    }
}

struct IdleReaper {
    registry: Arc<ConnectionRegistry>,
    policy: HeartbeatPolicy,
    shutdown: Shutdown,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl IdleReaper {
    async fn run(mut self) {
        let period = self.policy.sweep_interval;
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.shutdown.recv() => {
                    debug!("idle reaper receiving shutdown signal");
                    break;
                }
            }
            let reaped = self.sweep().await;
            if reaped > 0 {
                info!("idle reaper removed {} connection(s)", reaped);
            }
        }
    }

    /// Evicts and disposes every connection idle for longer than the idle
    /// threshold. A connection its handler already removed is skipped.
    async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut reaped = 0;
        for (id, connection) in self.registry.snapshot_for_sweep() {
            if !self.policy.is_idle(connection.last_active(), now) {
                continue;
            }
            if self.registry.remove_connection(&connection) {
                let reason = AppError::IdleTimeout(self.policy.idle_threshold);
                info!("removing inactive client {}: {}", id, reason);
                connection.dispose().await;
                reaped += 1;
            }
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registered_connection(
        registry: &ConnectionRegistry,
        id: &str,
    ) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let conn = Arc::new(Connection::new(
            id.to_string(),
            accepted.unwrap().0,
            false,
            FrameCodec::default(),
        ));
        registry.insert(id.to_string(), conn.clone());
        (conn, client.unwrap())
    }

    fn reaper(registry: Arc<ConnectionRegistry>) -> (IdleReaper, watch::Sender<bool>, mpsc::Receiver<()>) {
        let notify = shutdown_channel();
        let (tx, rx) = mpsc::channel(1);
        let reaper = IdleReaper {
            registry,
            policy: HeartbeatPolicy::default(),
            shutdown: Shutdown::new(notify.subscribe()),
            _shutdown_complete_tx: tx,
        };
        (reaper, notify, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_reaps_only_idle_connections() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (stale, _p1) = registered_connection(&registry, "stale").await;
        let (fresh, _p2) = registered_connection(&registry, "fresh").await;
        let (reaper, _notify, _rx) = reaper(registry.clone());

        time::advance(Duration::from_secs(100)).await;
        fresh.update_last_active();
        time::advance(Duration::from_secs(21)).await;

        assert_eq!(reaper.sweep().await, 1);
        assert!(!registry.contains("stale"));
        assert!(registry.contains("fresh"));
        assert!(stale.is_closed());
        assert!(!fresh.is_closed());

        // a second sweep finds nothing left to do
        assert_eq!(reaper.sweep().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_skips_connection_removed_by_handler() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, _peer) = registered_connection(&registry, "gone").await;
        let (reaper, _notify, _rx) = reaper(registry.clone());

        time::advance(Duration::from_secs(121)).await;
        // the handler won the race
        assert!(registry.remove_connection(&conn));
        conn.dispose().await;

        assert_eq!(reaper.sweep().await, 0);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_reaper_exits_on_shutdown() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (reaper, notify, mut rx) = reaper(registry);
        let task = tokio::spawn(reaper.run());

        notify.send_replace(true);
        time::timeout(Duration::from_secs(1), task)
            .await
            .expect("reaper must stop on shutdown")
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_options_validation() {
        let mut options = ServerOptions::new("127.0.0.1:0");
        options.enable_encryption = true;
        assert!(matches!(
            Server::start(options).await,
            Err(AppError::InvalidValue(_))
        ));

        let mut options = ServerOptions::new("127.0.0.1:0");
        options.enable_heartbeat = true;
        options.policy.idle_threshold = options.policy.liveness_timeout;
        assert!(matches!(
            Server::start(options).await,
            Err(AppError::InvalidValue(_))
        ));

        let mut options = ServerOptions::new("127.0.0.1:0");
        options.max_connections = 0;
        assert!(Server::start(options).await.is_err());
    }

    #[test]
    fn test_options_from_config() {
        let mut config = FramelinkConfig::default();
        config.server.port = 6060;
        config.server.enable_heartbeat = true;
        let options = ServerOptions::from_config(&config).unwrap();
        assert_eq!(options.listen_addr, "0.0.0.0:6060");
        assert!(options.enable_heartbeat);
        assert!(options.credential.is_none());

        config.server.enable_encryption = true;
        assert!(matches!(
            ServerOptions::from_config(&config),
            Err(AppError::InvalidValue(_))
        ));
    }
}
