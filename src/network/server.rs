//! WebSocket Game Server
//!
//! Async WebSocket server for multiplayer connections.
//!
//! Connection tasks authenticate clients and forward their messages to a
//! single engine task over an mpsc channel. The engine owns the
//! [`RoomManager`], steps simulations on a drift-corrected clock and routes
//! everything the manager emits back to the connections.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::game::scheduler::TickClock;
use crate::game::state::PlayerId;
use crate::lobby::manager::{Outgoing, Recipient, RoomConfig, RoomManager};
use crate::network::auth::{authenticate, AuthConfig, PlayerIdentity};
use crate::network::protocol::{AuthResult, ClientMessage, ErrorCode, ServerMessage};

/// Per-connection outbound queue depth.
const OUTBOUND_QUEUE: usize = 256;

/// Engine command queue depth.
const COMMAND_QUEUE: usize = 4096;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Close connections silent for this long.
    pub idle_timeout: Duration,
    /// Simulation rate (Hz).
    pub tick_rate: u32,
    /// Server version string.
    pub version: String,
    /// Lobby settings.
    pub room: RoomConfig,
    /// Identity token settings.
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            tick_rate: crate::TICK_RATE,
            version: crate::VERSION.to_string(),
            room: RoomConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build from `QUADPONG_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, GameServerError> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("QUADPONG_BIND_ADDR") {
            config.bind_addr = addr
                .parse()
                .map_err(|_| GameServerError::InvalidConfig(format!("QUADPONG_BIND_ADDR: {addr}")))?;
        }
        if let Ok(value) = std::env::var("QUADPONG_MAX_CONNECTIONS") {
            config.max_connections = value
                .parse()
                .map_err(|_| GameServerError::InvalidConfig(format!("QUADPONG_MAX_CONNECTIONS: {value}")))?;
        }
        if let Ok(value) = std::env::var("QUADPONG_TICK_RATE") {
            config.tick_rate = value
                .parse()
                .ok()
                .filter(|rate| *rate > 0)
                .ok_or_else(|| GameServerError::InvalidConfig(format!("QUADPONG_TICK_RATE: {value}")))?;
        }
        if let Ok(value) = std::env::var("QUADPONG_SEED") {
            config.room.seed = value
                .parse()
                .map_err(|_| GameServerError::InvalidConfig(format!("QUADPONG_SEED: {value}")))?;
        }
        config.auth = AuthConfig::from_env();

        Ok(config)
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,

    /// Bad configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Engine task is gone.
    #[error("Engine unavailable")]
    EngineClosed,
}

// =============================================================================
// ENGINE
// =============================================================================

/// Work handed from connection tasks to the engine.
#[derive(Debug)]
pub enum EngineCommand {
    /// An authenticated connection came up.
    Connect {
        identity: PlayerIdentity,
        conn_id: u64,
        sender: mpsc::Sender<ServerMessage>,
    },
    /// A lobby or game message.
    Message {
        player_id: PlayerId,
        conn_id: u64,
        message: ClientMessage,
    },
    /// The connection closed.
    Disconnect { player_id: PlayerId, conn_id: u64 },
}

struct Connection {
    conn_id: u64,
    sender: mpsc::Sender<ServerMessage>,
}

/// Single writer over all lobby and simulation state.
pub struct Engine {
    manager: RoomManager,
    connections: BTreeMap<PlayerId, Connection>,
    clock: TickClock,
}

impl Engine {
    pub fn new(room: RoomConfig, tick_rate: u32, now: Instant) -> Self {
        Self {
            manager: RoomManager::new(room),
            connections: BTreeMap::new(),
            clock: TickClock::new(tick_rate, now),
        }
    }

    pub fn manager(&self) -> &RoomManager {
        &self.manager
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Apply one command and route the results.
    pub fn handle_command(&mut self, command: EngineCommand, now: Instant) {
        match command {
            EngineCommand::Connect { identity, conn_id, sender } => {
                let previous = self.connections.insert(identity.id.clone(), Connection { conn_id, sender });
                if let Some(previous) = previous {
                    // Same identity signed in again; the old socket stops receiving
                    let _ = previous.sender.try_send(ServerMessage::Shutdown {
                        reason: "Signed in from another connection".to_string(),
                    });
                }
                self.manager.connect(identity.id, identity.name);
            }
            EngineCommand::Message { player_id, conn_id, message } => {
                if !self.is_current(&player_id, conn_id) {
                    debug!(%player_id, conn_id, "Message from superseded connection");
                    return;
                }
                self.manager.handle_message(&player_id, message, now);
            }
            EngineCommand::Disconnect { player_id, conn_id } => {
                if !self.is_current(&player_id, conn_id) {
                    return;
                }
                self.connections.remove(&player_id);
                self.manager.disconnect(&player_id, now);
            }
        }
        self.route();
    }

    /// Clock wake: step simulations, fire timers, broadcast state changes.
    pub fn on_wake(&mut self, now: Instant) {
        let ticks = self.clock.wake(now);
        self.manager.run_ticks(ticks, now);
        self.manager.poll_timers(now);
        self.manager.flush_instructions();
        self.route();
    }

    fn is_current(&self, player_id: &PlayerId, conn_id: u64) -> bool {
        self.connections.get(player_id).is_some_and(|c| c.conn_id == conn_id)
    }

    fn route(&mut self) {
        for Outgoing { to, message } in self.manager.take_outbox() {
            match to {
                Recipient::Player(player_id) => self.deliver(&player_id, message),
                Recipient::Everyone => {
                    for (player_id, connection) in &self.connections {
                        Self::try_deliver(player_id, connection, message.clone());
                    }
                }
            }
        }
    }

    fn deliver(&self, player_id: &PlayerId, message: ServerMessage) {
        if let Some(connection) = self.connections.get(player_id) {
            Self::try_deliver(player_id, connection, message);
        }
    }

    fn try_deliver(player_id: &PlayerId, connection: &Connection, message: ServerMessage) {
        match connection.sender.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%player_id, "Outbound queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(%player_id, "Outbound queue closed");
            }
        }
    }

    /// Run until the command channel closes or shutdown fires.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Engine started");
        loop {
            let wake = tokio::time::Instant::from_std(self.clock.next_wake());
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command, Instant::now()),
                    None => break,
                },
                _ = tokio::time::sleep_until(wake) => self.on_wake(Instant::now()),
                _ = shutdown.recv() => break,
            }
        }
        info!("Engine stopped");
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// Connected client state.
struct ConnectedClient {
    /// Player identifier (after auth).
    player_id: Option<PlayerId>,
    /// Connection time.
    connected_at: Instant,
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: Arc<ServerConfig>,
    /// Connected clients.
    clients: Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
    /// Connection id source.
    next_conn_id: AtomicU64,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config: Arc::new(config),
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            next_conn_id: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    /// Bind and run the server.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run the server on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Game server listening on {}", listener.local_addr()?);

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let engine = Engine::new(self.config.room.clone(), self.config.tick_rate, Instant::now());
        let engine_handle = tokio::spawn(engine.run(command_rx, self.shutdown_tx.subscribe()));

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr, command_tx.clone());
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        drop(command_tx);
        if let Err(e) = engine_handle.await {
            error!("Engine task failed: {}", e);
        }

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr, commands: mpsc::Sender<EngineCommand>) {
        let clients = self.clients.clone();
        let config = self.config.clone();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE);

            clients.write().await.insert(addr, ConnectedClient {
                player_id: None,
                connected_at: Instant::now(),
            });

            // Writer task
            let sender_task: JoinHandle<()> = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            let mut player_id: Option<PlayerId> = None;

            loop {
                tokio::select! {
                    msg = tokio::time::timeout(config.idle_timeout, ws_receiver.next()) => {
                        match msg {
                            Err(_) => {
                                info!("Client {} idle, closing", addr);
                                break;
                            }
                            Ok(Some(Ok(Message::Text(text)))) => {
                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = msg_tx.send(ServerMessage::error(
                                            ErrorCode::InvalidMessage,
                                            "Invalid message format",
                                        )).await;
                                        continue;
                                    }
                                };

                                let result = Self::handle_client_message(
                                    client_msg,
                                    &mut player_id,
                                    conn_id,
                                    &config,
                                    &commands,
                                    &msg_tx,
                                ).await;

                                if let Err(e) = result {
                                    error!("Client {} dropped: {}", addr, e);
                                    break;
                                }
                                if let Some(id) = &player_id {
                                    if let Some(client) = clients.write().await.get_mut(&addr) {
                                        client.player_id.get_or_insert_with(|| id.clone());
                                    }
                                }
                            }
                            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Ok(Some(Err(e))) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            Ok(Some(Ok(_))) => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Cleanup
            if let Some(player_id) = player_id {
                let _ = commands.send(EngineCommand::Disconnect { player_id, conn_id }).await;
            }
            drop(msg_tx);
            if tokio::time::timeout(Duration::from_secs(1), sender_task).await.is_err() {
                debug!("Writer for {} did not drain in time", addr);
            }

            if let Some(client) = clients.write().await.remove(&addr) {
                info!(
                    player_id = ?client.player_id,
                    "Client {} cleaned up after {:?}", addr, client.connected_at.elapsed()
                );
            }
        });
    }

    /// Handle a client message. Only `auth` and `ping` are accepted before
    /// authentication; everything else goes to the engine.
    async fn handle_client_message(
        msg: ClientMessage,
        player_id: &mut Option<PlayerId>,
        conn_id: u64,
        config: &ServerConfig,
        commands: &mpsc::Sender<EngineCommand>,
        sender: &mpsc::Sender<ServerMessage>,
    ) -> Result<(), GameServerError> {
        match (msg, player_id.as_ref()) {
            (ClientMessage::Ping { timestamp }, _) => {
                let _ = sender.send(ServerMessage::Pong {
                    timestamp,
                    server_time: std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis() as u64,
                }).await;
            }
            (ClientMessage::Auth(request), None) => match authenticate(&request, &config.auth) {
                Ok(identity) => {
                    let _ = sender.send(ServerMessage::AuthResult(AuthResult {
                        success: true,
                        player_id: Some(identity.id.to_string()),
                        error: None,
                        server_version: config.version.clone(),
                    })).await;

                    *player_id = Some(identity.id.clone());
                    debug!(player_id = %identity.id, conn_id, "Client authenticated");
                    commands
                        .send(EngineCommand::Connect { identity, conn_id, sender: sender.clone() })
                        .await
                        .map_err(|_| GameServerError::EngineClosed)?;
                }
                Err(e) => {
                    warn!(conn_id, error = %e, "Authentication failed");
                    let _ = sender.send(ServerMessage::AuthResult(AuthResult {
                        success: false,
                        player_id: None,
                        error: Some(e.to_string()),
                        server_version: config.version.clone(),
                    })).await;
                    let _ = sender.send(ServerMessage::error(e.code(), e.to_string())).await;
                }
            },
            (ClientMessage::Auth(_), Some(_)) => {
                debug!(conn_id, "Ignoring repeated auth");
            }
            (_, None) => {
                let _ = sender.send(ServerMessage::error(
                    ErrorCode::NotAuthenticated,
                    "Must authenticate first",
                )).await;
            }
            (message, Some(id)) => {
                commands
                    .send(EngineCommand::Message { player_id: id.clone(), conn_id, message })
                    .await
                    .map_err(|_| GameServerError::EngineClosed)?;
            }
        }
        Ok(())
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::{AuthRequest, CreateRoomRequest};
    use crate::lobby::room::RoomType;

    fn identity(id: &str) -> PlayerIdentity {
        PlayerIdentity { id: PlayerId::from(id), name: id.to_uppercase() }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.tick_rate, 60);
        assert_eq!(config.max_connections, 1000);
        assert!(!config.auth.is_configured());
    }

    #[test]
    fn test_engine_connect_sends_state() {
        let now = Instant::now();
        let mut engine = Engine::new(RoomConfig::default(), 60, now);
        let (tx, mut rx) = mpsc::channel(16);

        engine.handle_command(EngineCommand::Connect { identity: identity("a"), conn_id: 1, sender: tx }, now);

        let messages = drain(&mut rx);
        assert!(matches!(messages.last(), Some(ServerMessage::State { user_id, .. }) if user_id == "a"));
        assert_eq!(engine.connection_count(), 1);
    }

    #[test]
    fn test_engine_broadcasts_instructions_on_wake() {
        let now = Instant::now();
        let mut engine = Engine::new(RoomConfig::default(), 60, now);
        let (tx_a, mut rx_a) = mpsc::channel(64);
        let (tx_b, mut rx_b) = mpsc::channel(64);

        engine.handle_command(EngineCommand::Connect { identity: identity("a"), conn_id: 1, sender: tx_a }, now);
        engine.handle_command(EngineCommand::Connect { identity: identity("b"), conn_id: 2, sender: tx_b }, now);
        drain(&mut rx_a);
        drain(&mut rx_b);

        engine.handle_command(EngineCommand::Message {
            player_id: PlayerId::from("a"),
            conn_id: 1,
            message: ClientMessage::CreateRoom(CreateRoomRequest {
                name: "Arena".into(),
                room_type: RoomType::Single,
                players_max: None,
            }),
        }, now);
        engine.on_wake(now + Duration::from_millis(17));

        for rx in [&mut rx_a, &mut rx_b] {
            let messages = drain(rx);
            assert!(messages.iter().any(|m| matches!(m, ServerMessage::Instruction { batch } if !batch.is_empty())));
        }
        assert_eq!(engine.manager().rooms().count(), 1);
    }

    #[test]
    fn test_engine_ignores_superseded_connection() {
        let now = Instant::now();
        let mut engine = Engine::new(RoomConfig::default(), 60, now);
        let (old_tx, mut old_rx) = mpsc::channel(16);
        let (new_tx, _new_rx) = mpsc::channel(16);

        engine.handle_command(EngineCommand::Connect { identity: identity("a"), conn_id: 1, sender: old_tx }, now);
        engine.handle_command(EngineCommand::Connect { identity: identity("a"), conn_id: 2, sender: new_tx }, now);
        assert!(drain(&mut old_rx).iter().any(|m| matches!(m, ServerMessage::Shutdown { .. })));

        // The old socket closing must not log the player out
        engine.handle_command(EngineCommand::Disconnect { player_id: PlayerId::from("a"), conn_id: 1 }, now);
        assert_eq!(engine.connection_count(), 1);
        assert!(engine.manager().player(&PlayerId::from("a")).is_some());

        engine.handle_command(EngineCommand::Disconnect { player_id: PlayerId::from("a"), conn_id: 2 }, now);
        assert_eq!(engine.connection_count(), 0);
        assert!(engine.manager().player(&PlayerId::from("a")).is_none());
    }

    #[tokio::test]
    async fn test_server_creation() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = GameServer::new(config);

        assert_eq!(server.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = GameServer::new(config);
        server.shutdown();
        // Should not panic
    }

    #[tokio::test]
    async fn test_auth_then_snapshot_over_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(GameServer::new(ServerConfig::default()));
        let running = server.clone();
        let handle = tokio::spawn(async move { running.serve(listener).await });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();

        // Anything but auth is refused first
        ws.send(Message::Text(r#"{"event":"room.leave"}"#.into())).await.unwrap();
        let reply = ws.next().await.unwrap().unwrap().into_text().unwrap();
        assert!(matches!(
            ServerMessage::from_json(&reply).unwrap(),
            ServerMessage::Error(e) if e.code == ErrorCode::NotAuthenticated
        ));

        let auth = ClientMessage::Auth(AuthRequest {
            player_id: "p1".into(),
            name: "Ada".into(),
            token: None,
        });
        ws.send(Message::Text(auth.to_json().unwrap())).await.unwrap();

        let reply = ws.next().await.unwrap().unwrap().into_text().unwrap();
        match ServerMessage::from_json(&reply).unwrap() {
            ServerMessage::AuthResult(result) => {
                assert!(result.success);
                assert_eq!(result.player_id.as_deref(), Some("p1"));
            }
            other => panic!("expected auth.result, got {other:?}"),
        }

        // The engine answers with a full snapshot, possibly after a batch
        let mut saw_state = false;
        for _ in 0..4 {
            let text = ws.next().await.unwrap().unwrap().into_text().unwrap();
            if let ServerMessage::State { user_id, data, .. } = ServerMessage::from_json(&text).unwrap() {
                assert_eq!(user_id, "p1");
                assert_eq!(data["players"]["p1"]["name"], "Ada");
                saw_state = true;
                break;
            }
        }
        assert!(saw_state);

        server.shutdown();
        handle.await.unwrap().unwrap();
    }
}
