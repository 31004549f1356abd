//! The replica node: joins a game, mirrors the master's state, and takes
//! over or reconnects when the master vanishes.

use crate::server::Server;
use game::Game;
use log::{debug, error, info, warn};
use shared::{
    decode_message, encode_message, Direction, GameConfig, GameMessage, GamePlayer, GameStateMsg,
    MessageBody, NodeRole, PlayerType, MAX_DATAGRAM,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, timeout};

/// How long the join handshake waits for the master's Ack.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Mutable replica state, guarded by the client lock.
struct ClientState {
    player_id: i32,
    master_id: i32,
    master_addr: SocketAddr,
    deputy_id: Option<i32>,
    role: NodeRole,
    msg_seq: i64,
    last_state: Option<GameStateMsg>,
    last_state_order: i32,
    last_master_activity: Instant,
}

impl ClientState {
    fn next_seq(&mut self) -> i64 {
        self.msg_seq += 1;
        self.msg_seq
    }
}

struct ClientInner {
    game_name: String,
    config: GameConfig,
    socket: Arc<UdpSocket>,
    game: Arc<Mutex<Game>>,
    state: Mutex<ClientState>,
    /// Set once this node has taken over as master.
    promoted: Mutex<Option<Server>>,
    shutdown: watch::Sender<bool>,
}

/// The replica side of one game session.
///
/// Runs three cooperating tasks: the ping sender, the datagram listener, and
/// the master-liveness checker. The socket is deliberately left unconnected
/// so a deputy can reuse it as the listening socket of the server it becomes.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Joins a game: sends the Join request and blocks on the handshake
    /// reply. An Error frame from the master aborts the join with its text.
    pub async fn join(
        server_addr: SocketAddr,
        game_name: &str,
        player_name: &str,
        requested_role: NodeRole,
        config: GameConfig,
    ) -> Result<Client, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);

        let join = GameMessage::new(
            1,
            MessageBody::Join {
                player_type: PlayerType::Human,
                player_name: player_name.to_string(),
                game_name: game_name.to_string(),
                requested_role,
            },
        );
        socket.send_to(&encode_message(&join)?, server_addr).await?;
        debug!("join request sent to {}", server_addr);

        let (player_id, master_id) = Self::await_ack(&socket).await?;
        info!(
            "joined {:?} as player {} (master {})",
            game_name, player_id, master_id
        );

        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            game_name: game_name.to_string(),
            config: config.clone(),
            socket,
            game: Arc::new(Mutex::new(Game::new(config))),
            state: Mutex::new(ClientState {
                player_id,
                master_id,
                master_addr: server_addr,
                deputy_id: None,
                role: requested_role,
                msg_seq: 1,
                last_state: None,
                last_state_order: 0,
                last_master_activity: Instant::now(),
            }),
            promoted: Mutex::new(None),
            shutdown,
        });

        let client = Client { inner };
        client.spawn_ping_task();
        client.spawn_listener();
        client.spawn_master_liveness_task();
        Ok(client)
    }

    /// Waits for the handshake reply, skipping unrelated frames that may
    /// arrive first (a state broadcast can race the Ack).
    async fn await_ack(socket: &UdpSocket) -> Result<(i32, i32), Box<dyn std::error::Error>> {
        let mut buffer = [0u8; MAX_DATAGRAM];
        let deadline = Instant::now() + JOIN_TIMEOUT;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err("join timed out waiting for the master".into());
            }
            let (len, _) = timeout(remaining, socket.recv_from(&mut buffer)).await.map_err(
                |_| -> Box<dyn std::error::Error> { "join timed out waiting for the master".into() },
            )??;

            match decode_message(&buffer[..len]) {
                Ok(message) => match message.body {
                    MessageBody::Ack => {
                        let player_id =
                            message.receiver_id.ok_or("ack carried no player id")?;
                        let master_id = message.sender_id.ok_or("ack carried no master id")?;
                        return Ok((player_id, master_id));
                    }
                    MessageBody::Error { message } => {
                        return Err(format!("join refused: {}", message).into())
                    }
                    _ => debug!("skipping frame received before the join ack"),
                },
                Err(e) => warn!("undecodable frame during handshake: {}", e),
            }
        }
    }

    pub fn game(&self) -> Arc<Mutex<Game>> {
        Arc::clone(&self.inner.game)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// Fires when the node stops — by request, by a dead-end master loss, or
    /// by promotion (the server half keeps running in the latter case).
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    pub async fn player_id(&self) -> i32 {
        self.inner.state.lock().await.player_id
    }

    pub async fn role(&self) -> NodeRole {
        self.inner.state.lock().await.role
    }

    /// Order of the freshest snapshot accepted so far.
    pub async fn last_state_order(&self) -> i32 {
        self.inner.state.lock().await.last_state_order
    }

    /// Roster as this node last saw it: the promoted server's roster, or the
    /// one from the last trusted snapshot.
    pub async fn players(&self) -> Vec<GamePlayer> {
        if let Some(server) = self.inner.promoted.lock().await.as_ref() {
            return server.players().await;
        }
        let state = self.inner.state.lock().await;
        state
            .last_state
            .as_ref()
            .map(|s| s.players.clone())
            .unwrap_or_default()
    }

    pub async fn score(&self) -> i32 {
        let player_id = self.player_id().await;
        let game = self.inner.game.lock().await;
        game.score_of(player_id).unwrap_or(0)
    }

    /// Sends a steering intent to the master — or applies it directly once
    /// this node has become the master. Viewers have nothing to steer.
    pub async fn steer(&self, direction: Direction) {
        if let Some(server) = self.inner.promoted.lock().await.as_ref() {
            server.steer_local(direction).await;
            return;
        }

        let (frame, addr) = {
            let mut state = self.inner.state.lock().await;
            if state.role == NodeRole::Viewer {
                return;
            }
            let seq = state.next_seq();
            (
                GameMessage::addressed(
                    seq,
                    state.player_id,
                    state.master_id,
                    MessageBody::Steer { direction },
                ),
                state.master_addr,
            )
        };
        self.inner.send_message(&frame, addr).await;
    }

    /// Leaves the session: tells the master to treat this player as a
    /// viewer, then cancels every task. A promoted node stops its server
    /// instead, handing the game to its own deputy.
    pub async fn stop(&self) {
        if let Some(server) = self.inner.promoted.lock().await.as_ref() {
            server.stop().await;
            return;
        }

        info!("client stopping");
        let (farewell, addr) = {
            let mut state = self.inner.state.lock().await;
            let seq = state.next_seq();
            (
                GameMessage::addressed(
                    seq,
                    state.player_id,
                    state.master_id,
                    MessageBody::RoleChange {
                        sender_role: NodeRole::Viewer,
                        receiver_role: NodeRole::Master,
                    },
                ),
                state.master_addr,
            )
        };
        self.inner.send_message(&farewell, addr).await;
        let _ = self.inner.shutdown.send(true);
    }

    fn spawn_ping_task(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();
        let period = self.inner.config.ping_delay();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => inner.send_ping().await,
                }
            }
        });
    }

    fn spawn_listener(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();

        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = inner.socket.recv_from(&mut buffer) => match received {
                        Ok((len, src)) => match decode_message(&buffer[..len]) {
                            Ok(message) => inner.handle_frame(message, src).await,
                            Err(e) => warn!("undecodable frame from {}: {}", src, e),
                        },
                        Err(e) => {
                            error!("client receive error: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    },
                }
            }
        });
    }

    fn spawn_master_liveness_task(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();
        let wait_delay = self.inner.config.wait_delay();

        tokio::spawn(async move {
            let mut ticker = interval(wait_delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let silent = {
                            let state = inner.state.lock().await;
                            state.last_master_activity.elapsed() > wait_delay
                        };
                        if silent {
                            inner.handle_master_loss().await;
                        }
                    }
                }
            }
        });
    }
}

impl ClientInner {
    async fn handle_frame(&self, message: GameMessage, src: SocketAddr) {
        match message.body {
            MessageBody::State { state } => self.handle_state(message.msg_seq, state).await,
            MessageBody::Ping => {
                let mut state = self.state.lock().await;
                if src == state.master_addr {
                    state.last_master_activity = Instant::now();
                }
            }
            MessageBody::Error { message: text } => {
                warn!("error from master: {}", text);
                let (ack, addr) = {
                    let state = self.state.lock().await;
                    (
                        GameMessage::addressed(
                            message.msg_seq,
                            state.player_id,
                            state.master_id,
                            MessageBody::Ack,
                        ),
                        state.master_addr,
                    )
                };
                self.send_message(&ack, addr).await;
            }
            MessageBody::RoleChange { receiver_role, .. } => {
                self.handle_role_change(receiver_role).await
            }
            MessageBody::Ack => {}
            _ => debug!("unexpected frame from {}", src),
        }
    }

    /// Ingests a state snapshot: stale frames (by `state_order`) are
    /// discarded, fresh ones overwrite the local mirror and refresh the
    /// deputy hint and the master-activity clock. Every accepted state is
    /// acked with the frame's own sequence number.
    async fn handle_state(&self, msg_seq: i64, incoming: GameStateMsg) {
        // A node that became master ignores replica-bound frames; its own
        // game is the authority now.
        let (ack, addr) = {
            let mut state = self.state.lock().await;
            if state.role == NodeRole::Master {
                return;
            }
            if incoming.state_order <= state.last_state_order {
                debug!(
                    "discarding stale state {} (have {})",
                    incoming.state_order, state.last_state_order
                );
                return;
            }
            state.last_state_order = incoming.state_order;
            state.last_master_activity = Instant::now();

            let own_id = state.player_id;
            state.deputy_id = incoming
                .players
                .iter()
                .find(|p| p.role == NodeRole::Deputy)
                .map(|p| p.id);
            // The roster also carries our own role; adopt what the master
            // believes unless we already run the game ourselves.
            if let Some(own) = incoming.players.iter().find(|p| p.id == own_id) {
                if own.role != NodeRole::Master {
                    state.role = own.role;
                }
            }

            {
                let mut game = self.game.lock().await;
                game.field_mut().apply_state(&incoming);
            }
            state.last_state = Some(incoming);

            (
                GameMessage::addressed(msg_seq, state.player_id, state.master_id, MessageBody::Ack),
                state.master_addr,
            )
        };
        self.send_message(&ack, addr).await;
    }

    async fn handle_role_change(&self, receiver_role: NodeRole) {
        match receiver_role {
            NodeRole::Master => {
                info!("told to take the game over");
                self.promote().await;
            }
            NodeRole::Deputy => {
                let mut state = self.state.lock().await;
                info!("elected deputy");
                state.role = NodeRole::Deputy;
                let own_id = state.player_id;
                state.deputy_id = Some(own_id);
            }
            NodeRole::Viewer => {
                let mut state = self.state.lock().await;
                info!("demoted to viewer");
                state.role = NodeRole::Viewer;
            }
            NodeRole::Normal => {
                let mut state = self.state.lock().await;
                state.role = NodeRole::Normal;
            }
        }
    }

    /// The master went silent. A deputy takes the game over; a normal peer
    /// re-points itself at the deputy named in the last trusted state; a
    /// viewer (or a peer with no deputy to fall back on) stops.
    async fn handle_master_loss(&self) {
        let role = self.state.lock().await.role;
        match role {
            NodeRole::Deputy => self.promote().await,
            NodeRole::Normal => self.reconnect_to_deputy().await,
            NodeRole::Viewer => {
                warn!("master lost and this node only watches; stopping");
                let _ = self.shutdown.send(true);
            }
            NodeRole::Master => {}
        }
    }

    /// Becomes the master: rebuilds a server from the last trusted snapshot
    /// on this node's own socket and game, then cancels the replica tasks.
    /// From the peers' point of view the deputy's address simply starts
    /// serving states.
    async fn promote(&self) {
        // The handoff frame and the liveness check can both trigger this;
        // only the first takeover counts.
        if self.promoted.lock().await.is_some() {
            return;
        }

        let (last_state, player_id) = {
            let mut state = self.state.lock().await;
            state.role = NodeRole::Master;
            state.master_id = state.player_id;
            state.deputy_id = None;
            (state.last_state.clone(), state.player_id)
        };

        let Some(last_state) = last_state else {
            error!("no state snapshot to take the game over from; stopping");
            let _ = self.shutdown.send(true);
            return;
        };

        let server = Server::from_state(
            &self.game_name,
            self.config.clone(),
            &last_state,
            player_id,
            Arc::clone(&self.socket),
            Arc::clone(&self.game),
        )
        .await;
        server.start();
        info!("promoted to master for {:?}", self.game_name);

        *self.promoted.lock().await = Some(server);
        let _ = self.shutdown.send(true);
    }

    async fn reconnect_to_deputy(&self) {
        let ping = {
            let mut state = self.state.lock().await;
            let deputy_addr = state.deputy_id.and_then(|deputy| {
                state
                    .last_state
                    .as_ref()
                    .and_then(|s| s.players.iter().find(|p| p.id == deputy))
                    .and_then(|p| p.addr())
            });

            let Some(addr) = deputy_addr else {
                error!("master lost and no deputy known; stopping");
                let _ = self.shutdown.send(true);
                return;
            };

            info!("master lost, re-registering with deputy at {}", addr);
            state.master_id = state.deputy_id.take().unwrap_or(state.master_id);
            state.master_addr = addr;
            // Grace period so the liveness check does not fire again before
            // the deputy had a chance to answer.
            state.last_master_activity = Instant::now();

            let seq = state.next_seq();
            (
                GameMessage::addressed(seq, state.player_id, state.master_id, MessageBody::Ping),
                addr,
            )
        };
        self.send_message(&ping.0, ping.1).await;
    }

    async fn send_ping(&self) {
        let (frame, addr) = {
            let mut state = self.state.lock().await;
            let seq = state.next_seq();
            (
                GameMessage::new(seq, MessageBody::Ping),
                state.master_addr,
            )
        };
        self.send_message(&frame, addr).await;
    }

    async fn send_message(&self, message: &GameMessage, addr: SocketAddr) {
        match encode_message(message) {
            Ok(data) => {
                if let Err(e) = self.socket.send_to(&data, addr).await {
                    warn!("failed to send to {}: {}", addr, e);
                }
            }
            Err(e) => warn!("dropping unencodable frame for {}: {}", addr, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Coord, SnakeState, SnakeWire};

    async fn test_inner(role: NodeRole) -> Arc<ClientInner> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let master_addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let config = GameConfig {
            width: 10,
            height: 10,
            food_static: 1,
            state_delay_ms: 100,
        };
        let (shutdown, _) = watch::channel(false);
        Arc::new(ClientInner {
            game_name: "arena".to_string(),
            config: config.clone(),
            socket,
            game: Arc::new(Mutex::new(Game::new(config))),
            state: Mutex::new(ClientState {
                player_id: 2,
                master_id: 0,
                master_addr,
                deputy_id: None,
                role,
                msg_seq: 1,
                last_state: None,
                last_state_order: 0,
                last_master_activity: Instant::now(),
            }),
            promoted: Mutex::new(None),
            shutdown,
        })
    }

    fn snapshot(state_order: i32) -> GameStateMsg {
        GameStateMsg {
            state_order,
            players: vec![
                GamePlayer {
                    id: 0,
                    name: "host".into(),
                    ip_address: "127.0.0.1".into(),
                    port: 9000,
                    role: NodeRole::Master,
                    player_type: PlayerType::Human,
                    score: 0,
                },
                GamePlayer {
                    id: 1,
                    name: "warm".into(),
                    ip_address: "127.0.0.1".into(),
                    port: 9001,
                    role: NodeRole::Deputy,
                    player_type: PlayerType::Human,
                    score: 0,
                },
                GamePlayer {
                    id: 2,
                    name: "me".into(),
                    ip_address: "127.0.0.1".into(),
                    port: 9002,
                    role: NodeRole::Normal,
                    player_type: PlayerType::Human,
                    score: 4,
                },
            ],
            snakes: vec![SnakeWire {
                player_id: 2,
                points: vec![Coord::new(5, 5), Coord::new(-1, 0)],
                state: SnakeState::Alive,
                head_direction: Direction::Right,
            }],
            foods: vec![Coord::new(8, 8)],
        }
    }

    #[tokio::test]
    async fn fresh_states_are_applied_and_deputy_tracked() {
        let inner = test_inner(NodeRole::Normal).await;

        inner.handle_state(10, snapshot(3)).await;

        let state = inner.state.lock().await;
        assert_eq!(state.last_state_order, 3);
        assert_eq!(state.deputy_id, Some(1));
        assert!(state.last_state.is_some());
        drop(state);

        let game = inner.game.lock().await;
        assert_eq!(game.field().foods(), &[Coord::new(8, 8)]);
        let snake = game.field().snake_by_id(2).unwrap();
        assert_eq!(snake.score(), 4);
    }

    #[tokio::test]
    async fn stale_states_are_discarded() {
        let inner = test_inner(NodeRole::Normal).await;

        inner.handle_state(10, snapshot(5)).await;
        // A replay of the same order and an older one must both be ignored.
        let mut replay = snapshot(5);
        replay.foods = vec![Coord::new(0, 0)];
        inner.handle_state(11, replay).await;
        inner.handle_state(12, snapshot(4)).await;

        let state = inner.state.lock().await;
        assert_eq!(state.last_state_order, 5);
        drop(state);

        let game = inner.game.lock().await;
        assert_eq!(game.field().foods(), &[Coord::new(8, 8)]);
    }

    #[tokio::test]
    async fn role_change_to_deputy_marks_self() {
        let inner = test_inner(NodeRole::Normal).await;
        inner.handle_role_change(NodeRole::Deputy).await;

        let state = inner.state.lock().await;
        assert_eq!(state.role, NodeRole::Deputy);
        assert_eq!(state.deputy_id, Some(2));
    }

    #[tokio::test]
    async fn promotion_reuses_socket_and_game() {
        let inner = test_inner(NodeRole::Deputy).await;
        inner.handle_state(10, snapshot(7)).await;

        inner.promote().await;

        let state = inner.state.lock().await;
        assert_eq!(state.role, NodeRole::Master);
        assert_eq!(state.master_id, 2);
        drop(state);

        let promoted = inner.promoted.lock().await;
        let server = promoted.as_ref().expect("server started");
        assert_eq!(server.master_id(), 2);
        let players = server.players().await;
        // Exactly one master: this node. The dead master is demoted.
        assert_eq!(
            players
                .iter()
                .filter(|p| p.role == NodeRole::Master)
                .count(),
            1
        );
        assert!(players.iter().any(|p| p.id == 2 && p.role == NodeRole::Master));
        // The replica tasks were told to stop.
        assert!(*inner.shutdown.subscribe().borrow());
    }

    #[tokio::test]
    async fn master_loss_without_deputy_stops_the_node() {
        let inner = test_inner(NodeRole::Normal).await;
        // No last_state, hence no deputy to fall back on.
        inner.handle_master_loss().await;
        assert!(*inner.shutdown.subscribe().borrow());
    }

    #[tokio::test]
    async fn states_received_after_promotion_are_ignored() {
        let inner = test_inner(NodeRole::Deputy).await;
        inner.handle_state(10, snapshot(7)).await;
        inner.promote().await;

        let mut late = snapshot(8);
        late.foods = vec![Coord::new(1, 1)];
        inner.handle_state(11, late).await;

        let game = inner.game.lock().await;
        assert_ne!(game.field().foods(), &[Coord::new(1, 1)]);
    }
}
