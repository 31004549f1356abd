//! The authoritative node: hosts the game, advertises it, accepts joins,
//! runs the tick, and tracks peer liveness.

use crate::discovery::multicast_target;
use game::Game;
use log::{debug, error, info, warn};
use shared::{
    decode_message, encode_message, Direction, GameAnnouncement, GameConfig, GameMessage,
    GamePlayer, GameStateMsg, MessageBody, NodeRole, PlayerType, ANNOUNCEMENT_DELAY_MS,
    MAX_DATAGRAM, MAX_PLAYERS,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::time::interval;

/// Roster and sequencing state, guarded by the server lock.
///
/// Lock ordering: this lock is always taken before the game lock; code paths
/// needing only one never touch the other.
struct Roster {
    players: Vec<GamePlayer>,
    last_ping: HashMap<i32, Instant>,
    /// Timed-out players whose roster entry is kept alive by their zombie
    /// snake; no longer pinged, never eligible for the deputy seat.
    logged_out: HashSet<i32>,
    deputy_id: Option<i32>,
    msg_seq: i64,
    state_order: i32,
    next_player_id: i32,
}

impl Roster {
    fn next_seq(&mut self) -> i64 {
        self.msg_seq += 1;
        self.msg_seq
    }

    fn next_state_order(&mut self) -> i32 {
        self.state_order += 1;
        self.state_order
    }

    fn add_player(
        &mut self,
        name: String,
        addr: SocketAddr,
        role: NodeRole,
        player_type: PlayerType,
    ) -> i32 {
        let player_id = self.next_player_id;
        self.next_player_id += 1;

        self.players.push(GamePlayer {
            id: player_id,
            name,
            ip_address: addr.ip().to_string(),
            port: addr.port() as i32,
            role,
            player_type,
            score: 0,
        });
        self.last_ping.insert(player_id, Instant::now());
        player_id
    }

    fn remove_player(&mut self, player_id: i32) {
        self.players.retain(|p| p.id != player_id);
        self.last_ping.remove(&player_id);
        self.logged_out.remove(&player_id);
        if self.deputy_id == Some(player_id) {
            self.deputy_id = None;
        }
    }

    fn player_mut(&mut self, player_id: i32) -> Option<&mut GamePlayer> {
        self.players.iter_mut().find(|p| p.id == player_id)
    }

    fn id_by_addr(&self, addr: SocketAddr) -> Option<i32> {
        self.players
            .iter()
            .find(|p| p.addr() == Some(addr))
            .map(|p| p.id)
    }

    fn addr_of(&self, player_id: i32) -> Option<SocketAddr> {
        self.players
            .iter()
            .find(|p| p.id == player_id)
            .and_then(|p| p.addr())
    }

    /// The player that should be deputy: smallest id that is neither a
    /// viewer nor the master, and still connected.
    fn eligible_deputy(&self) -> Option<i32> {
        self.players
            .iter()
            .filter(|p| p.role != NodeRole::Viewer && p.role != NodeRole::Master)
            .filter(|p| !self.logged_out.contains(&p.id))
            .map(|p| p.id)
            .min()
    }
}

struct ServerInner {
    game_name: String,
    master_id: i32,
    config: GameConfig,
    socket: Arc<UdpSocket>,
    game: Arc<Mutex<Game>>,
    roster: Mutex<Roster>,
}

/// The master side of one game session.
///
/// Runs four cooperating tasks: the announcement emitter, the datagram
/// listener, the game loop, and the liveness checker. All of them stop when
/// the shutdown signal fires or the `Server` is dropped.
pub struct Server {
    inner: Arc<ServerInner>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Creates a fresh session: binds a socket, spawns the host's snake, and
    /// seats the host as player 0 with the MASTER role.
    pub async fn bind(
        game_name: &str,
        host_name: &str,
        config: GameConfig,
        bind_addr: &str,
    ) -> Result<Server, Box<dyn std::error::Error>> {
        if !config.is_valid() {
            return Err(format!(
                "invalid game config: {}x{} field, {} ms delay",
                config.width, config.height, config.state_delay_ms
            )
            .into());
        }

        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;
        info!("server for {:?} listening on {}", game_name, local_addr);

        let mut game = Game::new(config.clone());
        game.add_snake(0)?;

        let mut roster = Roster {
            players: Vec::new(),
            last_ping: HashMap::new(),
            logged_out: HashSet::new(),
            deputy_id: None,
            msg_seq: 0,
            state_order: 0,
            next_player_id: 0,
        };
        roster.add_player(
            host_name.to_string(),
            local_addr,
            NodeRole::Master,
            PlayerType::Human,
        );

        let (shutdown, _) = watch::channel(false);
        Ok(Server {
            inner: Arc::new(ServerInner {
                game_name: game_name.to_string(),
                master_id: 0,
                config,
                socket,
                game: Arc::new(Mutex::new(game)),
                roster: Mutex::new(roster),
            }),
            shutdown,
        })
    }

    /// Rebuilds a session from the last snapshot a replica trusted — the
    /// deputy-promotion path. The promoting player keeps its id and socket
    /// and becomes MASTER in the roster; the dead master is demoted and
    /// logged out, its entry kept alive by its zombie snake; the deputy
    /// seat is left empty for the next election. Peers keep their liveness
    /// grace stamped from now.
    pub async fn from_state(
        game_name: &str,
        config: GameConfig,
        state: &GameStateMsg,
        own_id: i32,
        socket: Arc<UdpSocket>,
        game: Arc<Mutex<Game>>,
    ) -> Server {
        let mut players: Vec<GamePlayer> = state.players.clone();

        let mut last_ping = HashMap::new();
        let mut logged_out = HashSet::new();
        let now = Instant::now();
        for player in &mut players {
            if player.id == own_id {
                player.role = NodeRole::Master;
            } else if player.role == NodeRole::Master {
                player.role = NodeRole::Normal;
                logged_out.insert(player.id);
            } else {
                last_ping.insert(player.id, now);
            }
        }

        let next_player_id = players.iter().map(|p| p.id).max().unwrap_or(own_id) + 1;

        {
            let mut game = game.lock().await;
            game.field_mut().apply_state(state);
            // Snakes of the dead master and of anyone missing from the
            // roster keep crawling as zombies.
            let ownerless: Vec<i32> = game
                .field()
                .snakes()
                .iter()
                .map(|s| s.player_id())
                .filter(|id| {
                    logged_out.contains(id) || !players.iter().any(|p| p.id == *id)
                })
                .collect();
            for id in ownerless {
                game.zombify(id);
            }
        }

        let (shutdown, _) = watch::channel(false);
        Server {
            inner: Arc::new(ServerInner {
                game_name: game_name.to_string(),
                master_id: own_id,
                config,
                socket,
                game,
                roster: Mutex::new(Roster {
                    players,
                    last_ping,
                    logged_out,
                    deputy_id: None,
                    msg_seq: 0,
                    state_order: state.state_order,
                    next_player_id,
                }),
            }),
            shutdown,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    pub fn game(&self) -> Arc<Mutex<Game>> {
        Arc::clone(&self.inner.game)
    }

    pub fn game_name(&self) -> &str {
        &self.inner.game_name
    }

    pub fn config(&self) -> &GameConfig {
        &self.inner.config
    }

    pub fn master_id(&self) -> i32 {
        self.inner.master_id
    }

    pub async fn players(&self) -> Vec<GamePlayer> {
        self.inner.roster.lock().await.players.clone()
    }

    /// Steers the master's own snake, bypassing the wire.
    pub async fn steer_local(&self, direction: Direction) {
        let mut game = self.inner.game.lock().await;
        game.steer(self.inner.master_id, direction);
    }

    /// Launches the four server tasks.
    pub fn start(&self) {
        self.spawn_announcer();
        self.spawn_listener();
        self.spawn_game_loop();
        self.spawn_liveness_checker();
        info!("server tasks for {:?} started", self.inner.game_name);
    }

    /// Hands the session to the deputy (if any) and stops every task.
    pub async fn stop(&self) {
        info!("server for {:?} stopping", self.inner.game_name);

        let handoff = {
            let mut roster = self.inner.roster.lock().await;
            roster.deputy_id.and_then(|deputy| {
                roster.addr_of(deputy).map(|addr| {
                    (
                        GameMessage::addressed(
                            roster.next_seq(),
                            self.inner.master_id,
                            deputy,
                            MessageBody::RoleChange {
                                sender_role: NodeRole::Master,
                                receiver_role: NodeRole::Master,
                            },
                        ),
                        addr,
                    )
                })
            })
        };
        if let Some((message, addr)) = handoff {
            info!("handing game over to deputy at {}", addr);
            self.inner.send_message(&message, addr).await;
        }

        let _ = self.shutdown.send(true);
    }

    fn spawn_announcer(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(ANNOUNCEMENT_DELAY_MS));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => inner.announce().await,
                }
            }
        });
    }

    fn spawn_listener(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = inner.socket.recv_from(&mut buffer) => match received {
                        Ok((len, src)) => match decode_message(&buffer[..len]) {
                            Ok(message) => inner.handle_message(message, src).await,
                            Err(e) => warn!("undecodable frame from {}: {}", src, e),
                        },
                        Err(e) => {
                            error!("server receive error: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    },
                }
            }
        });
    }

    fn spawn_game_loop(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.shutdown.subscribe();
        let period = self.inner.config.game_delay();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => inner.run_tick().await,
                }
            }
        });
    }

    fn spawn_liveness_checker(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.shutdown.subscribe();
        let period = self.inner.config.ping_delay();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => inner.check_liveness().await,
                }
            }
        });
    }
}

impl ServerInner {
    async fn handle_message(&self, message: GameMessage, src: SocketAddr) {
        match message.body {
            MessageBody::Join {
                player_type,
                player_name,
                game_name,
                requested_role,
            } => {
                self.handle_join(
                    message.msg_seq,
                    player_type,
                    player_name,
                    game_name,
                    requested_role,
                    src,
                )
                .await
            }
            MessageBody::Ping => self.handle_ping(src).await,
            MessageBody::Steer { direction } => self.handle_steer(direction, src).await,
            MessageBody::RoleChange { sender_role, .. } => {
                self.handle_role_change(message.msg_seq, message.sender_id, sender_role, src)
                    .await
            }
            MessageBody::Ack => {}
            MessageBody::Error { message } => error!("error frame from {}: {}", src, message),
            MessageBody::State { .. } | MessageBody::Announcement { .. } => {
                debug!("ignoring replica-bound frame from {}", src)
            }
        }
    }

    async fn handle_join(
        &self,
        join_seq: i64,
        player_type: PlayerType,
        player_name: String,
        game_name: String,
        requested_role: NodeRole,
        src: SocketAddr,
    ) {
        info!("join request from {} for {:?}", src, game_name);

        if game_name != self.game_name {
            let seq = self.roster.lock().await.next_seq();
            self.send_error("unknown game name", seq, src).await;
            return;
        }

        // Joins may only ask for NORMAL or VIEWER; anything else is treated
        // as NORMAL.
        let role = match requested_role {
            NodeRole::Viewer => NodeRole::Viewer,
            NodeRole::Normal => NodeRole::Normal,
            other => {
                warn!("join from {} requested role {:?}", src, other);
                NodeRole::Normal
            }
        };

        let player_id = {
            let mut roster = self.roster.lock().await;
            if roster.players.len() > MAX_PLAYERS {
                let seq = roster.next_seq();
                drop(roster);
                warn!("rejecting join from {}: roster is full", src);
                self.send_error("max players count reached", seq, src).await;
                return;
            }
            roster.add_player(player_name.clone(), src, role, player_type)
        };

        if role != NodeRole::Viewer {
            let spawned = {
                let mut game = self.game.lock().await;
                game.add_snake(player_id)
            };
            if let Err(e) = spawned {
                let seq = {
                    let mut roster = self.roster.lock().await;
                    roster.remove_player(player_id);
                    roster.next_seq()
                };
                warn!("failed to seat player {:?}: {}", player_name, e);
                self.send_error("no space for snake", seq, src).await;
                return;
            }
        }

        let ack = GameMessage::addressed(join_seq, self.master_id, player_id, MessageBody::Ack);
        self.send_message(&ack, src).await;
        info!("player {:?} joined as id {} ({:?})", player_name, player_id, role);
    }

    async fn handle_ping(&self, src: SocketAddr) {
        let mut roster = self.roster.lock().await;
        if let Some(player_id) = roster.id_by_addr(src) {
            roster.last_ping.insert(player_id, Instant::now());
        }
    }

    async fn handle_steer(&self, direction: Direction, src: SocketAddr) {
        let player_id = {
            let mut roster = self.roster.lock().await;
            let Some(player_id) = roster.id_by_addr(src) else {
                debug!("steer from unknown peer {}", src);
                return;
            };
            roster.last_ping.insert(player_id, Instant::now());
            player_id
        };

        let mut game = self.game.lock().await;
        game.steer(player_id, direction);
    }

    /// A peer announcing itself VIEWER is quitting the match but may keep
    /// watching: the role flips, its snake is removed with the usual food
    /// conversion, and the deputy seat is re-elected if it held it.
    async fn handle_role_change(
        &self,
        msg_seq: i64,
        sender_id: Option<i32>,
        sender_role: NodeRole,
        src: SocketAddr,
    ) {
        let player_id = {
            let mut roster = self.roster.lock().await;
            let resolved = sender_id.or_else(|| roster.id_by_addr(src));
            let Some(player_id) = resolved else {
                debug!("role change from unknown peer {}", src);
                return;
            };

            if sender_role == NodeRole::Viewer {
                if let Some(player) = roster.player_mut(player_id) {
                    player.role = NodeRole::Viewer;
                    info!("player {} became a viewer", player_id);
                }
                if roster.deputy_id == Some(player_id) {
                    roster.deputy_id = None;
                }
            } else {
                debug!("unexpected role change ({:?}) from {}", sender_role, src);
            }
            player_id
        };

        if sender_role == NodeRole::Viewer {
            let mut game = self.game.lock().await;
            game.remove_snake(player_id);
        }

        let ack = GameMessage::addressed(msg_seq, self.master_id, player_id, MessageBody::Ack);
        self.send_message(&ack, src).await;
    }

    async fn announce(&self) {
        let message = {
            let mut roster = self.roster.lock().await;
            let announcement = GameAnnouncement {
                game_name: self.game_name.clone(),
                config: self.config.clone(),
                players: roster.players.clone(),
                can_join: roster.players.len() <= MAX_PLAYERS,
            };
            GameMessage::new(
                roster.next_seq(),
                MessageBody::Announcement {
                    games: vec![announcement],
                },
            )
        };

        self.send_message(&message, multicast_target()).await;
        debug!("announced {:?}", self.game_name);
    }

    /// One pass of the game loop: advance the board, refresh scores, elect
    /// the deputy, and unicast the snapshot to every peer.
    async fn run_tick(&self) {
        {
            let mut game = self.game.lock().await;
            game.tick();
        }

        let mut elected: Option<(GameMessage, SocketAddr)> = None;
        let (frame, targets) = {
            let mut roster = self.roster.lock().await;
            let game = self.game.lock().await;

            for player in &mut roster.players {
                if let Some(score) = game.score_of(player.id) {
                    player.score = score;
                }
            }

            let eligible = roster.eligible_deputy();
            if eligible != roster.deputy_id {
                if let Some(deputy) = eligible {
                    roster.deputy_id = Some(deputy);
                    for player in &mut roster.players {
                        if player.role == NodeRole::Deputy {
                            player.role = NodeRole::Normal;
                        }
                    }
                    if let Some(player) = roster.player_mut(deputy) {
                        player.role = NodeRole::Deputy;
                    }
                    info!("new deputy: player {}", deputy);
                    if let Some(addr) = roster.addr_of(deputy) {
                        elected = Some((
                            GameMessage::addressed(
                                roster.next_seq(),
                                self.master_id,
                                deputy,
                                MessageBody::RoleChange {
                                    sender_role: NodeRole::Master,
                                    receiver_role: NodeRole::Deputy,
                                },
                            ),
                            addr,
                        ));
                    }
                } else {
                    roster.deputy_id = None;
                }
            }

            let field = game.field();
            let state = GameStateMsg {
                state_order: roster.next_state_order(),
                players: roster.players.clone(),
                snakes: field
                    .snakes()
                    .iter()
                    .map(|s| s.to_wire(field.width(), field.height()))
                    .collect(),
                foods: field.foods().to_vec(),
            };

            let frame = GameMessage::new(
                roster.next_seq(),
                MessageBody::State { state },
            );
            let targets: Vec<SocketAddr> = roster
                .players
                .iter()
                .filter(|p| p.id != self.master_id)
                .filter(|p| !roster.logged_out.contains(&p.id))
                .filter_map(|p| p.addr())
                .collect();
            (frame, targets)
        };

        match encode_message(&frame) {
            Ok(data) => {
                for addr in targets {
                    if let Err(e) = self.socket.send_to(&data, addr).await {
                        warn!("failed to send state to {}: {}", addr, e);
                    }
                }
            }
            Err(e) => warn!("state frame dropped: {}", e),
        }

        if let Some((message, addr)) = elected {
            self.send_message(&message, addr).await;
        }
    }

    /// Pings every connected peer, then handles the silent ones by role.
    /// A timed-out player without a snake loses its roster seat outright;
    /// one with a snake is logged out but keeps its entry while the snake
    /// crawls on as a zombie, and the entry follows the snake off the
    /// roster once it dies.
    async fn check_liveness(&self) {
        let wait_delay = self.config.wait_delay();
        let (ping, targets) = {
            let mut roster = self.roster.lock().await;
            let now = Instant::now();

            let stale: Vec<i32> = roster
                .players
                .iter()
                .filter(|p| p.id != self.master_id)
                .filter(|p| !roster.logged_out.contains(&p.id))
                .filter(|p| {
                    roster
                        .last_ping
                        .get(&p.id)
                        .map_or(true, |seen| now.duration_since(*seen) > wait_delay)
                })
                .map(|p| p.id)
                .collect();

            {
                let mut game = self.game.lock().await;
                for player_id in stale {
                    if game.field().snake_by_id(player_id).is_some() {
                        // Mid-game disconnect must not vanish the body: the
                        // entry stays while the snake crawls on as a zombie.
                        info!("player {} timed out, logging out (snake kept)", player_id);
                        game.zombify(player_id);
                        roster.logged_out.insert(player_id);
                        roster.last_ping.remove(&player_id);
                        if roster.deputy_id == Some(player_id) {
                            roster.deputy_id = None;
                        }
                        if let Some(player) = roster.player_mut(player_id) {
                            if player.role == NodeRole::Deputy {
                                player.role = NodeRole::Normal;
                            }
                        }
                    } else {
                        info!("player {} timed out, removing", player_id);
                        roster.remove_player(player_id);
                    }
                }

                // A logged-out entry is retired once its zombie is gone.
                let finished: Vec<i32> = roster
                    .logged_out
                    .iter()
                    .copied()
                    .filter(|id| game.field().snake_by_id(*id).is_none())
                    .collect();
                for player_id in finished {
                    debug!("zombie of player {} died, retiring its entry", player_id);
                    roster.remove_player(player_id);
                }
            }

            let ping = GameMessage::new(roster.next_seq(), MessageBody::Ping);
            let targets: Vec<SocketAddr> = roster
                .players
                .iter()
                .filter(|p| p.id != self.master_id)
                .filter(|p| !roster.logged_out.contains(&p.id))
                .filter_map(|p| p.addr())
                .collect();
            (ping, targets)
        };

        for addr in targets {
            self.send_message(&ping, addr).await;
        }
    }

    /// Serializes and sends one frame; failures are logged, never fatal.
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

    async fn send_error(&self, text: &str, msg_seq: i64, addr: SocketAddr) {
        let message = GameMessage::new(
            msg_seq,
            MessageBody::Error {
                message: text.to_string(),
            },
        );
        self.send_message(&message, addr).await;
    }
}
