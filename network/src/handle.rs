//! The boundary the UI talks to: discover, create, join, steer, quit, and
//! read-only snapshots. Front ends never touch sockets or locks directly —
//! intents flow through a channel and snapshots are copies.

use crate::client::Client;
use crate::discovery::{Announcement, DiscoveryCache};
use crate::server::Server;
use game::{Game, Snake};
use log::warn;
use shared::{Coord, Direction, GameConfig, GamePlayer, NodeRole};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Read-only copy of the board and roster for rendering.
#[derive(Debug, Clone)]
pub struct GameSnapshot {
    pub config: GameConfig,
    pub players: Vec<GamePlayer>,
    pub snakes: Vec<Snake>,
    pub foods: Vec<Coord>,
}

enum Intent {
    Steer(Direction),
    Quit,
}

enum Node {
    Host(Server),
    Peer(Client),
}

/// A running node, as seen by the UI.
///
/// Dropping the handle does not stop the node; send [`GameHandle::quit`] for
/// an orderly exit.
pub struct GameHandle {
    node: Arc<Node>,
    game: Arc<Mutex<Game>>,
    intents: mpsc::UnboundedSender<Intent>,
    own_id: i32,
}

/// Snapshot of the currently discovered games.
pub async fn discover_games(cache: &DiscoveryCache) -> Vec<Announcement> {
    cache.games().await
}

/// Hosts a new game and returns the handle driving it.
pub async fn create_game(
    config: GameConfig,
    game_name: &str,
    player_name: &str,
) -> Result<GameHandle, Box<dyn std::error::Error>> {
    let server = Server::bind(game_name, player_name, config, "0.0.0.0:0").await?;
    server.start();

    let game = server.game();
    let own_id = server.master_id();
    Ok(GameHandle::wrap(Node::Host(server), game, own_id))
}

/// Joins a discovered game.
pub async fn join_game(
    announcement: &Announcement,
    player_name: &str,
    role: NodeRole,
) -> Result<GameHandle, Box<dyn std::error::Error>> {
    join_game_at(
        announcement.server_addr,
        &announcement.game.game_name,
        player_name,
        role,
        announcement.game.config.clone(),
    )
    .await
}

/// Joins a game at a known address, bypassing discovery.
pub async fn join_game_at(
    server_addr: SocketAddr,
    game_name: &str,
    player_name: &str,
    role: NodeRole,
    config: GameConfig,
) -> Result<GameHandle, Box<dyn std::error::Error>> {
    let client = Client::join(server_addr, game_name, player_name, role, config).await?;
    let game = client.game();
    let own_id = client.player_id().await;
    Ok(GameHandle::wrap(Node::Peer(client), game, own_id))
}

impl GameHandle {
    fn wrap(node: Node, game: Arc<Mutex<Game>>, own_id: i32) -> GameHandle {
        let node = Arc::new(node);
        let (intents, mut intent_rx) = mpsc::unbounded_channel();

        let glue_node = Arc::clone(&node);
        tokio::spawn(async move {
            while let Some(intent) = intent_rx.recv().await {
                match intent {
                    Intent::Steer(direction) => match &*glue_node {
                        Node::Host(server) => server.steer_local(direction).await,
                        Node::Peer(client) => client.steer(direction).await,
                    },
                    Intent::Quit => {
                        match &*glue_node {
                            Node::Host(server) => server.stop().await,
                            Node::Peer(client) => client.stop().await,
                        }
                        break;
                    }
                }
            }
        });

        GameHandle {
            node,
            game,
            intents,
            own_id,
        }
    }

    pub fn own_id(&self) -> i32 {
        self.own_id
    }

    /// Address of the node's peer socket (the game port when hosting).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match &*self.node {
            Node::Host(server) => server.local_addr(),
            Node::Peer(client) => client.local_addr(),
        }
    }

    /// Queues a steering intent for this node's snake.
    pub fn steer(&self, direction: Direction) {
        if self.intents.send(Intent::Steer(direction)).is_err() {
            warn!("steer after the node stopped");
        }
    }

    /// Requests an orderly shutdown of the node.
    pub fn quit(&self) {
        let _ = self.intents.send(Intent::Quit);
    }

    /// Copies the current board and roster for rendering.
    pub async fn game_snapshot(&self) -> GameSnapshot {
        let players = match &*self.node {
            Node::Host(server) => server.players().await,
            Node::Peer(client) => client.players().await,
        };
        let game = self.game.lock().await;
        let field = game.field();
        GameSnapshot {
            config: field.config().clone(),
            players,
            snakes: field.snakes().to_vec(),
            foods: field.foods().to_vec(),
        }
    }

    /// This player's current score.
    pub async fn player_score(&self) -> i32 {
        match &*self.node {
            Node::Host(server) => {
                let game = self.game.lock().await;
                game.score_of(server.master_id()).unwrap_or(0)
            }
            Node::Peer(client) => client.score().await,
        }
    }
}
