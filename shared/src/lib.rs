//! # Shared Protocol Library
//!
//! This crate contains the wire protocol spoken by every node in the snake
//! arena: the message envelope, its eight payload kinds, the enums and value
//! types they carry, and the binary codec that turns them into UDP datagrams.
//! It is the foundation both the authoritative server and the replica client
//! build on, and it is deliberately free of any simulation or socket code.
//!
//! ## Protocol model
//!
//! Every datagram carries exactly one [`GameMessage`]: a monotonic per-sender
//! sequence number, optional sender/receiver player ids, and one
//! [`MessageBody`]. Datagram boundaries delimit frames, so no length prefix
//! is needed; a frame may never exceed [`MAX_DATAGRAM`] bytes.
//!
//! The state snapshot ([`GameStateMsg`]) is the unit of replication: the
//! master stamps it with a strictly increasing `state_order` and unicasts it
//! to every player each tick. Snake bodies travel delta-encoded
//! ([`SnakeWire`]) to keep long snakes inside a single datagram.
//!
//! ## Serialization
//!
//! All wire structures derive `Serialize`/`Deserialize` and are encoded with
//! `bincode`. [`encode_message`] and [`decode_message`] wrap the codec with
//! the datagram size guard so callers never put an oversized frame on the
//! network.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

/// IPv4 group every master advertises its game on.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 192, 0, 4);

/// UDP port of the discovery multicast group.
pub const MULTICAST_PORT: u16 = 9192;

/// Cadence of announcement multicasts, in milliseconds.
pub const ANNOUNCEMENT_DELAY_MS: u64 = 1000;

/// A discovered game is forgotten after this long without a refresh.
pub const ANNOUNCEMENT_WAIT_MS: u64 = 5000;

/// Hard cap on the roster size of a single game session.
pub const MAX_PLAYERS: usize = 10;

/// Upper bound on an encoded frame; one frame is one UDP datagram.
pub const MAX_DATAGRAM: usize = 4096;

/// Side of the square that must be free around a spawn candidate.
pub const SPAWN_CLEARANCE: i32 = 5;

/// How many random centers the spawn search tries before giving up.
pub const SPAWN_ATTEMPTS: u32 = 100;

/// Errors produced by the datagram codec.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::Error),
    #[error("encoded message is {0} bytes, exceeding the {MAX_DATAGRAM} byte datagram limit")]
    Oversized(usize),
    #[error("failed to decode datagram: {0}")]
    Decode(bincode::Error),
}

/// One of the four cardinal movement directions.
///
/// The numeric assignment is arbitrary but fixed for the lifetime of a
/// session; both ends of the wire must agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Up = 1,
    Down = 2,
    Left = 3,
    Right = 4,
}

impl Direction {
    /// The direction pointing the opposite way; a snake may never turn into it.
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }

    /// Unit cell offset of one step in this direction.
    ///
    /// The y axis grows downward, matching the field's row order.
    pub fn offset(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }

    /// All four directions, for uniform random facing selection.
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];
}

/// Role of a node within one game session.
///
/// Exactly one MASTER exists at a time; at most one DEPUTY. VIEWER is an
/// absorbing state for peers that only watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Normal,
    Master,
    Deputy,
    Viewer,
}

/// Whether a peer is driven by a human or a bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerType {
    Human,
    Robot,
}

/// Liveness of a snake on the field.
///
/// A `Zombie` snake has lost its owner but keeps crawling in its last
/// direction until it dies through the normal collision paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnakeState {
    Alive,
    Zombie,
}

/// A cell position on the toroidal field.
///
/// Absolute coordinates always satisfy `0 <= x < width`, `0 <= y < height`.
/// Inside a [`SnakeWire`] body, entries after the first are signed deltas and
/// may be negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
}

impl Coord {
    pub fn new(x: i32, y: i32) -> Self {
        Coord { x, y }
    }

    /// Normalizes the coordinate onto a `width` x `height` torus.
    pub fn wrapped(self, width: i32, height: i32) -> Coord {
        Coord {
            x: self.x.rem_euclid(width),
            y: self.y.rem_euclid(height),
        }
    }
}

/// Immutable geometry and timing parameters of one game session.
///
/// Fixed when the game is created; replicas copy it from the announcement
/// they join through and derive their timing knobs from `state_delay_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameConfig {
    pub width: i32,
    pub height: i32,
    /// Food kept on the field in addition to one per living snake.
    pub food_static: i32,
    /// Tick period of the authoritative game loop, in milliseconds.
    pub state_delay_ms: i32,
}

impl GameConfig {
    /// True when the field is large enough to host the spawn clearance square.
    pub fn is_valid(&self) -> bool {
        self.width > SPAWN_CLEARANCE && self.height > SPAWN_CLEARANCE && self.state_delay_ms > 0
    }

    /// Period of the authoritative tick.
    pub fn game_delay(&self) -> Duration {
        Duration::from_millis(self.state_delay_ms as u64)
    }

    /// Cadence of keep-alive pings, a tenth of the tick period.
    pub fn ping_delay(&self) -> Duration {
        Duration::from_millis((self.state_delay_ms as f64 * 0.1) as u64)
    }

    /// Silence threshold after which a peer counts as gone.
    pub fn wait_delay(&self) -> Duration {
        Duration::from_millis((self.state_delay_ms as f64 * 0.8) as u64)
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        GameConfig {
            width: 40,
            height: 30,
            food_static: 1,
            state_delay_ms: 200,
        }
    }
}

/// One roster entry, replicated to every peer in each state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GamePlayer {
    pub id: i32,
    pub name: String,
    pub ip_address: String,
    pub port: i32,
    pub role: NodeRole,
    pub player_type: PlayerType,
    pub score: i32,
}

impl GamePlayer {
    /// Socket address of the peer, if the roster entry carries a usable one.
    pub fn addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.ip_address.parse().ok()?;
        u16::try_from(self.port)
            .ok()
            .map(|port| SocketAddr::new(ip, port))
    }
}

/// Delta-encoded snake body as it travels on the wire.
///
/// `points[0]` is the absolute head cell. Every later entry is a run of unit
/// steps along one axis: exactly one of its components is non-zero and its
/// magnitude is the run length. Deltas take the short way around the torus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnakeWire {
    pub player_id: i32,
    pub points: Vec<Coord>,
    pub state: SnakeState,
    pub head_direction: Direction,
}

/// Full replicated snapshot broadcast by the master each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameStateMsg {
    /// Strictly increasing per session; replicas discard stale snapshots.
    pub state_order: i32,
    pub players: Vec<GamePlayer>,
    pub snakes: Vec<SnakeWire>,
    pub foods: Vec<Coord>,
}

/// A joinable game as advertised on the discovery multicast group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameAnnouncement {
    pub game_name: String,
    pub config: GameConfig,
    pub players: Vec<GamePlayer>,
    pub can_join: bool,
}

/// Payload of a [`GameMessage`]; exactly one kind per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Keep-alive; carries no data beyond the envelope.
    Ping,
    /// A player's steering intent for their snake.
    Steer { direction: Direction },
    /// Acknowledgment; its envelope `msg_seq` echoes the acked message.
    Ack,
    /// Authoritative snapshot from the current master.
    State { state: GameStateMsg },
    /// Multicast advertisement of joinable games.
    Announcement { games: Vec<GameAnnouncement> },
    /// Request to enter a game.
    Join {
        player_type: PlayerType,
        player_name: String,
        game_name: String,
        requested_role: NodeRole,
    },
    /// Human-readable failure surfaced to the requesting peer.
    Error { message: String },
    /// Role transition notice (deputy promotion, quit-to-viewer, handoff).
    RoleChange {
        sender_role: NodeRole,
        receiver_role: NodeRole,
    },
}

/// The envelope every datagram carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameMessage {
    /// Monotonic per sender; used for Ack matching only.
    pub msg_seq: i64,
    pub sender_id: Option<i32>,
    pub receiver_id: Option<i32>,
    pub body: MessageBody,
}

impl GameMessage {
    /// Builds an envelope with no addressing, for broadcast-style payloads.
    pub fn new(msg_seq: i64, body: MessageBody) -> Self {
        GameMessage {
            msg_seq,
            sender_id: None,
            receiver_id: None,
            body,
        }
    }

    /// Builds a fully addressed envelope.
    pub fn addressed(msg_seq: i64, sender_id: i32, receiver_id: i32, body: MessageBody) -> Self {
        GameMessage {
            msg_seq,
            sender_id: Some(sender_id),
            receiver_id: Some(receiver_id),
            body,
        }
    }
}

/// Encodes a message into a single datagram, enforcing the size limit.
pub fn encode_message(message: &GameMessage) -> Result<Vec<u8>, ProtocolError> {
    let data = bincode::serialize(message)?;
    if data.len() > MAX_DATAGRAM {
        return Err(ProtocolError::Oversized(data.len()));
    }
    Ok(data)
}

/// Decodes one received datagram back into a message.
pub fn decode_message(data: &[u8]) -> Result<GameMessage, ProtocolError> {
    bincode::deserialize(data).map_err(ProtocolError::Decode)
}
