//! Integration tests for the arena's networked components.
//!
//! These tests exercise cross-crate interactions over real loopback sockets:
//! the join handshake, state replication, steering, quit handling, deputy
//! election, and the master handoff.

use network::client::Client;
use network::discovery::DiscoveryCache;
use network::server::Server;
use shared::{
    decode_message, encode_message, Coord, Direction, GameAnnouncement, GameConfig, GameMessage,
    MessageBody, NodeRole, ANNOUNCEMENT_WAIT_MS,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::sleep;

fn test_config() -> GameConfig {
    GameConfig {
        width: 20,
        height: 20,
        food_static: 1,
        state_delay_ms: 200,
    }
}

async fn start_server(config: GameConfig) -> (Server, SocketAddr) {
    let server = Server::bind("arena", "host", config, "127.0.0.1:0")
        .await
        .expect("server binds on loopback");
    server.start();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

/// NETWORK PROTOCOL TESTS
mod protocol_tests {
    use super::*;

    /// One encoded frame per datagram survives a real socket hop.
    #[tokio::test]
    async fn frame_survives_a_udp_hop() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();

        let message = GameMessage::addressed(
            42,
            1,
            0,
            MessageBody::Steer {
                direction: Direction::Up,
            },
        );
        sender
            .send_to(&encode_message(&message).unwrap(), target)
            .await
            .unwrap();

        let mut buffer = [0u8; 4096];
        let (len, _) = receiver.recv_from(&mut buffer).await.unwrap();
        assert_eq!(decode_message(&buffer[..len]).unwrap(), message);
    }
}

/// DISCOVERY TESTS
mod discovery_tests {
    use super::*;

    /// An announcement that stops refreshing is evicted after its TTL.
    #[tokio::test]
    async fn silent_game_disappears_from_the_cache() {
        let cache = DiscoveryCache::new();
        let server_addr: SocketAddr = "127.0.0.1:9100".parse().unwrap();
        let t0 = Instant::now();

        cache
            .upsert_at(
                GameAnnouncement {
                    game_name: "arena".into(),
                    config: test_config(),
                    players: vec![],
                    can_join: true,
                },
                server_addr,
                t0,
            )
            .await;

        assert_eq!(cache.games_at(t0 + Duration::from_secs(4)).await.len(), 1);
        let past_ttl = t0 + Duration::from_millis(ANNOUNCEMENT_WAIT_MS + 200);
        assert!(cache.games_at(past_ttl).await.is_empty());
    }
}

/// SESSION TESTS
mod session_tests {
    use super::*;

    /// A join is acked, a snake is spawned, and states start flowing.
    #[tokio::test]
    async fn join_spawns_a_snake_and_replicates_state() {
        let (server, addr) = start_server(test_config()).await;

        let client = Client::join(addr, "arena", "alice", NodeRole::Normal, test_config())
            .await
            .expect("join succeeds");

        let mut replicated = false;
        for _ in 0..50 {
            sleep(Duration::from_millis(100)).await;
            if client.last_state_order().await > 0 {
                replicated = true;
                break;
            }
        }
        assert!(replicated, "no state snapshot arrived");

        let players = server.players().await;
        assert_eq!(players.len(), 2);
        let client_player_id = client.player_id().await;
        assert!(players.iter().any(|p| p.id == client_player_id));

        let game = client.game();
        let game = game.lock().await;
        assert!(!game.field().snakes().is_empty());
        assert!(!game.field().foods().is_empty());
        drop(game);

        client.stop().await;
        server.stop().await;
    }

    /// A join for a game this master does not host is refused.
    #[tokio::test]
    async fn join_for_an_unknown_game_is_refused() {
        let (server, addr) = start_server(test_config()).await;

        let result =
            Client::join(addr, "not-this-one", "bob", NodeRole::Normal, test_config()).await;
        let err = result.err().expect("join must fail").to_string();
        assert!(err.contains("join refused"), "unexpected error: {}", err);

        server.stop().await;
    }

    /// A join is rolled back when the board has no room for a snake.
    #[tokio::test]
    async fn join_without_space_is_rolled_back() {
        let config = GameConfig {
            width: 6,
            height: 6,
            ..test_config()
        };
        let (server, addr) = start_server(config.clone()).await;

        // Pave every free cell so the spawn search cannot find a clearing.
        {
            let game = server.game();
            let mut game = game.lock().await;
            for x in 0..6 {
                for y in 0..6 {
                    let cell = Coord::new(x, y);
                    if !game.field().is_cell_occupied(cell) {
                        game.field_mut().add_food(cell);
                    }
                }
            }
        }

        let result = Client::join(addr, "arena", "bob", NodeRole::Normal, config).await;
        let err = result.err().expect("join must fail").to_string();
        assert!(err.contains("no space"), "unexpected error: {}", err);

        // The half-joined player was removed again.
        assert_eq!(server.players().await.len(), 1);

        server.stop().await;
    }

    /// A steer sent over the wire turns the snake on the master's board.
    #[tokio::test]
    async fn steer_reaches_the_authoritative_snake() {
        let (server, addr) = start_server(test_config()).await;
        let client = Client::join(addr, "arena", "alice", NodeRole::Normal, test_config())
            .await
            .unwrap();
        let player_id = client.player_id().await;

        // Clear the host's snake so nothing can collide with the steered one
        // while the test polls.
        {
            let game = server.game();
            let mut game = game.lock().await;
            game.remove_snake(0);
        }

        let current = {
            let game = server.game();
            let game = game.lock().await;
            game.field().snake_by_id(player_id).unwrap().head_direction()
        };
        let turn = match current {
            Direction::Up | Direction::Down => Direction::Left,
            Direction::Left | Direction::Right => Direction::Up,
        };
        client.steer(turn).await;

        let mut turned = false;
        for _ in 0..30 {
            sleep(Duration::from_millis(100)).await;
            let game = server.game();
            let game = game.lock().await;
            match game.field().snake_by_id(player_id) {
                Some(snake) if snake.head_direction() == turn => {
                    turned = true;
                    break;
                }
                Some(_) => {}
                None => break,
            }
        }
        assert!(turned, "steer never reached the master");

        client.stop().await;
        server.stop().await;
    }

    /// A quitting player becomes a viewer and its snake leaves the board.
    #[tokio::test]
    async fn quitting_demotes_to_viewer() {
        // A slow tick keeps the liveness sweep from reaping the silent
        // viewer before the test observes the role flip.
        let config = GameConfig {
            state_delay_ms: 1000,
            ..test_config()
        };
        let (server, addr) = start_server(config.clone()).await;
        let client = Client::join(addr, "arena", "alice", NodeRole::Normal, config)
            .await
            .unwrap();
        let player_id = client.player_id().await;

        client.stop().await;

        let mut demoted = false;
        for _ in 0..30 {
            sleep(Duration::from_millis(100)).await;
            let players = server.players().await;
            let viewer = players
                .iter()
                .any(|p| p.id == player_id && p.role == NodeRole::Viewer);
            let snake_gone = {
                let game = server.game();
                let game = game.lock().await;
                game.field().snake_by_id(player_id).is_none()
            };
            if viewer && snake_gone {
                demoted = true;
                break;
            }
        }
        assert!(demoted, "quit did not demote the player to viewer");

        server.stop().await;
    }
}

/// FAILOVER TESTS
mod failover_tests {
    use super::*;

    /// The lowest-id non-viewer peer is elected deputy and learns about it.
    #[tokio::test]
    async fn lowest_id_peer_becomes_deputy() {
        let (server, addr) = start_server(test_config()).await;
        let first = Client::join(addr, "arena", "alice", NodeRole::Normal, test_config())
            .await
            .unwrap();
        let second = Client::join(addr, "arena", "bob", NodeRole::Normal, test_config())
            .await
            .unwrap();

        let mut elected = false;
        for _ in 0..50 {
            sleep(Duration::from_millis(100)).await;
            let players = server.players().await;
            let deputies: Vec<_> = players
                .iter()
                .filter(|p| p.role == NodeRole::Deputy)
                .collect();
            if deputies.len() == 1
                && deputies[0].id == first.player_id().await
                && first.role().await == NodeRole::Deputy
            {
                elected = true;
                break;
            }
        }
        assert!(elected, "deputy election did not settle on the lowest id");
        assert_eq!(second.role().await, NodeRole::Normal);

        first.stop().await;
        second.stop().await;
        server.stop().await;
    }

    /// When the master stops, the deputy takes over and the other peer
    /// follows it: the session keeps producing fresher states.
    #[tokio::test]
    async fn deputy_takes_over_when_the_master_stops() {
        let (server, addr) = start_server(test_config()).await;
        let deputy = Client::join(addr, "arena", "alice", NodeRole::Normal, test_config())
            .await
            .unwrap();
        let peer = Client::join(addr, "arena", "bob", NodeRole::Normal, test_config())
            .await
            .unwrap();
        let deputy_id = deputy.player_id().await;

        // Let the election settle and both peers see a state carrying the
        // deputy hint.
        let mut ready = false;
        for _ in 0..50 {
            sleep(Duration::from_millis(100)).await;
            if deputy.role().await == NodeRole::Deputy && peer.last_state_order().await > 0 {
                ready = true;
                break;
            }
        }
        assert!(ready, "session never settled before the handoff");
        let order_before = peer.last_state_order().await;

        // The master leaves; its stop() hands the game to the deputy.
        server.stop().await;

        let mut promoted = false;
        for _ in 0..50 {
            sleep(Duration::from_millis(100)).await;
            if deputy.role().await == NodeRole::Master {
                promoted = true;
                break;
            }
        }
        assert!(promoted, "deputy never became master");

        // The remaining peer re-registers with the new master and keeps
        // receiving states with increasing order.
        let mut followed = false;
        for _ in 0..80 {
            sleep(Duration::from_millis(100)).await;
            let players = peer.players().await;
            let masters: Vec<_> = players
                .iter()
                .filter(|p| p.role == NodeRole::Master)
                .collect();
            if masters.len() == 1
                && masters[0].id == deputy_id
                && peer.last_state_order().await > order_before
            {
                followed = true;
                break;
            }
        }
        assert!(followed, "peer never followed the promoted deputy");

        peer.stop().await;
        deputy.stop().await;
    }
}
