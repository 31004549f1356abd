//! Headless arena node: host a game, join one by address, or discover and
//! join the first advertised game.

use clap::Parser;
use log::{error, info};
use network::discovery::{self, DiscoveryCache};
use network::handle::{self, GameHandle};
use shared::{GameConfig, NodeRole};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host a new game instead of joining one
    #[arg(short, long)]
    create: bool,

    /// Join the game at this address, skipping discovery
    #[arg(short, long)]
    join: Option<SocketAddr>,

    /// Game name to host or to look for during discovery
    #[arg(short = 'n', long, default_value = "snake-arena")]
    name: String,

    /// Player name
    #[arg(short, long, default_value = "player")]
    player: String,

    /// Join as a viewer without a snake
    #[arg(long)]
    viewer: bool,

    #[arg(long, default_value_t = 40)]
    width: i32,

    #[arg(long, default_value_t = 30)]
    height: i32,

    #[arg(long, default_value_t = 1)]
    food_static: i32,

    /// Tick period of the game loop in milliseconds
    #[arg(long, default_value_t = 200)]
    state_delay: i32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = GameConfig {
        width: args.width,
        height: args.height,
        food_static: args.food_static,
        state_delay_ms: args.state_delay,
    };
    let role = if args.viewer {
        NodeRole::Viewer
    } else {
        NodeRole::Normal
    };

    let handle = if args.create {
        info!("hosting {:?} on a {}x{} field", args.name, config.width, config.height);
        handle::create_game(config, &args.name, &args.player).await?
    } else if let Some(addr) = args.join {
        info!("joining game at {}", addr);
        handle::join_game_at(addr, &args.name, &args.player, role, config).await?
    } else {
        join_via_discovery(&args.player, role).await?
    };

    info!(
        "node up as player {} on {}",
        handle.own_id(),
        handle.local_addr()?
    );

    let mut status = interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                handle.quit();
                // Let the farewell frame leave the socket.
                sleep(Duration::from_millis(200)).await;
                break;
            }
            _ = status.tick() => {
                let snapshot = handle.game_snapshot().await;
                info!(
                    "{} players, {} snakes, {} food, score {}",
                    snapshot.players.len(),
                    snapshot.snakes.len(),
                    snapshot.foods.len(),
                    handle.player_score().await
                );
            }
        }
    }

    Ok(())
}

/// Listens on the multicast group and joins the first game that shows up.
async fn join_via_discovery(
    player: &str,
    role: NodeRole,
) -> Result<GameHandle, Box<dyn std::error::Error>> {
    info!("discovering games on the multicast group...");

    let cache = DiscoveryCache::new();
    let (stop_tx, stop_rx) = watch::channel(false);
    discovery::spawn_listener(cache.clone(), stop_rx)?;

    // Announcements come once a second; two TTL windows is plenty of
    // patience.
    for _ in 0..10 {
        sleep(Duration::from_millis(1000)).await;
        let games = handle::discover_games(&cache).await;
        if let Some(announcement) = games.first() {
            info!(
                "found {:?} at {} ({} players)",
                announcement.game.game_name,
                announcement.server_addr,
                announcement.game.players.len()
            );
            let joined = handle::join_game(announcement, player, role).await;
            let _ = stop_tx.send(true);
            return joined;
        }
    }

    let _ = stop_tx.send(true);
    error!("no games discovered");
    Err("no games discovered on the multicast group".into())
}
