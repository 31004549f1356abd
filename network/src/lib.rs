//! # Arena Networking Library
//!
//! The replication and role-management half of the snake arena: the
//! authoritative [`server::Server`], the replica [`client::Client`], the
//! multicast [`discovery`] machinery, and the [`handle`] boundary a front
//! end drives everything through.
//!
//! ## Node anatomy
//!
//! Every node owns one unconnected UDP socket for peer traffic and joins a
//! shared multicast group for discovery. A hosting node runs four long-lived
//! tasks (announcer, listener, game loop, liveness checker); a joined node
//! runs three (ping sender, listener, master-liveness checker). All tasks
//! stop through one watch-channel shutdown signal per node.
//!
//! ## Failover
//!
//! The master broadcasts a deputy hint inside every state snapshot. When the
//! master goes silent, the deputy rebuilds a server from the last snapshot
//! on its existing socket, and every other peer re-registers with it — the
//! session continues with a short replay window instead of dying with its
//! host.

pub mod client;
pub mod discovery;
pub mod handle;
pub mod server;
