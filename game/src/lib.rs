//! # Field Simulation Library
//!
//! Deterministic-enough simulation of the snake arena: the toroidal field,
//! the snakes living on it, and the single authoritative tick that advances
//! them. This crate owns no sockets and no locks — the networking layer wraps
//! a [`Game`] in a mutex and feeds it steers and join requests, while
//! replicas overwrite their passive copy from received snapshots.

use thiserror::Error;

pub mod field;
pub mod game;
pub mod snake;

pub use field::Field;
pub use game::Game;
pub use snake::{MoveOutcome, Snake};

/// Failures the simulation can report to the node hosting it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GameError {
    /// The spawn search exhausted its attempts without a free clearing.
    #[error("no space for snake")]
    NoSpace,
}
