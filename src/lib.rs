//! Workspace facade: re-exports the arena crates for consumers and for the
//! integration tests under `tests/`.

pub use game;
pub use network;
pub use shared;
