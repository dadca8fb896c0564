//! # avctl
//!
//! **avctl** supervises an Avorion dedicated server: it launches the game as
//! a child process, parses its output into a typed event stream, issues
//! remote-console commands, mirrors game state into an embedded database,
//! and bridges the result to a chat bot.
//!
//! ## Components
//!
//! | Area               | Description                                                    | Key types                        |
//! |--------------------|----------------------------------------------------------------|----------------------------------|
//! | **Lifecycle**      | Start, stop, restart, hang detection, crash recovery.          | [`Server`], [`RunState`]         |
//! | **Events**         | Regex registry over output lines with pluggable handlers.      | [`EventRegistry`], [`EventHandler`] |
//! | **RCON**           | Serialized remote command gateway, the only mutator path.      | [`RconGateway`]                  |
//! | **Game state**     | Players, alliances, sectors, bounded jump histories.           | [`GameState`], [`Player`]        |
//! | **Persistence**    | Sqlite mirror that round-trips sectors across restarts.        | [`TrackingDb`]                   |
//! | **Bot bridge**     | Bounded chat/log conduits with drop-on-timeout.                | [`BotBridge`]                    |
//! | **Errors**         | Typed errors per concern.                                      | [`ServerError`], [`RconError`]   |
//! | **Configuration**  | Toml-backed settings, reloadable at runtime.                   | [`Config`]                       |
//!
//! The binary entry point wires these together, handles process signals, and
//! owns the exit token every long-running task selects on.

pub mod bridge;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod handlers;
pub mod rcon;
pub mod server;
pub mod state;
pub mod store;
mod supervise;

// ---- Public re-exports ----

pub use bridge::{BotBridge, BridgeReceivers, ChatMessage};
pub use config::Config;
pub use db::TrackingDb;
pub use error::{ConfigError, DbError, EventError, RconError, ServerError, StoreError};
pub use events::{EventDescriptor, EventHandler, EventRegistry, EVENT_NONE};
pub use rcon::RconGateway;
pub use server::{Server, ServerStatus};
pub use state::{RunState, Status};
pub use store::{Alliance, GameState, JumpInfo, JumpRecord, Player, Sector};
