//! Shared domain types for the MangaForge task status subsystem.
//!
//! Holds the generation [`task::Task`] model together with the merge rule
//! that both push events and status polls go through, the push-channel
//! event name constants, and the crate-wide [`error::CoreError`].

pub mod error;
pub mod events;
pub mod task;
pub mod types;
