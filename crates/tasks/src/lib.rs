//! Task tracking for MangaForge generation jobs.
//!
//! Combines the push channel from `mangaforge-realtime` with a polling
//! safety net into one observable [`store::TaskStore`]:
//!
//! - [`coordinator`] submits batches and cancels tasks through the
//!   [`api::GenerationApi`] collaborator.
//! - [`handlers`] feeds `generation:*` push events into the store.
//! - [`reconciler`] polls active tasks on a fixed interval.
//! - [`monitor`] composes all of the above from a [`config::MonitorConfig`].
//!
//! Every write path carries a source timestamp, and the store applies the
//! same last-writer-wins rule to all of them.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod handlers;
pub mod monitor;
pub mod reconciler;
pub mod store;

pub use api::{ApiError, BatchRequest, GenerationApi, HttpGenerationApi};
pub use config::{ConfigError, MonitorConfig};
pub use coordinator::{BatchCoordinator, SubmitError};
pub use monitor::TaskMonitor;
pub use reconciler::{PollConfig, PollReport, StatusReconciler};
pub use store::{TaskSnapshot, TaskStore, UpdateOutcome};
