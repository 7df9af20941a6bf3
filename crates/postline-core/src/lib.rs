//! Core domain types for the Postline mail-provider integration.
//!
//! Provides strongly-typed identifiers, the internal mail-piece lifecycle,
//! the provider status translator, the clock abstraction used for
//! deterministic timing, and the persistence trait consumed by webhook
//! ingestion. Every other crate in the workspace builds on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod status;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    ExternalId, MailPiece, MetricsSnapshot, NewStatusTransition, StatusHistoryRecord,
};
pub use storage::{PostgresStatusStore, StatusStore};
pub use status::{MailStatus, StatusTranslator};
pub use time::{Clock, RealClock, TestClock};
