//! `rollcall` - Consistency and delivery core for a school-attendance tracker
//!
//! This library provides the three components that keep attendance data
//! consistent across unreliable connectivity: single-use invitation codes
//! for linking guardians to subjects, offline-first attendance recording
//! with deferred reconciliation, and push notification dispatch.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod invitation;
pub mod logging;
pub mod model;
pub mod notify;
pub mod platform;
pub mod store;
pub mod sync;
pub mod tasks;
pub mod token;

pub use config::Config;
pub use error::{Error, Result};
pub use invitation::InvitationCodeRegistry;
pub use logging::init_logging;
pub use model::{AttendanceRecord, AttendanceStatus, Guardian, InvitationCode, Recorder, Subject};
pub use notify::PushNotificationDispatcher;
pub use store::{DocumentStore, MemoryStore};
pub use sync::{AttendanceItem, OfflineAttendanceSyncEngine, SyncReport, TaskOutcome};
pub use tasks::TaskGroup;
pub use token::AccessTokenProvider;
