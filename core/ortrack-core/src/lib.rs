//! # ortrack-core
//!
//! Reconciles RFID tag reads taken in an operating room against what a
//! procedure requires, before the operation (verification) and after it
//! (outbound check).
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. Scans block for their window; callers
//!   wanting concurrency run sessions on their own threads.
//! - **Pure reconcilers**: `verification::verify`, `outbound::check_outbound`
//!   and the formatter take values and return values. Only the engine talks to
//!   collaborators.
//! - **Collaborators behind traits**: `Scanner`, `Catalog`, `SessionStore`.
//!   `memory` has in-process implementations; `ortrack-store` persists to SQLite.
//! - **Scan failures never fail a cycle**: they are logged and treated as an
//!   empty room.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ortrack_core::{EngineConfig, TrackingEngine, VerifyOptions};
//!
//! let engine = TrackingEngine::new(catalog, sessions, scanner, EngineConfig::default());
//! let report = engine.verify(session_id, &VerifyOptions::default())?;
//! println!("{}", report.state.as_str());
//! ```

use std::sync::{Mutex, MutexGuard};

pub mod adapters;
pub mod config;
pub mod engine;
pub mod error;
pub mod formatter;
pub mod inventory;
pub mod lifecycle;
pub mod memory;
pub mod outbound;
pub mod requirements;
pub mod resolver;
pub mod scanner;
pub mod types;
pub mod verification;

pub use adapters::{Catalog, ScanError, Scanner, SessionStore};
pub use config::{load_config, EngineConfig, ReaderConfig};
pub use engine::{CancelToken, ContinuousOptions, OutboundOptions, TrackingEngine, VerifyOptions};
pub use error::{ErrorKind, Result, TrackError};
pub use inventory::{InventoryIndex, PresentItems};
pub use requirements::RequirementSpec;
pub use resolver::{resolve, Resolution};
pub use scanner::FileScanner;
pub use types::*;
pub use verification::ReconciliationState;

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
