//! Session & lifecycle management, and the public operation surface.
//!
//! The [`ExposureManager`](manager::ExposureManager) is the core of the
//! system: it owns the session table, runs both bring-up flows, fans all
//! termination causes into one guarded transition, and exposes the
//! operations the adapter calls.

pub mod clock;
pub mod error;
pub mod manager;
pub mod query;
pub mod record;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ExposeError;
pub use manager::{
    ExposeFilesParams, ExposeOpts, ExposePortParams, ExposureManager, SessionHandle, StopParams,
};
pub use query::{GetFilter, GetParams, LogsParams};
pub use record::{
    ExposeKind, LogComponent, LogEntry, Presentation, SessionRecord, SessionStats, SessionStatus,
    ShareMode, StopReason,
};
