//! `modguard` core: subject and actor ids, operation kinds, remote failure
//! classes, audit records and the wall-clock abstraction.

pub mod audit;
pub mod clock;
pub mod error;
pub mod types;

pub use audit::{AuditOutcome, ModerationAuditEvent};
pub use clock::{ClockSource, ManualClock, SystemClock};
pub use error::{FailureClass, RemoteError};
pub use types::{ActorId, OperationKind, Severity, SubjectId, UnknownOperationKind};
