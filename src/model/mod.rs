//! Domain model shared by the store, outbox, resolver and transports.

mod clock;
mod record;

pub use clock::{Clock, LogicalClock, ManualClock, SystemClock};
pub use record::{ActorId, Delta, FieldStamp, Record, RecordId, RecordKind};
