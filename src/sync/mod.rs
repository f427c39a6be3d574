//! Synchronisation with the remote authority.
//!
//! [`transport`] defines the wire contract, [`authority`] is an in-memory
//! authority that also serves that contract over HTTP, and [`engine`] drives
//! a replica through pull, merge and push cycles against any transport.

pub mod authority;
pub mod engine;
pub mod transport;

pub use authority::{MemoryAuthority, router};
pub use engine::{CycleReport, EngineConfig, SyncEngine, SyncEngineBuilder, SyncPhase, SyncStatus};
pub use transport::{
	ChangeBatch,
	HttpTransport,
	OfflineTransport,
	OutgoingChange,
	PushOutcome,
	SyncTransport,
};
