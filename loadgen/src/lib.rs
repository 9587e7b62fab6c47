//! A load generator that benchmarks PUT and GET throughput against an object store and verifies
//! the integrity of every transferred payload.
//!
//! A run issues a fixed number of requests through a [`RunCoordinator`]. Its
//! [`ConcurrencyPolicy`] decides how many of them are on the wire at once:
//!
//! - *Capacity* releases all requests at once and lets the session's connection limit bound the
//!   sockets in use.
//! - *Grouped* releases requests in consecutive waves and waits for each wave to drain before
//!   starting the next. This trades peak concurrency for bounded burstiness.
//!
//! Requests run either as tokio tasks or on one OS thread each, see [`BackendKind`].
//!
//! Every response is checked against the MD5 checksum of its payload, so operators can tell
//! network problems (*transport failures*) apart from data corruption (*integrity failures*).
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod coordinator;
pub mod error;
pub mod executor;
pub mod gate;
pub mod payload;
pub mod report;
pub mod request;
pub mod session;
pub mod signer;
pub mod timer;

pub use crate::coordinator::{RunCoordinator, RunCoordinatorBuilder};
pub use crate::error::{Error, Result};
pub use crate::executor::{Outcome, RequestResult, TransportError};
pub use crate::gate::{ConcurrencyGate, ConcurrencyPolicy};
pub use crate::payload::{Checksum, Payload, PayloadSource};
pub use crate::report::{ReportAggregator, RunReport};
pub use crate::request::{Method, RequestDescriptor};
pub use crate::session::{BackendKind, ClientSession};
pub use crate::signer::{JwtSigner, Signer};
