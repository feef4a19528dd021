//! Beam bridge library — re-exports for integration tests.

pub mod awareness;
pub mod engine;
pub mod protocol;
pub mod session;
pub mod transport;

pub use engine::{DocHandle, DocId, Repo};
pub use protocol::{Command, Event, EventSink};
pub use session::{Connector, SessionActor, SessionConfig};
