//! Pairing and transfer protocol for LanVault.
//!
//! Both halves follow the same pattern: a request is parked in a slot with
//! a one-shot outcome channel, a UI event announces it, and the request
//! waits (without holding any lock) until a human confirms, rejects, or the
//! timeout elapses.
//!
//! - [`pairing`]: one registration may await a decision at a time
//! - [`transfer`]: one pending batch per session; accepted files get
//!   transmission ids and are uploaded into a [`sink::FileSink`]

pub mod events;
pub mod pairing;
pub mod session;
pub mod sink;
pub mod transfer;

pub use events::{ChannelSink, EventSink, NoopSink, ProtocolEvent, TracingSink};
pub use pairing::{
    PairingHandler, PairingState, RegisterRequest, RegisterResponse, REGISTRATION_TIMEOUT,
};
pub use session::{Session, SessionRegistry};
pub use sink::{FileSink, StoredFile, VaultFileSink};
pub use transfer::{
    FileInfo, FileTransmission, PendingBatchInfo, PrepareUploadRequest, PrepareUploadResponse,
    TransferRecord, TransferService, TransferStatus, UploadResponse, PREPARE_TIMEOUT,
};
