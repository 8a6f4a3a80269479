//! Protected Log
//!
//! Tamper-evident logging: per-node hash chains bound by CA signatures,
//! continuous verification, signed export and recovery.

pub mod actions;
pub mod device;
pub mod entry;
pub mod export;
pub mod linker;
pub mod merkle;
pub mod recovery;
pub mod signer;
pub mod verify;

pub use actions::{ActionDispatcher, DispatchContext, FailureCause, ProtectedLogAction, TestAction};
pub use device::ProtectedLog;
pub use entry::{Actor, LogEntry, LogEvent, NodeChainState, Protection, SpecialAdminKind};
pub use export::{open_bundle, ExportReceipt, ExportSlice, LogExporter, SignedEnvelope};
pub use linker::ChainLinker;
pub use recovery::ResetOutcome;
pub use signer::{ChainSigner, SigningSummary};
pub use verify::{Anomaly, VerificationEngine, VerificationReport, VerificationScope};
