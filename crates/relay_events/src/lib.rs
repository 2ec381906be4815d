//! Event relay core: decode JSON-RPC traffic from agent workers, derive a
//! small vocabulary of semantic events from it, pace those events for
//! downstream consumers, and fold them into per-run health state.
//!
//! ```
//! use relay_events::{decode, DerivationEngine, EventKind};
//!
//! let messages = decode(r#"{"jsonrpc":"2.0","method":"turn/started","params":{"threadId":"t1"}}"#)
//!     .expect("valid payload");
//! let derived = DerivationEngine::default().derive(&messages[0], 0);
//! assert_eq!(derived[0].kind, EventKind::StepStarted);
//! ```

mod decode;
mod derive;
mod derived;
mod diff;
mod error;
pub mod extract;
mod pacing;
mod run_state;
mod vocab;

pub use decode::{
    classify, classify_with, decode, method_not_supported_reply, MessageKind, Payload,
    JSONRPC_VERSION, METHOD_NOT_SUPPORTED_CODE, METHOD_NOT_SUPPORTED_MESSAGE,
};
pub use derive::{DerivationEngine, DeriveConfig, DEFAULT_NOISE_METHODS};
pub use derived::{assess_attention, AttentionCode, AttentionSeverity, DerivedEvent, EventKind};
pub use diff::{DiffFile, DiffSnapshot, DIFF_RAW_TYPE};
pub use error::{DecodeFailure, DecodeReason};
pub use pacing::{Emission, Pacer, PacingConfig, PacingState};
pub use run_state::{
    BlockerClass, OperationalStatus, RunExport, RunState, RunStatus, RunStore, RunThresholds,
    SignatureHit,
};
