//! Voice call bridging state machine and the signed bridge token that
//! protects the outbound bridge step.

pub mod controller;
pub mod token;

pub use controller::{StartCallError, VoiceCallController};
pub use token::{BridgeClaims, TokenSigner};
