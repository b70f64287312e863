//! Notification gating and dispatch.
//!
//! [`gatekeeper`] decides which channels an event may use given quiet hours,
//! urgency, and per-category preferences; [`dispatcher`] creates the in-app
//! record (always) and fans out to SMS when the gatekeeper allows it.

pub mod dispatcher;
pub mod gatekeeper;

pub use dispatcher::{DispatchOutcome, NotificationDispatcher};
pub use gatekeeper::{ChannelDecision, DecisionContext, decide_channels, decide_channels_with};
