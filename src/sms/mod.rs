//! Inbound SMS state machine, short-code engagement flows, staff outbound
//! send, and the SLA escalation sweep.

pub mod engagement;
pub mod escalation;
pub mod inbound;
pub mod keywords;
pub mod outbound;

pub use inbound::{InboundMessageRouter, InboundSms};
pub use keywords::Keyword;
pub use outbound::{SendError, send_message};
