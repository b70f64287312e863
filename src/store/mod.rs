//! Persistence layer — libsql-backed storage for every durable record.

pub mod calls;
pub mod db;
pub mod directory;
pub mod engagement;
pub mod messages;
pub mod migrations;
pub mod notifications;

pub use calls::{CallLog, CallLogPatch, CallStatus, CallVoicemail, NewCallLog};
pub use db::Store;
pub use directory::{
    Agency, Client, NumberAssignment, NumberRule, PhoneNumber, User, UserCallSettings,
    UserPreferences, RULE_AFTER_HOURS, RULE_EMERGENCY_FORWARD, RULE_FORWARD,
};
pub use engagement::{Campaign, CompanyEvent, RecordedResponse};
pub use messages::{
    DeliveryStatus, Direction, EscalationType, MessageLog, NewMessageLog, OptInSource,
    OptInState, OptInStatus, StaleInboundThread, ThreadEscalation, ThreadMode,
};
pub use notifications::{NewNotification, Notification, NotificationSmsLog};
