/// Provider webhook intake: signature checks and event routing
pub mod dispatcher;
pub mod signature;

pub use dispatcher::{WebhookDispatcher, WebhookOutcome};
pub use signature::{verify_signature, SIGNATURE_HEADER};
