//! Inbound mail routing pipeline.
//!
//! Every webhook call flows through:
//! 1. `SignatureValidator::verify()`, before this module is reached
//! 2. `Resolver::resolve()`, which decides every destination up front
//! 3. `Dispatcher::submit()`, after the webhook is acknowledged
//!
//! **No job is produced with an unwrapped sender.** A sender that cannot be
//! wrapped aborts the whole request.

pub mod headers;
pub mod resolver;
pub mod types;

pub use resolver::Resolver;
pub use types::{Attachment, AttachmentBody, InboundMail, SendJob};
