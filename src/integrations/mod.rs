//! External sources that feed events into the router.

pub mod email;
pub mod email_sync;

pub use email::{EmailConfig, FetchedMail, ImapMailSource, MailSource, ReceivedEmail};
pub use email_sync::{EmailSync, EmailTasks};
