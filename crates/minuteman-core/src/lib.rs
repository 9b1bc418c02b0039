//! `minuteman-core`: job option types, configuration loading and the core error type.

pub mod config;
pub mod error;
pub mod types;

pub use config::MinutemanConfig;
pub use error::{CoreError, Result};
pub use types::{JobConfig, JobOptions, MailSettings, MailerKind, SmtpSecurity, Work};
