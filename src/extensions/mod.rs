//! Bundled extensions.

pub mod duplicate;
pub mod imap4flags;
pub mod relational;
pub mod vacation;
