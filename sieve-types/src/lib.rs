#![deny(missing_debug_implementations)]

//! Data structures for the Sieve mail filtering language ([RFC 5228](https://www.rfc-editor.org/rfc/rfc5228.html)).
//!
//! This crate contains the types shared between the Sieve compiler, the
//! interpreter, and hosts: the abstract syntax tree handed to the validator,
//! and the IMAP flag type used by the `imap4flags` extension.

pub mod ast;
pub mod error;
pub mod flag;
