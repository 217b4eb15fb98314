//! The RFC 5228 command, test, and action set.

use crate::{command::CommandDef, op::Operation};

pub mod action;
pub mod control;

/// Stable core opcodes.
pub mod opcode {
    pub const FALSE: u8 = 0x00;
    pub const TRUE: u8 = 0x01;
    pub const NOT: u8 = 0x02;
    pub const JMP: u8 = 0x03;
    pub const JMPTRUE: u8 = 0x04;
    pub const JMPFALSE: u8 = 0x05;
    pub const EXISTS: u8 = 0x06;
    pub const HEADER: u8 = 0x07;
    pub const ADDRESS: u8 = 0x08;
    pub const ENVELOPE: u8 = 0x09;
    pub const SIZE_OVER: u8 = 0x0a;
    pub const SIZE_UNDER: u8 = 0x0b;
    pub const KEEP: u8 = 0x0c;
    pub const DISCARD: u8 = 0x0d;
    pub const FILEINTO: u8 = 0x0e;
    pub const REDIRECT: u8 = 0x0f;
    pub const STOP: u8 = 0x10;
}

/// Core operations, indexed by opcode.
pub(crate) static CORE_OPS: [&dyn Operation; 17] = [
    &test::FALSE_OP,
    &test::TRUE_OP,
    &test::NOT_OP,
    &control::JMP_OP,
    &control::JMPTRUE_OP,
    &control::JMPFALSE_OP,
    &test::EXISTS_OP,
    &test::HEADER_OP,
    &test::ADDRESS_OP,
    &test::ENVELOPE_OP,
    &test::SIZE_OVER_OP,
    &test::SIZE_UNDER_OP,
    &action::KEEP_OP,
    &action::DISCARD_OP,
    &action::FILEINTO_OP,
    &action::REDIRECT_OP,
    &control::STOP_OP,
];

/// Core commands and tests, registered with every validator.
pub(crate) static COMMANDS: &[&dyn CommandDef] = &[
    &control::REQUIRE,
    &control::IF,
    &control::ELSIF,
    &control::ELSE,
    &control::STOP,
    &action::KEEP,
    &action::DISCARD,
    &action::FILEINTO,
    &action::REDIRECT,
    &test::TRUE,
    &test::FALSE,
    &test::NOT,
    &test::ANYOF,
    &test::ALLOF,
    &test::EXISTS,
    &test::HEADER,
    &test::ADDRESS,
    &test::ENVELOPE,
    &test::SIZE,
];
