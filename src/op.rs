//! Operations and their dispatch.
//!
//! An [`Operation`] is one VM instruction. Core operations live in a fixed
//! table with stable codes; extension operations are resolved through the
//! binary's extension index, rebuilt against the current registry when an
//! interpreter is constructed. A binary whose index names an unknown
//! extension is refused before any opcode runs.

use std::fmt::Write as _;

use crate::{
    binary::{Binary, ReadError, Reader},
    error::RuntimeError,
    interp::Interpreter,
    matching::{AddressPart, Comparator, MatchType},
    registry::{Extension, Registry},
};

/// What the instruction asks of the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    /// Halt the run; the result is committed as-is.
    Stop,
}

/// One VM instruction.
pub trait Operation: Sync {
    /// Mnemonic, as shown by the disassembler.
    fn name(&self) -> &'static str;

    fn execute(&self, interp: &mut Interpreter) -> Result<Outcome, RuntimeError>;

    /// Append the operand section to a disassembly line, consuming exactly
    /// the bytes `execute` would.
    fn dump(
        &self,
        reader: &mut Reader,
        dispatch: &Dispatch,
        out: &mut String,
    ) -> Result<(), ReadError>;
}

impl std::fmt::Debug for dyn Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Operation({})", self.name())
    }
}

/// The binary's extension index resolved against a registry.
#[derive(Debug)]
pub struct Dispatch {
    extensions: Vec<&'static dyn Extension>,
}

impl Dispatch {
    pub fn resolve(binary: &Binary, registry: &Registry) -> Result<Self, RuntimeError> {
        let extensions = binary
            .extensions()
            .iter()
            .map(|name| {
                registry
                    .lookup(name)
                    .ok_or_else(|| RuntimeError::UnknownExtension(name.clone()))
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { extensions })
    }

    pub(crate) fn extensions(&self) -> &[&'static dyn Extension] {
        &self.extensions
    }

    /// Read and resolve the operation at the cursor.
    pub fn operation(&self, reader: &mut Reader) -> Result<&'static dyn Operation, ReadError> {
        let at = reader.pos();
        let byte = reader.read_u8()?;

        if byte < 0x80 {
            return crate::core::CORE_OPS
                .get(usize::from(byte))
                .copied()
                .ok_or(ReadError::UnknownOpcode { at, opcode: byte });
        }

        let index = byte & 0x7f;
        let extension = self
            .extensions
            .get(usize::from(index))
            .ok_or(ReadError::UnknownExtensionIndex { at, index })?;

        let code = reader.read_u8()?;
        extension
            .operations()
            .get(usize::from(code))
            .copied()
            .ok_or(ReadError::UnknownOpcode { at, opcode: code })
    }

    fn extension_at(&self, at: usize, owner: u32) -> Result<&'static dyn Extension, ReadError> {
        self.extensions
            .get(owner as usize - 1)
            .copied()
            .ok_or(ReadError::UnknownExtensionIndex {
                at,
                index: (owner - 1).min(0xff) as u8,
            })
    }

    pub fn comparator(
        &self,
        at: usize,
        owner: u32,
        code: u64,
    ) -> Result<&'static dyn Comparator, ReadError> {
        let table: &[&'static dyn Comparator] = if owner == 0 {
            &crate::matching::CORE_COMPARATORS
        } else {
            self.extension_at(at, owner)?.comparators()
        };
        table
            .get(code as usize)
            .copied()
            .ok_or(ReadError::UnknownObject { at, owner, code })
    }

    pub fn match_type(
        &self,
        at: usize,
        owner: u32,
        code: u64,
    ) -> Result<&'static dyn MatchType, ReadError> {
        let table: &[&'static dyn MatchType] = if owner == 0 {
            &crate::matching::CORE_MATCH_TYPES
        } else {
            self.extension_at(at, owner)?.match_types()
        };
        table
            .get(code as usize)
            .copied()
            .ok_or(ReadError::UnknownObject { at, owner, code })
    }

    pub fn address_part(
        &self,
        at: usize,
        owner: u32,
        code: u64,
    ) -> Result<&'static dyn AddressPart, ReadError> {
        let table: &[&'static dyn AddressPart] = if owner == 0 {
            &crate::matching::address::CORE_ADDRESS_PARTS
        } else {
            self.extension_at(at, owner)?.address_parts()
        };
        table
            .get(code as usize)
            .copied()
            .ok_or(ReadError::UnknownObject { at, owner, code })
    }
}

// ----- disassembly helpers -----

pub(crate) fn dump_uint(reader: &mut Reader, out: &mut String) -> Result<u64, ReadError> {
    let value = reader.read_uint()?;
    write!(out, " {value}").expect("write to string");
    Ok(value)
}

pub(crate) fn dump_string(reader: &mut Reader, out: &mut String) -> Result<(), ReadError> {
    let value = reader.read_string()?;
    write!(out, " \"{value}\"").expect("write to string");
    Ok(())
}

pub(crate) fn dump_string_list(reader: &mut Reader, out: &mut String) -> Result<(), ReadError> {
    let values = reader.read_string_list()?;
    out.push_str(" [");
    for (index, value) in values.iter().enumerate() {
        if index > 0 {
            out.push_str(", ");
        }
        write!(out, "\"{value}\"").expect("write to string");
    }
    out.push(']');
    Ok(())
}

/// Print the offset and the address it targets.
pub(crate) fn dump_offset(reader: &mut Reader, out: &mut String) -> Result<(), ReadError> {
    let offset = reader.read_offset()?;
    let target = reader.pos() as i64 + i64::from(offset);
    write!(out, " +{offset} [{target:04x}]").expect("write to string");
    Ok(())
}

/// Print the optional-operand block of a test that links match tags.
pub(crate) fn dump_match_operands(
    reader: &mut Reader,
    dispatch: &Dispatch,
    out: &mut String,
) -> Result<(), ReadError> {
    loop {
        let at = reader.pos();
        let code = reader.read_u8()?;
        match code {
            0 => return Ok(()),
            crate::matching::OPT_COMPARATOR => {
                let (owner, object) = reader.read_object()?;
                let comparator = dispatch.comparator(at, owner, object)?;
                write!(out, " :comparator \"{}\"", comparator.name()).expect("write to string");
            }
            crate::matching::OPT_MATCH_TYPE => {
                let (owner, object) = reader.read_object()?;
                let match_type = dispatch.match_type(at, owner, object)?;
                write!(out, " :{}", match_type.name()).expect("write to string");
            }
            crate::matching::OPT_ADDRESS_PART => {
                let (owner, object) = reader.read_object()?;
                let part = dispatch.address_part(at, owner, object)?;
                write!(out, " :{}", part.name()).expect("write to string");
            }
            code => return Err(ReadError::UnknownOptional { at, code }),
        }
    }
}
