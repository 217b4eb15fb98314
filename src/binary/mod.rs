//! The compiled form of a script.
//!
//! A [`Binary`] is an append-only code buffer plus an *extension index*: the
//! ordered list of extension names the code references. Operands refer to
//! extensions through their position in this index, so the format survives
//! re-registration of extensions in a different order; names are re-resolved
//! against the current [`Registry`](crate::registry::Registry) on load.
//!
//! ```text
//! header:  magic "SVBC" | version u16 BE | ext_index_len u16 BE
//! index:   ext_index_len x (packed length | utf-8 name)
//! code:    operation stream
//! ```

use std::{fmt::Write as _, fs, path::Path};

pub use read::{ReadError, Reader};

use crate::{
    error::{LoadError, RuntimeError},
    op::Dispatch,
    registry::Registry,
};

mod read;

const MAGIC: [u8; 4] = *b"SVBC";
const VERSION: u16 = 1;

/// A compiled Sieve script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    code: Vec<u8>,
    extensions: Vec<String>,
}

impl Binary {
    pub(crate) fn new() -> Self {
        Self {
            code: Vec::new(),
            extensions: Vec::new(),
        }
    }

    /// The raw code stream, without the header.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Names of the extensions the code references, in index order.
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Index of `name` in the extension index, assigning the next free slot
    /// on first use. `None` when the index is exhausted.
    pub(crate) fn extension_index(&mut self, name: &str) -> Option<u8> {
        if let Some(found) = self.extensions.iter().position(|have| have == name) {
            return Some(found as u8);
        }

        // Opcodes keep the extension index in the low seven bits.
        if self.extensions.len() >= 0x7f {
            return None;
        }

        self.extensions.push(name.to_owned());
        Some((self.extensions.len() - 1) as u8)
    }

    // ----- emitters -----

    pub(crate) fn emit_u8(&mut self, value: u8) {
        self.code.push(value);
    }

    /// Packed unsigned integer; see [`Reader::read_uint`].
    pub(crate) fn emit_uint(&mut self, value: u64) {
        let mut groups = [0u8; 10];
        let mut count = 0;
        let mut rest = value;

        loop {
            groups[count] = (rest & 0x7f) as u8;
            count += 1;
            rest >>= 7;
            if rest == 0 {
                break;
            }
        }

        for index in (0..count).rev() {
            let continued = if index > 0 { 0x80 } else { 0 };
            self.code.push(groups[index] | continued);
        }
    }

    pub(crate) fn emit_string(&mut self, value: &str) {
        self.emit_uint(value.len() as u64);
        self.code.extend_from_slice(value.as_bytes());
    }

    pub(crate) fn emit_string_list(&mut self, values: &[String]) {
        self.emit_uint(values.len() as u64);
        for value in values {
            self.emit_string(value);
        }
    }

    pub(crate) fn emit_object(&mut self, owner: u32, code: u64) {
        self.emit_uint(u64::from(owner));
        self.emit_uint(code);
    }

    /// Reserve a fixed-width jump offset slot and return its address.
    pub(crate) fn reserve_offset(&mut self) -> usize {
        let slot = self.code.len();
        self.code.extend_from_slice(&[0; 4]);
        slot
    }

    /// Patch a reserved slot with the distance from the byte after the slot
    /// to the current end of code.
    pub(crate) fn patch_offset_to_here(&mut self, slot: usize) {
        let offset = (self.code.len() - (slot + 4)) as i32;
        self.code[slot..slot + 4].copy_from_slice(&offset.to_be_bytes());
    }

    // ----- persistence -----

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.code.len() + 16);

        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&VERSION.to_be_bytes());
        bytes.extend_from_slice(&(self.extensions.len() as u16).to_be_bytes());

        for name in &self.extensions {
            let mut header = Binary::new();
            header.emit_string(name);
            bytes.extend_from_slice(&header.code);
        }

        bytes.extend_from_slice(&self.code);
        bytes
    }

    /// Load a stored binary and re-resolve its extension index.
    ///
    /// Fails with [`LoadError::UnknownExtension`] when the index names an
    /// extension the registry no longer knows.
    pub fn from_bytes(bytes: &[u8], registry: &Registry) -> Result<Self, LoadError> {
        let header = bytes.get(..8).ok_or(LoadError::BadMagic)?;
        if header[..4] != MAGIC {
            return Err(LoadError::BadMagic);
        }

        let version = u16::from_be_bytes([header[4], header[5]]);
        if version != VERSION {
            return Err(LoadError::UnsupportedVersion(version));
        }

        let count = u16::from_be_bytes([header[6], header[7]]);
        let mut reader = Reader::new(&bytes[8..]);

        let mut extensions = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let name = reader.read_string()?;
            if registry.lookup(&name).is_none() {
                return Err(LoadError::UnknownExtension(name));
            }
            extensions.push(name);
        }

        Ok(Self {
            code: bytes[8 + reader.pos()..].to_vec(),
            extensions,
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        fs::write(path, self.to_bytes())
    }

    pub fn load_file(path: impl AsRef<Path>, registry: &Registry) -> Result<Self, LoadError> {
        Self::from_bytes(&fs::read(path)?, registry)
    }

    /// Disassemble the code stream.
    ///
    /// The output is deterministic for a given binary and registry, which the
    /// round-trip tests rely on.
    pub fn dump(&self, registry: &Registry) -> Result<String, RuntimeError> {
        let dispatch = Dispatch::resolve(self, registry)?;
        let mut reader = Reader::new(&self.code);
        let mut out = String::new();

        while !reader.at_end() {
            let pc = reader.pos();
            (|| -> Result<(), ReadError> {
                let op = dispatch.operation(&mut reader)?;
                write!(out, "{pc:04x}: {}", op.name()).expect("write to string");
                op.dump(&mut reader, &dispatch, &mut out)?;
                out.push('\n');
                Ok(())
            })()
            .map_err(|source| RuntimeError::corrupt(pc, source))?;
        }

        Ok(out)
    }
}
