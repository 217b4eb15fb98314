//! The extension registry.
//!
//! Extensions contribute commands, tests, tags, operations, and match
//! objects. The registry is append-only process state: it is populated before
//! the first script is compiled or run and treated as quiescent afterwards.
//! Binaries persist extension *names*, never ids, so a registry may order its
//! extensions differently between compile time and run time.

use crate::{
    interp::Interpreter,
    matching::{AddressPart, Comparator, MatchType},
    op::Operation,
    validate::Validator,
};

/// An engine extension.
///
/// All hooks are optional except [`Extension::name`] and
/// [`Extension::validator_load`]. Object slices are indexed by object code,
/// operation slices by extension-local opcode.
pub trait Extension: Sync {
    /// The `require` name of the extension.
    fn name(&self) -> &'static str;

    /// Called when a script requires the extension (or it is implicitly
    /// enabled). Registers the extension's commands, tests, and tags.
    fn validator_load(&'static self, validator: &mut Validator);

    /// Called once per interpreter when the extension appears in the
    /// binary's extension index.
    fn runtime_load(&'static self, interp: &mut Interpreter) {
        let _ = interp;
    }

    fn operations(&self) -> &'static [&'static dyn Operation] {
        &[]
    }

    fn comparators(&self) -> &'static [&'static dyn Comparator] {
        &[]
    }

    fn match_types(&self) -> &'static [&'static dyn MatchType] {
        &[]
    }

    fn address_parts(&self) -> &'static [&'static dyn AddressPart] {
        &[]
    }

    /// Side effects to attach to a delivery action enqueued while this
    /// extension is loaded.
    fn side_effects(&self, interp: &Interpreter) -> Vec<Box<dyn crate::result::SideEffect>> {
        let _ = interp;
        Vec::new()
    }
}

impl std::fmt::Debug for dyn Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Extension({})", self.name())
    }
}

/// Capabilities provided by the engine itself rather than by an extension.
///
/// `require`-ing one of these enables a gated core command instead of
/// loading an extension.
const CORE_CAPABILITIES: &[&str] = &[
    "fileinto",
    "envelope",
    "encoded-character",
    "comparator-i;octet",
    "comparator-i;ascii-casemap",
];

/// The set of registered extensions.
#[derive(Debug, Default)]
pub struct Registry {
    extensions: Vec<&'static dyn Extension>,
    implicit: Vec<String>,
}

impl Registry {
    /// An empty registry. Core commands are always available; only
    /// extensions need registration.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the bundled extensions.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(&crate::extensions::imap4flags::IMAP4FLAGS);
        registry.register(&crate::extensions::vacation::VACATION);
        registry.register(&crate::extensions::duplicate::DUPLICATE);
        registry.register(&crate::extensions::relational::RELATIONAL);
        registry
    }

    pub fn register(&mut self, extension: &'static dyn Extension) {
        debug_assert!(self.lookup(extension.name()).is_none());
        self.extensions.push(extension);
    }

    pub fn lookup(&self, name: &str) -> Option<&'static dyn Extension> {
        self.extensions
            .iter()
            .copied()
            .find(|extension| extension.name() == name)
    }

    pub fn extensions(&self) -> &[&'static dyn Extension] {
        &self.extensions
    }

    /// Enable extensions for every script without a `require`, the way
    /// administrator-forced extensions behave in deployed installations.
    pub fn set_implicit<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.implicit = names.into_iter().map(Into::into).collect();
    }

    pub fn implicit(&self) -> &[String] {
        &self.implicit
    }

    /// Whether `name` is a capability of the core engine.
    pub fn is_core_capability(name: &str) -> bool {
        CORE_CAPABILITIES.contains(&name)
    }
}
