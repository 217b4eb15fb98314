//! The result of a run: planned actions and their commit protocol.
//!
//! Actions accumulate while the script runs; composition rules (duplicate
//! coalescing, conflict detection) apply as each action is added, so a
//! conflicting script fails before anything is committed. Commit is
//! two-phase: every action's `start` and `execute` hooks run in insertion
//! order, `finish` hooks run in reverse order with the overall status, and
//! deferred duplicate-store marks are written only when the whole commit
//! succeeded.

use std::any::Any;

use thiserror::Error;

use crate::{
    error::RuntimeError,
    runtime::{ErrorHandler, MessageData, ScriptEnv},
};

/// Lifecycle state of one planned action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Planned,
    Executed,
    Failed,
}

/// Overall status a commit finished with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Ok,
    Failed,
    Aborted,
}

/// Behavior classification of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActionFlags {
    /// Adding the action cancels the implicit keep.
    pub cancels_keep: bool,
    /// The action produces a response message; at most one such action may
    /// be part of a result.
    pub sends_response: bool,
}

/// Verdict of an action's duplicate check against an earlier instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateVerdict {
    /// Both instances stand.
    Distinct,
    /// The new instance has no additional effect and is dropped.
    Coalesce,
    /// The duplication is a script error.
    Reject,
}

/// An error from an action hook.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ActionError {
    pub message: String,
    /// Temporary failures make the host requeue the message.
    pub temporary: bool,
}

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            temporary: false,
        }
    }

    pub fn temporary(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            temporary: true,
        }
    }
}

/// Descriptor of an action kind.
pub trait ActionDef: Sync {
    fn name(&self) -> &'static str;

    fn flags(&self) -> ActionFlags {
        ActionFlags::default()
    }

    /// Compare a new instance against an earlier one of the same kind.
    fn check_duplicate(&self, new: &ActionEntry, old: &ActionEntry) -> DuplicateVerdict {
        let (_, _) = (new, old);
        DuplicateVerdict::Distinct
    }

    /// Whether `new` cannot coexist with `old` (of any kind).
    fn check_conflict(&self, new: &ActionEntry, old: &ActionEntry) -> bool {
        let (_, _) = (new, old);
        false
    }

    fn start(&self, cx: &mut CommitCx, entry: &mut ActionEntry) -> Result<(), ActionError> {
        let (_, _) = (cx, entry);
        Ok(())
    }

    fn execute(&self, cx: &mut CommitCx, entry: &mut ActionEntry) -> Result<(), ActionError>;

    fn finish(&self, cx: &mut CommitCx, entry: &mut ActionEntry, status: CommitStatus) {
        let (_, _, _) = (cx, entry, status);
    }
}

impl std::fmt::Debug for dyn ActionDef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ActionDef({})", self.name())
    }
}

/// A modifier attached to an action, e.g. IMAP flags on a delivery.
pub trait SideEffect: std::fmt::Debug + Send {
    fn name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;
}

/// One planned action.
pub struct ActionEntry {
    pub(crate) def: &'static dyn ActionDef,
    /// Source line the action was requested at.
    pub line: u32,
    pub state: ActionState,
    /// `true` for the keep synthesized at commit time.
    implicit: bool,
    data: Box<dyn Any + Send>,
    side_effects: Vec<Box<dyn SideEffect>>,
}

impl std::fmt::Debug for ActionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ActionEntry")
            .field("action", &self.def.name())
            .field("line", &self.line)
            .field("state", &self.state)
            .field("implicit", &self.implicit)
            .field("side_effects", &self.side_effects)
            .finish_non_exhaustive()
    }
}

impl ActionEntry {
    pub fn name(&self) -> &'static str {
        self.def.name()
    }

    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    /// The action's context, e.g.
    /// [`FileIntoContext`](crate::core::action::FileIntoContext).
    pub fn context<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref()
    }

    pub(crate) fn context_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.data.downcast_mut()
    }

    pub fn side_effects(&self) -> &[Box<dyn SideEffect>] {
        &self.side_effects
    }

    /// The first side effect of type `T`.
    pub fn side_effect<T: Any>(&self) -> Option<&T> {
        self.side_effects
            .iter()
            .find_map(|effect| effect.as_any().downcast_ref())
    }
}

/// A duplicate-store write deferred until the commit succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredMark {
    pub id: Vec<u8>,
    pub expire_unix: i64,
}

/// Hook context handed to action hooks during commit.
pub struct CommitCx<'a> {
    pub env: &'a ScriptEnv<'a>,
    pub msg: &'a MessageData<'a>,
    pub ehandler: &'a mut dyn ErrorHandler,
    marks: Vec<DeferredMark>,
}

impl std::fmt::Debug for CommitCx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CommitCx")
            .field("marks", &self.marks)
            .finish_non_exhaustive()
    }
}

impl CommitCx<'_> {
    /// Defer a duplicate-store mark to the end of a successful commit.
    pub fn defer_mark(&mut self, id: Vec<u8>, expire_unix: i64) {
        self.marks.push(DeferredMark { id, expire_unix });
    }
}

/// What a commit amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CommitOutcome {
    pub status: CommitStatus,
    pub temporary: bool,
    /// Every committed entry was the implicit keep.
    pub keep_only: bool,
}

/// The ordered set of actions produced by a run.
#[derive(Debug)]
pub struct SieveResult {
    entries: Vec<ActionEntry>,
    implicit_keep: bool,
    marks: Vec<DeferredMark>,
}

impl Default for SieveResult {
    fn default() -> Self {
        Self::new()
    }
}

impl SieveResult {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            implicit_keep: true,
            marks: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[ActionEntry] {
        &self.entries
    }

    /// Whether the result still carries the implicit keep.
    pub fn implicit_keep(&self) -> bool {
        self.implicit_keep
    }

    pub(crate) fn defer_mark(&mut self, id: Vec<u8>, expire_unix: i64) {
        self.marks.push(DeferredMark { id, expire_unix });
    }

    /// Plan an action.
    ///
    /// Composition rules, in order: a duplicate of an earlier action of the
    /// same kind coalesces or rejects per the action's own check; two
    /// response-producing actions conflict; finally both actions' conflict
    /// hooks are consulted. Entries already executed by an earlier script of
    /// a chain never conflict.
    pub fn add_action(
        &mut self,
        def: &'static dyn ActionDef,
        line: u32,
        data: Box<dyn Any + Send>,
        side_effects: Vec<Box<dyn SideEffect>>,
    ) -> Result<(), RuntimeError> {
        let entry = ActionEntry {
            def,
            line,
            state: ActionState::Planned,
            implicit: false,
            data,
            side_effects,
        };

        for old in &self.entries {
            if old.state == ActionState::Executed {
                continue;
            }

            if std::ptr::eq(old.def, def) {
                match def.check_duplicate(&entry, old) {
                    DuplicateVerdict::Distinct => {}
                    DuplicateVerdict::Coalesce => {
                        if entry.def.flags().cancels_keep {
                            self.implicit_keep = false;
                        }
                        return Ok(());
                    }
                    DuplicateVerdict::Reject => {
                        return Err(RuntimeError::DuplicateAction {
                            action: def.name(),
                            line,
                            other_line: old.line,
                        });
                    }
                }
            }

            let response_clash = def.flags().sends_response && old.def.flags().sends_response;
            if response_clash
                || def.check_conflict(&entry, old)
                || old.def.check_conflict(old, &entry)
            {
                return Err(RuntimeError::ActionConflict {
                    action: def.name(),
                    line,
                    other_action: old.def.name(),
                    other_line: old.line,
                });
            }
        }

        if def.flags().cancels_keep {
            self.implicit_keep = false;
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Commit the result: print, start, execute, finish, then write
    /// deferred marks.
    pub(crate) fn commit(
        &mut self,
        env: &ScriptEnv,
        msg: &MessageData,
        ehandler: &mut dyn ErrorHandler,
    ) -> CommitOutcome {
        if self.implicit_keep {
            self.entries.push(ActionEntry {
                def: &crate::core::action::KEEP_ACTION,
                line: 0,
                state: ActionState::Planned,
                implicit: true,
                data: Box::new(crate::core::action::KeepContext::default()),
                side_effects: Vec::new(),
            });
        }

        for entry in &self.entries {
            log::debug!(
                "planned action: {}{}",
                entry.name(),
                if entry.implicit { " (implicit)" } else { "" }
            );
        }

        let mut cx = CommitCx {
            env,
            msg,
            ehandler,
            marks: std::mem::take(&mut self.marks),
        };

        let mut status = CommitStatus::Ok;
        let mut temporary = false;

        for index in 0..self.entries.len() {
            let entry = &mut self.entries[index];
            if entry.state == ActionState::Executed {
                continue;
            }
            let def = entry.def;

            if let Err(error) = def.start(&mut cx, entry) {
                cx.ehandler
                    .error(Some(entry.line), &format!("{}: {error}", def.name()));
                entry.state = ActionState::Failed;
                status = CommitStatus::Failed;
                temporary |= error.temporary;
            }
        }

        if status == CommitStatus::Ok {
            // The first failure decides the outcome, but later actions still
            // run so their finish hooks see a consistent picture.
            for index in 0..self.entries.len() {
                let entry = &mut self.entries[index];
                if entry.state != ActionState::Planned {
                    continue;
                }
                let def = entry.def;

                match def.execute(&mut cx, entry) {
                    Ok(()) => entry.state = ActionState::Executed,
                    Err(error) => {
                        cx.ehandler
                            .error(Some(entry.line), &format!("{}: {error}", def.name()));
                        entry.state = ActionState::Failed;
                        status = CommitStatus::Failed;
                        temporary |= error.temporary;
                    }
                }
            }
        }

        for index in (0..self.entries.len()).rev() {
            let entry = &mut self.entries[index];
            let def = entry.def;
            def.finish(&mut cx, entry, status);
        }

        if status == CommitStatus::Ok {
            if let Some(store) = env.duplicates {
                let user = env.duplicate_user(msg);
                for mark in &cx.marks {
                    store.mark(&mark.id, user, mark.expire_unix);
                }
            }
        }

        CommitOutcome {
            status,
            temporary,
            keep_only: self.entries.iter().all(|entry| entry.implicit),
        }
    }

    /// Tear down after an aborted run: finish hooks observe the abort, no
    /// action executes, no mark is written.
    pub(crate) fn discard_on_abort(
        &mut self,
        env: &ScriptEnv,
        msg: &MessageData,
        ehandler: &mut dyn ErrorHandler,
    ) {
        let mut cx = CommitCx {
            env,
            msg,
            ehandler,
            marks: Vec::new(),
        };

        for index in (0..self.entries.len()).rev() {
            let entry = &mut self.entries[index];
            let def = entry.def;
            def.finish(&mut cx, entry, CommitStatus::Aborted);
        }

        self.entries.clear();
        self.marks.clear();
        self.implicit_keep = true;
    }
}
