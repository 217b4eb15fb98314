//! Host interfaces: message data, script environment, error handling.
//!
//! Everything the engine needs from its host is collected here. Every
//! capability of [`ScriptEnv`] is optional; a missing capability degrades the
//! affected action to a warning instead of failing the run.

use std::{
    any::Any,
    collections::HashMap,
    io::{self, Write},
    sync::atomic::AtomicBool,
};

/// Read access to the message being filtered.
pub trait Mail {
    /// Raw values of all headers named `name`, in message order.
    fn headers(&self, name: &str) -> Vec<String>;

    /// Header values decoded to UTF-8 (RFC 2047 words decoded where the
    /// implementation supports it).
    fn headers_utf8(&self, name: &str) -> Vec<String> {
        self.headers(name)
    }

    fn first_header(&self, name: &str) -> Option<String> {
        self.headers(name).into_iter().next()
    }

    /// `RFC822.SIZE`: the size of the message in bytes.
    fn size(&self) -> u64;
}

/// The message and its envelope, immutable during a run.
pub struct MessageData<'a> {
    pub mail: &'a dyn Mail,
    /// Envelope sender. `None` or empty for the null return path.
    pub return_path: Option<String>,
    /// Envelope recipient this delivery is for.
    pub to_address: Option<String>,
    /// Authenticated user the delivery runs as.
    pub auth_user: Option<String>,
    /// Value of the Message-ID header, already trimmed.
    pub message_id: Option<String>,
}

impl std::fmt::Debug for MessageData<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MessageData")
            .field("return_path", &self.return_path)
            .field("to_address", &self.to_address)
            .field("auth_user", &self.auth_user)
            .field("message_id", &self.message_id)
            .finish_non_exhaustive()
    }
}

impl<'a> MessageData<'a> {
    pub fn new(mail: &'a dyn Mail) -> Self {
        Self {
            mail,
            return_path: None,
            to_address: None,
            auth_user: None,
            message_id: None,
        }
    }
}

/// An open SMTP submission.
pub trait SmtpHandle: Write {
    /// Finish the submission.
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Outgoing mail transport.
pub trait Smtp {
    /// Start a submission to `destination`. `return_path` is the envelope
    /// sender; `None` requests the null return path.
    fn open<'a>(
        &'a self,
        destination: &str,
        return_path: Option<&str>,
    ) -> io::Result<Box<dyn SmtpHandle + 'a>>;
}

/// Persistent duplicate tracking, scoped per user.
pub trait DuplicateStore {
    fn check(&self, id: &[u8], user: &str) -> bool;

    fn mark(&self, id: &[u8], user: &str, expire_unix: i64);
}

/// Where validation and runtime diagnostics go.
pub trait ErrorHandler {
    fn warning(&mut self, line: Option<u32>, message: &str);

    fn error(&mut self, line: Option<u32>, message: &str);

    /// An engine-level failure, e.g. a corrupt binary.
    fn critical(&mut self, message: &str);
}

/// Routes diagnostics to the `log` crate.
#[derive(Debug, Default)]
pub struct LogErrorHandler;

impl ErrorHandler for LogErrorHandler {
    fn warning(&mut self, line: Option<u32>, message: &str) {
        match line {
            Some(line) => log::warn!("line {line}: {message}"),
            None => log::warn!("{message}"),
        }
    }

    fn error(&mut self, line: Option<u32>, message: &str) {
        match line {
            Some(line) => log::error!("line {line}: {message}"),
            None => log::error!("{message}"),
        }
    }

    fn critical(&mut self, message: &str) {
        log::error!("{message}");
    }
}

/// Collects diagnostics, rendered with their location.
#[derive(Debug, Default)]
pub struct CollectingErrorHandler {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl CollectingErrorHandler {
    fn render(line: Option<u32>, message: &str) -> String {
        match line {
            Some(line) => format!("line {line}: {message}"),
            None => message.to_owned(),
        }
    }
}

impl ErrorHandler for CollectingErrorHandler {
    fn warning(&mut self, line: Option<u32>, message: &str) {
        self.warnings.push(Self::render(line, message));
    }

    fn error(&mut self, line: Option<u32>, message: &str) {
        self.errors.push(Self::render(line, message));
    }

    fn critical(&mut self, message: &str) {
        self.errors.push(message.to_owned());
    }
}

/// Host capabilities available to actions.
#[derive(Default)]
pub struct ScriptEnv<'a> {
    /// Name of the default mailbox; `INBOX` when unset.
    pub inbox: Option<String>,
    /// Mailbox namespace prefix applied to `fileinto` targets.
    pub namespace: Option<String>,
    pub username: Option<String>,
    pub hostname: Option<String>,
    pub postmaster_address: Option<String>,
    pub smtp: Option<&'a dyn Smtp>,
    pub duplicates: Option<&'a dyn DuplicateStore>,
    /// Polled between opcodes; raising it aborts the run with a temporary
    /// failure and no committed actions.
    pub abort: Option<&'a AtomicBool>,
}

impl std::fmt::Debug for ScriptEnv<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ScriptEnv")
            .field("inbox", &self.inbox)
            .field("namespace", &self.namespace)
            .field("username", &self.username)
            .field("hostname", &self.hostname)
            .field("postmaster_address", &self.postmaster_address)
            .field("smtp", &self.smtp.is_some())
            .field("duplicates", &self.duplicates.is_some())
            .finish_non_exhaustive()
    }
}

impl ScriptEnv<'_> {
    pub fn inbox(&self) -> &str {
        self.inbox.as_deref().unwrap_or("INBOX")
    }

    /// The user duplicate tracking is scoped to.
    pub fn duplicate_user<'m>(&'m self, msg: &'m MessageData) -> &'m str {
        self.username
            .as_deref()
            .or(msg.auth_user.as_deref())
            .unwrap_or("")
    }
}

/// Per-message state shared by every script run against one message.
#[derive(Default)]
pub struct MessageContext {
    slots: HashMap<&'static str, Box<dyn Any>>,
}

impl std::fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("slots", &self.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MessageContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The extension's slot, created on first use.
    pub fn slot_mut<T: Any + Default>(&mut self, extension: &'static str) -> &mut T {
        self.slots
            .entry(extension)
            .and_modify(|slot| {
                if !slot.is::<T>() {
                    *slot = Box::<T>::default();
                }
            })
            .or_insert_with(|| Box::<T>::default())
            .downcast_mut()
            .expect("slot type was just ensured")
    }
}

/// A [`Mail`] over header text, for hosts that already have the message in
/// memory and for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryMail {
    headers: Vec<(String, String)>,
    size: u64,
}

impl MemoryMail {
    /// Parse the header section of a raw message. Folded lines are unfolded;
    /// the size is the length of the input.
    pub fn parse(raw: &str) -> Self {
        let mut headers: Vec<(String, String)> = Vec::new();

        let header_section = match raw.find("\n\n") {
            Some(end) => &raw[..end],
            None => raw.split("\r\n\r\n").next().unwrap_or(raw),
        };

        for line in header_section.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                break;
            }

            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some((_, value)) = headers.last_mut() {
                    value.push(' ');
                    value.push_str(line.trim_start());
                }
                continue;
            }

            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_owned(), value.trim_start().to_owned()));
            }
        }

        Self {
            headers,
            size: raw.len() as u64,
        }
    }

    pub fn from_headers<'h>(
        headers: impl IntoIterator<Item = (&'h str, &'h str)>,
        size: u64,
    ) -> Self {
        Self {
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .collect(),
            size,
        }
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }
}

impl Mail for MemoryMail {
    fn headers(&self, name: &str) -> Vec<String> {
        self.headers
            .iter()
            .filter(|(have, _)| have.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
            .collect()
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_mail_parse() {
        let mail = MemoryMail::parse(
            "From: Root <root@host>\r\nSubject: Hi\r\n there\r\nX-Spam: NO\r\n\r\nbody\r\n",
        );

        assert_eq!(mail.first_header("subject").unwrap(), "Hi there");
        assert_eq!(mail.headers("X-SPAM"), vec!["NO".to_owned()]);
        assert!(mail.headers("To").is_empty());
        assert!(mail.size() > 0);
    }

    #[test]
    fn test_memory_mail_repeated_headers() {
        let mail = MemoryMail::from_headers([("Received", "a"), ("Received", "b")], 10);
        assert_eq!(mail.headers("Received"), vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(mail.first_header("Received").unwrap(), "a");
    }

    #[test]
    fn test_message_context_slot() {
        #[derive(Default)]
        struct Counter(u32);

        let mut ctx = MessageContext::new();
        ctx.slot_mut::<Counter>("test").0 += 1;
        ctx.slot_mut::<Counter>("test").0 += 1;
        assert_eq!(ctx.slot_mut::<Counter>("test").0, 2);
    }
}
