//! End-to-end runs: compile a script, execute it against a message, check
//! the committed actions.

use std::{
    cell::RefCell,
    collections::HashMap,
    io::{self, Write},
};

use sieve_engine::{
    compile, execute,
    core::action::{FileIntoContext, RedirectContext},
    extensions::imap4flags::FlagsEffect,
    runtime::{
        CollectingErrorHandler, DuplicateStore, Mail, MemoryMail, MessageContext, MessageData,
        ScriptEnv, Smtp, SmtpHandle,
    },
    sieve_types::flag::Flag,
    CompileOptions, ExitCode, Registry, SieveResult,
};

fn compile_ok(script: &str, registry: &Registry) -> sieve_engine::Binary {
    let mut ehandler = CollectingErrorHandler::default();
    match compile(script, registry, &CompileOptions::default(), &mut ehandler) {
        Ok(binary) => binary,
        Err(error) => panic!("compile failed: {error}; errors: {:?}", ehandler.errors),
    }
}

fn run(
    binary: &sieve_engine::Binary,
    registry: &Registry,
    msg: &MessageData,
    env: &ScriptEnv,
) -> (ExitCode, SieveResult, CollectingErrorHandler) {
    let mut ehandler = CollectingErrorHandler::default();
    let mut message_ctx = MessageContext::new();
    let (code, result) = execute(binary, registry, msg, env, &mut message_ctx, &mut ehandler);
    (code, result, ehandler)
}

// ----- test doubles -----

#[derive(Default)]
struct MockSmtp {
    sent: RefCell<Vec<(String, String)>>,
}

struct MockSubmission<'a> {
    smtp: &'a MockSmtp,
    destination: String,
    body: Vec<u8>,
}

impl Write for MockSubmission<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SmtpHandle for MockSubmission<'_> {
    fn close(self: Box<Self>) -> io::Result<()> {
        self.smtp.sent.borrow_mut().push((
            self.destination.clone(),
            String::from_utf8_lossy(&self.body).into_owned(),
        ));
        Ok(())
    }
}

impl Smtp for MockSmtp {
    fn open<'a>(
        &'a self,
        destination: &str,
        _return_path: Option<&str>,
    ) -> io::Result<Box<dyn SmtpHandle + 'a>> {
        Ok(Box::new(MockSubmission {
            smtp: self,
            destination: destination.to_owned(),
            body: Vec::new(),
        }))
    }
}

#[derive(Default)]
struct MockDuplicateStore {
    marks: RefCell<HashMap<(Vec<u8>, String), i64>>,
}

impl DuplicateStore for MockDuplicateStore {
    fn check(&self, id: &[u8], user: &str) -> bool {
        self.marks
            .borrow()
            .contains_key(&(id.to_vec(), user.to_owned()))
    }

    fn mark(&self, id: &[u8], user: &str, expire_unix: i64) {
        self.marks
            .borrow_mut()
            .insert((id.to_vec(), user.to_owned()), expire_unix);
    }
}

/// Counts per-header accesses, to observe short-circuit evaluation.
struct CountingMail {
    inner: MemoryMail,
    accesses: RefCell<HashMap<String, usize>>,
}

impl CountingMail {
    fn new(inner: MemoryMail) -> Self {
        Self {
            inner,
            accesses: RefCell::new(HashMap::new()),
        }
    }

    fn accesses(&self, name: &str) -> usize {
        self.accesses
            .borrow()
            .get(&name.to_ascii_lowercase())
            .copied()
            .unwrap_or(0)
    }

    fn count(&self, name: &str) {
        *self
            .accesses
            .borrow_mut()
            .entry(name.to_ascii_lowercase())
            .or_insert(0) += 1;
    }
}

impl Mail for CountingMail {
    fn headers(&self, name: &str) -> Vec<String> {
        self.count(name);
        self.inner.headers(name)
    }

    fn headers_utf8(&self, name: &str) -> Vec<String> {
        self.count(name);
        self.inner.headers_utf8(name)
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }
}

// ----- the literal scenarios -----

#[test]
fn scenario_fileinto_on_subject_match() {
    let registry = Registry::with_defaults();
    let binary = compile_ok(
        "require [\"fileinto\"];\nif header :is \"Subject\" \"Hi\" { fileinto \"INBOX.Greetings\"; }\n",
        &registry,
    );

    let mail = MemoryMail::parse("Subject: Hi\r\n\r\nhello\r\n");
    let msg = MessageData::new(&mail);
    let env = ScriptEnv::default();

    let (code, result, _) = run(&binary, &registry, &msg, &env);
    assert_eq!(code, ExitCode::Ok);
    assert!(!result.implicit_keep());

    let entries = result.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name(), "fileinto");
    assert!(!entries[0].is_implicit());

    let context = entries[0].context::<FileIntoContext>().unwrap();
    assert_eq!(context.mailbox, "INBOX.Greetings");
    assert_eq!(context.resolved.as_deref(), Some("INBOX.Greetings"));
}

#[test]
fn scenario_anyof_discard_not_taken() {
    let registry = Registry::with_defaults();
    let binary = compile_ok(
        "if anyof (header :contains \"X-Spam\" \"YES\", size :over 100K) { discard; stop; }\n",
        &registry,
    );

    let mut mail = MemoryMail::parse("X-Spam: NO\r\nSubject: x\r\n\r\n");
    mail.set_size(50 * 1024);
    let msg = MessageData::new(&mail);
    let env = ScriptEnv::default();

    let (code, result, _) = run(&binary, &registry, &msg, &env);
    assert_eq!(code, ExitCode::KeepOnly);
    assert!(result.implicit_keep());

    // Only the implicit keep was committed.
    let entries = result.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name(), "keep");
    assert!(entries[0].is_implicit());
}

#[test]
fn scenario_address_localpart_redirect() {
    let registry = Registry::with_defaults();
    let binary = compile_ok(
        "if address :localpart :is \"from\" \"root\" { redirect \"admin@x.test\"; }\n",
        &registry,
    );

    let mail = MemoryMail::parse("From: Root <ROOT@host>\r\n\r\n");
    let msg = MessageData::new(&mail);
    let env = ScriptEnv::default();

    let (code, result, _) = run(&binary, &registry, &msg, &env);
    assert_eq!(code, ExitCode::Ok);

    let entries = result.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name(), "redirect");
    assert_eq!(
        entries[0].context::<RedirectContext>().unwrap().address,
        "admin@x.test"
    );
}

#[test]
fn scenario_vacation_suppresses_duplicate_replies() {
    let registry = Registry::with_defaults();
    let binary = compile_ok(
        "require \"vacation\";\nvacation :days 7 :subject \"Away\" :handle \"h1\" \"I am away\";\n",
        &registry,
    );

    let smtp = MockSmtp::default();
    let store = MockDuplicateStore::default();
    let env = ScriptEnv {
        username: Some("bob".to_owned()),
        hostname: Some("example.com".to_owned()),
        smtp: Some(&smtp),
        duplicates: Some(&store),
        ..ScriptEnv::default()
    };

    let mail = MemoryMail::parse(
        "From: Alice <alice@remote.test>\r\nTo: <bob@example.com>\r\nSubject: ping\r\n\r\n",
    );
    let mut msg = MessageData::new(&mail);
    msg.return_path = Some("alice@remote.test".to_owned());
    msg.to_address = Some("bob@example.com".to_owned());

    // First delivery: the reply goes out and the sender is marked.
    let (code, result, _) = run(&binary, &registry, &msg, &env);
    assert_eq!(code, ExitCode::Ok);
    assert_eq!(result.entries().iter().filter(|e| e.name() == "vacation").count(), 1);
    {
        let sent = smtp.sent.borrow();
        assert_eq!(sent.len(), 1);
        let (destination, body) = &sent[0];
        assert_eq!(destination, "alice@remote.test");
        assert!(body.contains("Subject: Away"));
        assert!(body.contains("Auto-Submitted: auto-replied"));
        assert!(body.contains("I am away"));
    }
    assert_eq!(store.marks.borrow().len(), 1);

    // Second delivery within the period: no SMTP traffic.
    let (code, result, _) = run(&binary, &registry, &msg, &env);
    assert_eq!(code, ExitCode::KeepOnly);
    assert!(result.entries().iter().all(|e| e.name() != "vacation"));
    assert_eq!(smtp.sent.borrow().len(), 1);
}

#[test]
fn scenario_setflag_attaches_to_keep() {
    let mut registry = Registry::with_defaults();
    registry.set_implicit(["imap4flags"]);

    let binary = compile_ok(
        "if header :matches \"Subject\" \"Re: *\" { setflag \"\\\\Answered\"; keep; }\n",
        &registry,
    );

    let mail = MemoryMail::parse("Subject: Re: hello\r\n\r\n");
    let msg = MessageData::new(&mail);
    let env = ScriptEnv::default();

    let (code, result, _) = run(&binary, &registry, &msg, &env);
    assert_eq!(code, ExitCode::Ok);
    assert!(!result.implicit_keep());

    let entries = result.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name(), "keep");

    let flags = entries[0].side_effect::<FlagsEffect>().unwrap();
    assert_eq!(flags.flags, vec![Flag::Answered]);
}

#[test]
fn scenario_unknown_extension_refused_before_any_opcode() {
    let full = Registry::with_defaults();
    let binary = compile_ok(
        "require \"vacation\";\nvacation \"away\";\n",
        &full,
    );
    assert_eq!(binary.extensions(), ["vacation".to_owned()]);

    // A runtime that no longer registers the extension refuses to run.
    let bare = Registry::new();
    let mail = MemoryMail::parse("Subject: x\r\n\r\n");
    let msg = MessageData::new(&mail);
    let env = ScriptEnv::default();

    let (code, result, ehandler) = run(&binary, &bare, &msg, &env);
    assert_eq!(code, ExitCode::Failed);
    assert!(result.entries().is_empty());
    assert!(ehandler
        .errors
        .iter()
        .any(|error| error.contains("unknown extension 'vacation'")));
}

// ----- invariants -----

#[test]
fn anyof_short_circuits() {
    let registry = Registry::with_defaults();
    let binary = compile_ok(
        "if anyof (header :is \"A\" \"x\", header :is \"B\" \"y\") { discard; }\n",
        &registry,
    );

    let mail = CountingMail::new(MemoryMail::from_headers([("A", "x"), ("B", "y")], 100));
    let msg = MessageData::new(&mail);
    let env = ScriptEnv::default();

    let (code, _, _) = run(&binary, &registry, &msg, &env);
    assert_eq!(code, ExitCode::Ok);
    assert_eq!(mail.accesses("A"), 1);
    assert_eq!(mail.accesses("B"), 0);
}

#[test]
fn allof_short_circuits() {
    let registry = Registry::with_defaults();
    let binary = compile_ok(
        "if allof (header :is \"A\" \"nope\", header :is \"B\" \"y\") { discard; }\n",
        &registry,
    );

    let mail = CountingMail::new(MemoryMail::from_headers([("A", "x"), ("B", "y")], 100));
    let msg = MessageData::new(&mail);
    let env = ScriptEnv::default();

    let (code, _, _) = run(&binary, &registry, &msg, &env);
    assert_eq!(code, ExitCode::KeepOnly);
    assert_eq!(mail.accesses("A"), 1);
    assert_eq!(mail.accesses("B"), 0);
}

#[test]
fn empty_script_keeps_implicitly() {
    let registry = Registry::with_defaults();
    let binary = compile_ok("", &registry);

    let mail = MemoryMail::parse("Subject: x\r\n\r\n");
    let msg = MessageData::new(&mail);
    let env = ScriptEnv::default();

    let (code, result, _) = run(&binary, &registry, &msg, &env);
    assert_eq!(code, ExitCode::KeepOnly);
    let entries = result.entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].is_implicit());
    assert_eq!(entries[0].name(), "keep");
}

#[test]
fn two_response_actions_conflict() {
    let registry = Registry::with_defaults();
    let binary = compile_ok(
        "require \"vacation\";\nvacation :handle \"a\" \"x\";\nvacation :handle \"b\" \"y\";\n",
        &registry,
    );

    let smtp = MockSmtp::default();
    let store = MockDuplicateStore::default();
    let env = ScriptEnv {
        smtp: Some(&smtp),
        duplicates: Some(&store),
        ..ScriptEnv::default()
    };

    let mail = MemoryMail::parse("From: <a@b.test>\r\nTo: <me@example.com>\r\n\r\n");
    let mut msg = MessageData::new(&mail);
    msg.return_path = Some("a@b.test".to_owned());
    msg.to_address = Some("me@example.com".to_owned());

    let (code, result, ehandler) = run(&binary, &registry, &msg, &env);
    assert_eq!(code, ExitCode::Failed);
    assert!(result.entries().is_empty());
    assert!(ehandler
        .errors
        .iter()
        .any(|error| error.contains("conflicts with")));
    // Nothing was committed.
    assert!(smtp.sent.borrow().is_empty());
    assert!(store.marks.borrow().is_empty());
}

#[test]
fn stop_halts_with_implicit_keep() {
    let registry = Registry::with_defaults();
    let binary = compile_ok(
        "if true { stop; }\ndiscard;\n",
        &registry,
    );

    let mail = MemoryMail::parse("Subject: x\r\n\r\n");
    let msg = MessageData::new(&mail);
    let env = ScriptEnv::default();

    let (code, result, _) = run(&binary, &registry, &msg, &env);
    assert_eq!(code, ExitCode::KeepOnly);
    assert!(result.implicit_keep());
}

#[test]
fn abort_flag_discards_the_run() {
    use std::sync::atomic::AtomicBool;

    let registry = Registry::with_defaults();
    let binary = compile_ok("require \"fileinto\";\nfileinto \"X\";\n", &registry);

    let abort = AtomicBool::new(true);
    let env = ScriptEnv {
        abort: Some(&abort),
        ..ScriptEnv::default()
    };

    let mail = MemoryMail::parse("Subject: x\r\n\r\n");
    let msg = MessageData::new(&mail);

    let (code, result, _) = run(&binary, &registry, &msg, &env);
    assert_eq!(code, ExitCode::TempFailure);
    assert!(result.entries().is_empty());
}

// ----- further extension coverage -----

#[test]
fn envelope_test_reads_the_return_path() {
    let registry = Registry::with_defaults();
    let binary = compile_ok(
        "require \"envelope\";\nif envelope :domain :is \"from\" \"remote.test\" { discard; }\n",
        &registry,
    );

    let mail = MemoryMail::parse("Subject: x\r\n\r\n");
    let mut msg = MessageData::new(&mail);
    msg.return_path = Some("alice@REMOTE.test".to_owned());
    let env = ScriptEnv::default();

    let (code, result, _) = run(&binary, &registry, &msg, &env);
    assert_eq!(code, ExitCode::Ok);
    assert_eq!(result.entries()[0].name(), "discard");
}

#[test]
fn relational_count_over_received_headers() {
    let registry = Registry::with_defaults();
    let binary = compile_ok(
        "require [\"relational\", \"fileinto\"];\nif header :count \"ge\" \"Received\" \"2\" { fileinto \"Relayed\"; }\n",
        &registry,
    );

    let mail = MemoryMail::from_headers([("Received", "by a"), ("Received", "by b")], 64);
    let msg = MessageData::new(&mail);
    let env = ScriptEnv::default();

    let (code, result, _) = run(&binary, &registry, &msg, &env);
    assert_eq!(code, ExitCode::Ok);
    assert_eq!(result.entries()[0].name(), "fileinto");
}

#[test]
fn duplicate_test_is_false_then_true() {
    let registry = Registry::with_defaults();
    let binary = compile_ok(
        "require [\"duplicate\", \"fileinto\"];\nif duplicate { fileinto \"Dups\"; }\n",
        &registry,
    );

    let store = MockDuplicateStore::default();
    let env = ScriptEnv {
        username: Some("bob".to_owned()),
        duplicates: Some(&store),
        ..ScriptEnv::default()
    };

    let mail = MemoryMail::parse("Subject: x\r\n\r\n");
    let mut msg = MessageData::new(&mail);
    msg.message_id = Some("<msg1@remote.test>".to_owned());

    let (code, result, _) = run(&binary, &registry, &msg, &env);
    assert_eq!(code, ExitCode::KeepOnly);
    assert!(result.entries()[0].is_implicit());
    // The commit recorded the message as seen.
    assert_eq!(store.marks.borrow().len(), 1);

    let (code, result, _) = run(&binary, &registry, &msg, &env);
    assert_eq!(code, ExitCode::Ok);
    assert_eq!(result.entries()[0].name(), "fileinto");
    assert_eq!(
        result.entries()[0]
            .context::<FileIntoContext>()
            .unwrap()
            .mailbox,
        "Dups"
    );
}

#[test]
fn fileinto_applies_the_namespace() {
    let registry = Registry::with_defaults();
    let binary = compile_ok("require \"fileinto\";\nfileinto \"Lists/sieve\";\n", &registry);

    let env = ScriptEnv {
        namespace: Some("INBOX/".to_owned()),
        ..ScriptEnv::default()
    };
    let mail = MemoryMail::parse("Subject: x\r\n\r\n");
    let msg = MessageData::new(&mail);

    let (code, result, _) = run(&binary, &registry, &msg, &env);
    assert_eq!(code, ExitCode::Ok);
    assert_eq!(
        result.entries()[0]
            .context::<FileIntoContext>()
            .unwrap()
            .resolved
            .as_deref(),
        Some("INBOX/Lists/sieve")
    );
}

#[test]
fn duplicate_fileinto_coalesces() {
    let registry = Registry::with_defaults();
    let binary = compile_ok(
        "require \"fileinto\";\nfileinto \"A\";\nfileinto \"A\";\nfileinto \"B\";\n",
        &registry,
    );

    let mail = MemoryMail::parse("Subject: x\r\n\r\n");
    let msg = MessageData::new(&mail);
    let env = ScriptEnv::default();

    let (code, result, _) = run(&binary, &registry, &msg, &env);
    assert_eq!(code, ExitCode::Ok);
    let mailboxes: Vec<_> = result
        .entries()
        .iter()
        .map(|entry| entry.context::<FileIntoContext>().unwrap().mailbox.clone())
        .collect();
    assert_eq!(mailboxes, ["A".to_owned(), "B".to_owned()]);
}

#[test]
fn elsif_and_else_branches() {
    let registry = Registry::with_defaults();
    let binary = compile_ok(
        concat!(
            "require \"fileinto\";\n",
            "if header :is \"X\" \"1\" { fileinto \"One\"; }\n",
            "elsif header :is \"X\" \"2\" { fileinto \"Two\"; }\n",
            "else { fileinto \"Other\"; }\n",
        ),
        &registry,
    );

    let env = ScriptEnv::default();
    for (value, expected) in [("1", "One"), ("2", "Two"), ("3", "Other")] {
        let mail = MemoryMail::from_headers([("X", value)], 10);
        let msg = MessageData::new(&mail);
        let (code, result, _) = run(&binary, &registry, &msg, &env);
        assert_eq!(code, ExitCode::Ok);
        assert_eq!(
            result.entries()[0]
                .context::<FileIntoContext>()
                .unwrap()
                .mailbox,
            expected,
            "X: {value}"
        );
    }
}
