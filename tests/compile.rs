//! Compilation: determinism, persistence round trips, disassembly, and the
//! validator's diagnostics.

use sieve_engine::{
    compile, runtime::CollectingErrorHandler, Binary, CompileError, CompileOptions, Registry,
};

fn compile_with(script: &str, registry: &Registry) -> (Result<Binary, CompileError>, CollectingErrorHandler) {
    let mut ehandler = CollectingErrorHandler::default();
    let result = compile(script, registry, &CompileOptions::default(), &mut ehandler);
    (result, ehandler)
}

fn compile_ok(script: &str, registry: &Registry) -> Binary {
    let (result, ehandler) = compile_with(script, registry);
    match result {
        Ok(binary) => binary,
        Err(error) => panic!("compile failed: {error}; errors: {:?}", ehandler.errors),
    }
}

fn errors_of(script: &str) -> Vec<String> {
    let registry = Registry::with_defaults();
    let (result, ehandler) = compile_with(script, &registry);
    assert!(result.is_err(), "expected {script:?} to fail validation");
    ehandler.errors
}

const SAMPLE: &str = concat!(
    "require [\"fileinto\", \"vacation\"];\n",
    "if anyof (header :contains [\"X-Spam\", \"X-Junk\"] \"YES\", size :over 2M) {\n",
    "    fileinto \"Junk\";\n",
    "    stop;\n",
    "} elsif not exists \"List-Id\" {\n",
    "    vacation :days 3 \"Out of office\";\n",
    "} else {\n",
    "    redirect \"archive@example.net\";\n",
    "}\n",
);

#[test]
fn compilation_is_deterministic() {
    let registry = Registry::with_defaults();
    let first = compile_ok(SAMPLE, &registry);
    let second = compile_ok(SAMPLE, &registry);

    assert_eq!(first, second);
    assert_eq!(first.to_bytes(), second.to_bytes());
}

#[test]
fn stored_binary_round_trips_byte_exactly() {
    let registry = Registry::with_defaults();
    let binary = compile_ok(SAMPLE, &registry);

    let reloaded = Binary::from_bytes(&binary.to_bytes(), &registry).unwrap();
    assert_eq!(reloaded, binary);
    assert_eq!(reloaded.to_bytes(), binary.to_bytes());
}

#[test]
fn dump_is_stable_across_reload() {
    let registry = Registry::with_defaults();
    let binary = compile_ok(SAMPLE, &registry);

    let dump = binary.dump(&registry).unwrap();
    let reloaded = Binary::from_bytes(&binary.to_bytes(), &registry).unwrap();
    assert_eq!(reloaded.dump(&registry).unwrap(), dump);

    assert!(dump.contains("FILEINTO"), "{dump}");
    assert!(dump.contains("\"Junk\""), "{dump}");
    assert!(dump.contains("JMPFALSE"), "{dump}");
    assert!(dump.contains("VACATION"), "{dump}");
    assert!(dump.contains(":days 3"), "{dump}");
    assert!(dump.contains("NOT"), "{dump}");
}

#[test]
fn extension_index_lists_referenced_extensions() {
    let registry = Registry::with_defaults();
    let binary = compile_ok(SAMPLE, &registry);
    assert_eq!(binary.extensions(), ["vacation".to_owned()]);

    let core_only = compile_ok("keep;", &registry);
    assert!(core_only.extensions().is_empty());
}

#[test]
fn validation_is_deterministic() {
    let script = "keep :nope;\nunknowncmd;\nfileinto \"X\";\n";
    let first = errors_of(script);
    let second = errors_of(script);
    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
}

#[test]
fn unknown_command_is_reported() {
    let errors = errors_of("frobnicate \"x\";\n");
    assert!(errors[0].contains("unknown command 'frobnicate'"), "{errors:?}");
}

#[test]
fn unknown_test_is_reported() {
    let errors = errors_of("if frobnicate { keep; }\n");
    assert!(errors[0].contains("unknown test 'frobnicate'"), "{errors:?}");
}

#[test]
fn unknown_extension_in_require() {
    let errors = errors_of("require \"frobnicate\";\n");
    assert!(errors[0].contains("unknown extension 'frobnicate'"), "{errors:?}");
}

#[test]
fn command_used_as_test_is_reported() {
    let errors = errors_of("if keep { stop; }\n");
    assert!(errors[0].contains("'keep' is a command, not a test"), "{errors:?}");
}

#[test]
fn fileinto_requires_the_capability() {
    let errors = errors_of("fileinto \"X\";\n");
    assert!(
        errors[0].contains("requires the \"fileinto\" capability"),
        "{errors:?}"
    );

    let registry = Registry::with_defaults();
    compile_ok("require \"fileinto\";\nfileinto \"X\";\n", &registry);
}

#[test]
fn require_must_come_first() {
    let errors = errors_of("keep;\nrequire \"fileinto\";\n");
    assert!(errors[0].contains("must come first"), "{errors:?}");
}

#[test]
fn type_mismatch_is_reported() {
    let errors = errors_of("if header :is \"Subject\" 42 { keep; }\n");
    assert!(
        errors[0].contains("key-list argument of the header") && errors[0].contains("number"),
        "{errors:?}"
    );
}

#[test]
fn missing_argument_is_reported() {
    let errors = errors_of("if header :is \"Subject\" { keep; }\n");
    assert!(!errors.is_empty());
}

#[test]
fn excess_arguments_are_reported() {
    let errors = errors_of("keep \"what\";\n");
    assert!(errors[0].contains("too many arguments"), "{errors:?}");
}

#[test]
fn unknown_tag_is_reported() {
    let errors = errors_of("if header :regex \"Subject\" \"x.*\" { keep; }\n");
    assert!(errors[0].contains("unknown tag :regex"), "{errors:?}");
}

#[test]
fn multiple_match_types_are_rejected() {
    let errors = errors_of("if header :is :contains \"Subject\" \"x\" { keep; }\n");
    assert!(errors[0].contains("multiple match types"), "{errors:?}");
}

#[test]
fn size_requires_a_comparison_tag() {
    let errors = errors_of("if size 100K { keep; }\n");
    assert!(errors[0].contains(":over or :under"), "{errors:?}");

    let errors = errors_of("if size :over :under 100K { keep; }\n");
    assert!(errors[0].contains("exactly one of"), "{errors:?}");
}

#[test]
fn elsif_without_if_is_reported() {
    let errors = errors_of("keep;\nelsif true { keep; }\n");
    assert!(errors[0].contains("elsif without a matching if"), "{errors:?}");
}

#[test]
fn invalid_redirect_address_is_reported() {
    let errors = errors_of("redirect \"not-an-address\";\n");
    assert!(errors[0].contains("invalid redirect address"), "{errors:?}");
}

#[test]
fn invalid_flag_list_is_reported() {
    let mut registry = Registry::with_defaults();
    registry.set_implicit(["imap4flags"]);
    let (result, ehandler) = compile_with("setflag \"not a flag (\";\n", &registry);
    assert!(result.is_err());
    assert!(
        ehandler.errors[0].contains("invalid flag list"),
        "{:?}",
        ehandler.errors
    );
}

#[test]
fn vacation_days_zero_warns_and_clamps() {
    let registry = Registry::with_defaults();
    let mut ehandler = CollectingErrorHandler::default();
    let binary = compile(
        "require \"vacation\";\nvacation :days 0 \"away\";\n",
        &registry,
        &CompileOptions::default(),
        &mut ehandler,
    )
    .unwrap();

    assert!(
        ehandler.warnings.iter().any(|w| w.contains(":days 0")),
        "{:?}",
        ehandler.warnings
    );
    // The stored operand is the clamped value.
    assert!(binary.dump(&registry).unwrap().contains(":days 1"));
}

#[test]
fn relational_relation_is_validated() {
    let errors = errors_of("require \"relational\";\nif header :count \"about\" \"X\" \"1\" { keep; }\n");
    assert!(errors[0].contains("invalid relation 'about'"), "{errors:?}");
}

#[test]
fn duplicate_id_sources_are_exclusive() {
    let errors =
        errors_of("require \"duplicate\";\nif duplicate :header \"x\" :uniqueid \"y\" { keep; }\n");
    assert!(
        errors[0].contains("at most one of :header and :uniqueid"),
        "{errors:?}"
    );
}

#[test]
fn error_limit_stops_the_flood() {
    let registry = Registry::with_defaults();
    let script = "unknowncmd;\n".repeat(300);
    let mut ehandler = CollectingErrorHandler::default();
    let result = compile(
        &script,
        &registry,
        &CompileOptions { max_errors: 10 },
        &mut ehandler,
    );

    assert!(result.is_err());
    // Ten reports plus the giving-up notice.
    assert_eq!(ehandler.errors.len(), 11);
    assert!(ehandler.errors.last().unwrap().contains("too many errors"));
}

#[test]
fn encoded_character_capability_decodes_strings() {
    let registry = Registry::with_defaults();
    let binary = compile_ok(
        "require [\"encoded-character\", \"fileinto\"];\nfileinto \"${hex: 41 42 43 }\";\n",
        &registry,
    );
    assert!(binary.dump(&registry).unwrap().contains("\"ABC\""));

    // Without the capability the text stays verbatim.
    let binary = compile_ok("require \"fileinto\";\nfileinto \"${hex: 41 }\";\n", &registry);
    assert!(binary.dump(&registry).unwrap().contains("${hex: 41 }"));
}

#[test]
fn multiline_and_comments_parse() {
    let registry = Registry::with_defaults();
    let binary = compile_ok(
        concat!(
            "# hash comment\n",
            "/* bracket\n   comment */\n",
            "require \"vacation\";\n",
            "vacation text:\n",
            "I am away.\n",
            "..stuffed line\n",
            ".\n",
            ";\n",
        ),
        &registry,
    );
    let dump = binary.dump(&registry).unwrap();
    assert!(dump.contains("I am away."), "{dump}");
    assert!(dump.contains(".stuffed line"), "{dump}");
}

#[test]
fn truncated_binary_is_rejected() {
    let registry = Registry::with_defaults();
    let bytes = compile_ok("keep;", &registry).to_bytes();
    assert!(Binary::from_bytes(&bytes[..4], &registry).is_err());
}
