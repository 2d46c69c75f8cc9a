use std::path::Path;

use crate::{registry::prepare::split_args, tests::session};

#[test]
fn test_define_extraction_preserves_layout() {
    let source = "@define noop() { return nil }\nint x;\n";
    let prepared = session()
        .prepare_source(source, Path::new("t.cup"))
        .unwrap();
    assert_eq!(prepared.clean_source.len(), source.len());
    assert_eq!(
        prepared.clean_source.matches('\n').count(),
        source.matches('\n').count()
    );
    assert!(prepared.clean_source.contains("int x;"));
    assert!(!prepared.clean_source.contains("@define"));
}

#[test]
fn test_preparation_is_idempotent() {
    let source = "@define id(v) { return v }\nint y = @id(1);\n";
    let session = session();
    let once = session
        .prepare_source(source, Path::new("t.cup"))
        .unwrap()
        .clean_source;
    let twice = session
        .prepare_source(&once, Path::new("t.cup"))
        .unwrap()
        .clean_source;
    assert_eq!(once, twice);
}

#[test]
fn test_invocations_become_comment_placeholders() {
    let source = "@define f() { return \"0\" }\n@f\nint z;\n";
    let prepared = session()
        .prepare_source(source, Path::new("t.cup"))
        .unwrap();
    assert!(prepared.clean_source.contains("/*@f*/"));
    assert_eq!(prepared.invocations.len(), 1);
    let invocation = &prepared.invocations[0];
    assert_eq!(invocation.name, "f");
    assert_eq!(invocation.line, 2);
    assert_eq!(
        &prepared.clean_source[invocation.start..invocation.end],
        "/*@f*/"
    );
}

#[test]
fn test_invocation_arguments_stay_raw() {
    let source = "@define add(a, b) { return a }\nint w = @add(f(1, 2), {3, 4});\n";
    let prepared = session()
        .prepare_source(source, Path::new("t.cup"))
        .unwrap();
    assert_eq!(prepared.invocations.len(), 1);
    assert_eq!(
        prepared.invocations[0].args,
        vec!["f(1, 2)".to_owned(), "{3, 4}".to_owned()]
    );
}

#[test]
fn test_directives_in_comments_and_strings_are_ignored() {
    let source = "// @define nope() {}\nchar *s = \"@define nope() {}\";\n";
    let prepared = session()
        .prepare_source(source, Path::new("t.cup"))
        .unwrap();
    assert_eq!(prepared.clean_source, source);
    assert!(prepared.invocations.is_empty());
}

#[test]
fn test_unknown_names_are_left_alone() {
    let source = "int q; /* mail: someone@example.com */ @unknown(1)\n";
    let prepared = session()
        .prepare_source(source, Path::new("t.cup"))
        .unwrap();
    assert_eq!(prepared.clean_source, source);
    assert!(prepared.invocations.is_empty());
}

#[test]
fn test_split_args_honors_nesting_and_strings() {
    assert_eq!(split_args("a, f(x, y), {1, 2}"), ["a", "f(x, y)", "{1, 2}"]);
    assert_eq!(split_args("\"a,b\", c"), ["\"a,b\"", "c"]);
    assert_eq!(split_args("  lone  "), ["lone"]);
    assert!(split_args("").is_empty());
}

#[test]
fn test_malformed_define_reports_parse_error() {
    let source = "@define broken\nint x;\n";
    let session = session();
    let _ = session.prepare_source(source, Path::new("t.cup")).unwrap();
    assert!(session.diagnostics().has_kind("ParseError"));
}
