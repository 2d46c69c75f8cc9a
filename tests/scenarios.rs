use std::{fs, path::Path};

use tempfile::TempDir;
use upp::{Config, ConfigBuilder, Session};

fn transpile(source: &str) -> (String, Session) {
    let session = Session::new(Config::default()).unwrap();
    let output = session
        .transpile_source(source, Path::new("scenario.cup"))
        .unwrap();
    (output, session)
}

fn squeeze(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[test]
fn test_trace_macro_rebuilds_the_function() {
    let (output, _) = transpile(
        r#"@define trace() {
  local fn = upp.consume('function_definition')
  local s = upp.getFunctionSignature(fn)
  local kids = fn:childForFieldName('body').children
  local stmts = {}
  for i = 2, #kids - 1 do stmts[#stmts + 1] = kids[i] end
  return upp.code('${ret} ${name}${params} { puts("Entering ${name}"); ${stmts} }', {
    ret = s.returnType, name = s.name, params = s.params, stmts = stmts,
  })
}
@trace
int f(int x) { return x + 1; }
"#,
    );
    let flat = squeeze(&output);
    assert!(flat.contains(r#"int f(int x) { puts("Entering f"); return x + 1; }"#));
    assert!(!output.contains('@'));
}

#[test]
fn test_pattern_rule_braces_bare_if_bodies() {
    let (output, _) = transpile(
        r#"@define brace() {
  upp.withMatch(upp.root, "if ($c) $t__NOT_compound_statement;", function(m)
    return upp.code("if (${c}) { ${t} }", { c = m.c, t = m.t })
  end)
}
@brace
int g(int x) { if (x) return 1; if (x > 0) { return 2; } }
"#,
    );
    let flat = squeeze(&output);
    assert!(flat.contains("if (x) { return 1; }"));
    assert!(flat.contains("if (x > 0) { return 2; }"));
    assert!(!output.contains('@'));
}

#[test]
fn test_included_file_installs_rule_on_the_includer() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a.cup");
    let b = dir.path().join("b.cup");
    fs::write(
        &a,
        r#"@define rename() {
  upp.registerParentTransform('identifier', function(n)
    if n.text == 'add' then return 'mod_add' end
  end)
}
@rename
"#,
    )
    .unwrap();
    fs::write(
        &b,
        r#"@include "a.cup"
int add(int x, int y) { return x + y; }
int call(void) { return add(1, 2); }
"#,
    )
    .unwrap();

    let a_before = fs::read_to_string(&a).unwrap();
    let session = Session::new(Config::default()).unwrap();
    let output = session.transpile_file(&b).unwrap();

    assert!(output.contains("int mod_add(int x, int y)"));
    assert!(output.contains("return mod_add(1, 2);"));
    assert!(!output.contains('@'));
    // the dependency itself is untouched
    assert_eq!(fs::read_to_string(&a).unwrap(), a_before);
}

#[test]
fn test_consume_mismatch_reports_and_continues() {
    let (output, session) = transpile(
        "@define needBlock() { upp.consume('compound_statement', 'need a block') }\n\
         @needBlock\n\
         int x;\n",
    );
    assert!(session.diagnostics().has_kind("ConsumeMismatch"));
    assert!(session
        .diagnostics()
        .entries()
        .iter()
        .any(|diagnostic| diagnostic.message.contains("need a block")));
    assert!(output.contains("int x;"));
}

#[test]
fn test_chained_invocations_converge_in_one_pass() {
    let (output, session) = transpile(
        r#"@define inner(n) { return tostring(tonumber(n) * 2) }
@define outer(n) {
  local marker = upp.consume('comment')
  local arg = string.match(marker.text, "@inner%((%d+)%)")
  return "int x = @inner(" .. tostring(tonumber(n) + tonumber(arg)) .. ");"
}
@outer(20) @inner(10)
"#,
    );
    let flat = squeeze(&output);
    assert!(flat.contains("int x = 60"), "got: {flat}");
    assert!(!output.contains('@'));
    assert!(!session.diagnostics().has_kind("RuleNonConvergence"));
}

#[test]
fn test_identity_survives_code_interpolation() {
    let (output, _) = transpile(
        r#"@define wrapit() {
  local fn = upp.consume('function_definition')
  local body = fn:childForFieldName('body')
  upp.withNode(body, function(n)
    upp.hoist("int hoisted;")
  end)
  return upp.code("${f}", { f = fn })
}
@wrapit
int h(void) { return 3; }
"#,
    );
    assert_eq!(output.matches("int hoisted;").count(), 1);
    assert!(output.contains("return 3;"));
}

#[test]
fn test_with_references_renames_uses_but_not_the_definition() {
    let (output, _) = transpile(
        r#"@define renameUses() {
  local fn = upp.nextNode('function_definition')
  local def = fn:childForFieldName('declarator'):childForFieldName('declarator')
  upp.withReferences(def, function(n)
    if not (n == def) then return 'addx' end
  end)
}
@renameUses
int add(int a, int b) { return a + b; }
int use(void) { return add(1, 2); }
"#,
    );
    assert!(output.contains("int add(int a, int b)"));
    assert!(output.contains("return addx(1, 2);"));
}

#[test]
fn test_consume_options_object_validates_before_removing() {
    let (output, session) = transpile(
        r#"@define guarded() {
  upp.consume({
    type = 'function_definition',
    validate = function(n) return string.find(n.text, 'static') ~= nil end,
    message = 'needs static',
  })
}
@guarded
int plain(void) { return 0; }
"#,
    );
    assert!(session.diagnostics().has_kind("ConsumeMismatch"));
    assert!(session
        .diagnostics()
        .entries()
        .iter()
        .any(|diagnostic| diagnostic.message.contains("needs static")));
    // validation failed, so nothing was removed
    assert!(output.contains("int plain(void) { return 0; }"));
}

#[test]
fn test_match_all_counts_structural_hits() {
    let (output, _) = transpile(
        "@define countCalls() { return 'int calls = ' .. tostring(#upp.matchAll(\"g($n)\")) .. ';' }\n\
         @countCalls\n\
         void f(void) { g(1); g(2); h(3); }\n",
    );
    assert!(output.contains("int calls = 2;"));
}

#[test]
fn test_query_reaches_the_grammar_matcher() {
    let (output, _) = transpile(
        "@define q() { return 'int ids = ' .. tostring(#upp.query('((identifier) @id)')) .. ';' }\n\
         @q\n\
         int alpha;\n",
    );
    assert!(output.contains("int ids = 1;"));
}

#[test]
fn test_helper_error_carries_the_node_position() {
    let (output, session) = transpile(
        "@define complain() {\n\
           local target = upp.nextNode()\n\
           upp.error(target, 'not allowed here')\n\
         }\n\
         @complain\n\
         int bad;\n",
    );
    assert!(session.diagnostics().has_kind("MacroBodyError"));
    assert!(session
        .diagnostics()
        .entries()
        .iter()
        .any(|diagnostic| diagnostic.message.contains("not allowed here") && diagnostic.line > 0));
    assert!(output.contains("int bad;"));
}

#[test]
fn test_comments_mode_keeps_invocation_markers() {
    let session = Session::new(
        ConfigBuilder::default()
            .comments(true)
            .build()
            .unwrap(),
    )
    .unwrap();
    let output = session
        .transpile_source(
            "@define tag() { }\n\
             @tag\n\
             int x;\n",
            Path::new("scenario.cup"),
        )
        .unwrap();
    // a result-less invocation leaves its marker when comments are on
    assert!(output.contains("/*@tag*/"));
    assert!(output.contains("int x;"));
}

#[test]
fn test_macro_free_sources_pass_through() {
    let source = "#include <stdio.h>\n\nint main(void) {\n    return 0;\n}\n";
    let (output, session) = transpile(source);
    assert_eq!(output, source);
    assert!(session.diagnostics().is_empty());
}

#[test]
fn test_macros_only_include_leaves_no_residue() {
    let dir = TempDir::new().unwrap();
    let library = dir.path().join("lib.hup");
    let user = dir.path().join("main.cup");
    fs::write(
        &library,
        "@define twice(v) { return '(' .. v .. ' + ' .. v .. ')' }\n",
    )
    .unwrap();
    fs::write(
        &user,
        "@include \"lib.hup\"\nint y = @twice(3);\n",
    )
    .unwrap();

    let session = Session::new(Config::default()).unwrap();
    let output = session.transpile_file(&user).unwrap();
    let flat = squeeze(&output);
    assert!(flat.contains("int y = (3 + 3);"), "got: {flat}");
    assert!(!output.contains("#include"));
    assert!(!output.contains('@'));
}
