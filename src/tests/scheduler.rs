use crate::tests::transpile;

#[test]
fn test_rule_fires_once_per_node_instance() {
    let (output, session) = transpile(
        "@define stay() { upp.withPattern('identifier', function(n) \
           if n.text == 'x' then return 'x' end end) }\n\
         @stay\n\
         int x;\n",
    );
    assert!(output.contains("int x"));
    assert!(!session.diagnostics().has_kind("RuleNonConvergence"));
}

#[test]
fn test_mutually_triggering_rules_hit_the_cap() {
    let (_, session) = transpile(
        "@define pingpong() {\n\
           upp.withPattern('identifier', function(n) \
             if n.text == 'x' then return 'y' end end)\n\
           upp.withPattern('identifier', function(n) \
             if n.text == 'y' then return 'x' end end)\n\
         }\n\
         @pingpong\n\
         int x;\n",
    );
    assert!(session.diagnostics().has_kind("RuleNonConvergence"));
}

#[test]
fn test_rules_dispatch_in_registration_order() {
    let (output, _) = transpile(
        "@define order() {\n\
           upp.withPattern('identifier', function(n) \
             if n.text == 'a' then return 'first' end end)\n\
           upp.withPattern('identifier', function(n) \
             if n.text == 'a' then return 'second' end end)\n\
         }\n\
         @order\n\
         int a;\n",
    );
    assert!(output.contains("first"));
    assert!(!output.contains("second"));
}

#[test]
fn test_transformer_macro_receives_following_node() {
    let (output, session) = transpile(
        "@define kindof(node) { upp.consume() return '/* ' .. node.type .. ' */' }\n\
         @kindof\n\
         int q;\n",
    );
    assert!(output.contains("declaration"));
    assert!(!output.contains("int q;"));
    assert!(session.diagnostics().is_empty());
}

#[test]
fn test_failing_macro_body_reports_and_walk_continues() {
    let (output, session) = transpile(
        "@define boom() { error('kaboom') }\n\
         @boom\n\
         int x;\n",
    );
    assert!(session.diagnostics().has_kind("MacroBodyError"));
    assert!(output.contains("int x;"));
}

#[test]
fn test_arity_mismatch_is_reported_before_any_edit() {
    let (output, session) = transpile(
        "@define two(a, b) { upp.consume() return '' }\n\
         @two(1)\n\
         int keep_me;\n",
    );
    assert!(session.diagnostics().has_kind("ArityError"));
    assert!(output.contains("int keep_me;"));
}

#[test]
fn test_rules_registered_mid_walk_fire_in_final_sweep() {
    let (output, _) = transpile(
        "@define late() {\n\
           upp.withPattern('number_literal', function(n) \
             if n.text == '7' then return '42' end end)\n\
         }\n\
         int before = 7;\n\
         @late\n\
         int after = 7;\n",
    );
    // the rule lands mid-walk; the fixed-point sweep still reaches the
    // literal the walk had already passed
    assert!(output.contains("int after = 42;"));
    assert!(output.contains("int before = 42;"));
}

#[test]
fn test_hoist_lands_after_leading_preproc_block() {
    let (output, _) = transpile(
        "#include <stdio.h>\n\
         @define h() { upp.hoist('int hoisted;') }\n\
         @h\n\
         int main(void) { return 0; }\n",
    );
    let include_at = output.find("#include <stdio.h>").unwrap();
    let hoisted_at = output.find("int hoisted;").unwrap();
    let main_at = output.find("int main").unwrap();
    assert!(include_at < hoisted_at);
    assert!(hoisted_at < main_at);
}

#[test]
fn test_unique_identifiers_are_monotonic() {
    let (output, _) = transpile(
        "@define uniq() { return 'int ' .. upp.createUniqueIdentifier('tmp') .. ';' }\n\
         @uniq\n\
         @uniq\n",
    );
    assert!(output.contains("tmp_0"));
    assert!(output.contains("tmp_1"));
}
