use std::fs;

use tempfile::TempDir;

use crate::config::{load_config_file, substitute_env};

#[test]
fn test_extends_chain_merges_parent_first() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("base");
    let child = dir.path().join("child");
    fs::create_dir_all(&base).unwrap();
    fs::create_dir_all(&child).unwrap();
    fs::write(
        base.join("upp.json"),
        r#"{ "includePaths": ["base_inc"], "comments": true }"#,
    )
    .unwrap();
    fs::write(
        child.join("upp.json"),
        r#"{ "extends": "../base/upp.json", "includePaths": ["child_inc"], "comments": false }"#,
    )
    .unwrap();

    let merged = load_config_file(&child.join("upp.json")).unwrap();
    assert_eq!(merged.include_paths.len(), 2);
    assert!(merged.include_paths[0].ends_with("base_inc"));
    assert!(merged.include_paths[1].ends_with("child_inc"));
    // the nearest file wins scalars
    assert!(!merged.comments);
}

#[test]
fn test_extends_cycle_is_an_error() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("upp.json"),
        r#"{ "extends": "upp.json" }"#,
    )
    .unwrap();
    assert!(load_config_file(&dir.path().join("upp.json")).is_err());
}

#[test]
fn test_upp_environment_variable_is_substituted() {
    std::env::set_var("UPP", "/opt/upp");
    assert_eq!(substitute_env("${UPP}/lib"), "/opt/upp/lib");
    assert_eq!(substitute_env("$UPP/lib"), "/opt/upp/lib");
}
