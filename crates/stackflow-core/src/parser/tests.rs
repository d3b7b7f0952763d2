use super::*;
use crate::error::StackError;
use serde_json::json;
use stackflow_engine::{
    ConfigError, DataValues, Expr, Function, InstanceAddress, InstanceKey, IterationRef, Reference,
    Repetition, ResourceGraph, ResourceId,
};
use std::collections::BTreeSet;

fn id(resource_type: &str, name: &str) -> ResourceId {
    ResourceId::new(resource_type, name)
}

#[test]
fn test_parse_simple_resource() {
    let kdl = r#"
        project "demo"

        resource "local_file" "readme" {
            path "out/README.md"
            content "hello"
            mode 420
        }
    "#;

    let stack = parse_stack_string(kdl, "test".to_string()).unwrap();
    assert_eq!(stack.name, "demo");
    assert_eq!(stack.resource_count(), 1);

    let readme = stack.resources.get(&id("local_file", "readme")).unwrap();
    assert_eq!(readme.attributes["path"], Expr::literal("out/README.md"));
    assert_eq!(readme.attributes["mode"], Expr::literal(420));
    assert!(readme.repetition.is_none());
}

#[test]
fn test_default_project_name() {
    let stack = parse_stack_string("", "fallback".to_string()).unwrap();
    assert_eq!(stack.name, "fallback");
    assert!(stack.resources.is_empty());
}

#[test]
fn test_references_are_typed() {
    let kdl = r#"
        resource "local_directory" "out" {
            path "out"
        }
        resource "local_file" "config" {
            path "${local_directory.out.path}/config.txt"
        }
    "#;

    let stack = parse_stack_string(kdl, "test".to_string()).unwrap();
    let config = stack.resources.get(&id("local_file", "config")).unwrap();
    assert_eq!(
        config.attributes["path"],
        Expr::call(
            Function::Concat,
            vec![
                Expr::reference(Reference::to("local_directory", "out", "path")),
                Expr::literal("/config.txt"),
            ]
        )
    );
    assert_eq!(
        config.attributes["path"].references(),
        vec![&Reference::to("local_directory", "out", "path")]
    );
}

#[test]
fn test_count_and_for_each() {
    let kdl = r#"
        resource "local_file" "page" {
            count 3
            path "page-${count.index}.txt"
        }
        resource "local_file" "env" {
            for_each "dev" "prod"
            path "${each.key}.env"
        }
        resource "local_file" "region" {
            for_each {
                eu "eu-west-1"
                us "us-east-1"
            }
            content "${each.value}"
        }
    "#;

    let stack = parse_stack_string(kdl, "test".to_string()).unwrap();
    let page = stack.resources.get(&id("local_file", "page")).unwrap();
    assert_eq!(page.repetition, Some(Repetition::Count(3)));
    assert_eq!(page.expansion_count(), 3);

    let env = stack.resources.get(&id("local_file", "env")).unwrap();
    match &env.repetition {
        Some(Repetition::ForEach(items)) => {
            assert_eq!(items.keys().collect::<Vec<_>>(), vec!["dev", "prod"]);
            assert_eq!(items["dev"], json!("dev"));
        }
        other => panic!("expected for_each, got {:?}", other),
    }

    let region = stack.resources.get(&id("local_file", "region")).unwrap();
    match &region.repetition {
        Some(Repetition::ForEach(items)) => assert_eq!(items["us"], json!("us-east-1")),
        other => panic!("expected for_each, got {:?}", other),
    }
    assert_eq!(
        region.attributes["content"],
        Expr::Iteration(IterationRef::EachValue)
    );
}

#[test]
fn test_count_and_for_each_are_exclusive() {
    let kdl = r#"
        resource "local_file" "x" {
            count 2
            for_each "a"
        }
    "#;
    let err = parse_stack_string(kdl, "test".to_string()).unwrap_err();
    assert!(err.to_string().contains("cannot use both count and for_each"));
}

#[test]
fn test_count_from_variable() {
    let kdl = r#"
        variables {
            replicas 2
        }
        resource "local_file" "page" {
            count "${var.replicas}"
        }
    "#;
    let stack = parse_stack_string(kdl, "test".to_string()).unwrap();
    let page = stack.resources.get(&id("local_file", "page")).unwrap();
    assert_eq!(page.repetition, Some(Repetition::Count(2)));
}

#[test]
fn test_count_must_be_constant() {
    let kdl = r#"
        resource "random_id" "n" {}
        resource "local_file" "page" {
            count "${random_id.n.dec}"
        }
    "#;
    let err = parse_stack_string(kdl, "test".to_string()).unwrap_err();
    assert!(err.to_string().contains("known before planning"));
}

#[test]
fn test_lifecycle_and_depends_on() {
    let kdl = r#"
        resource "local_directory" "out" {
            path "out"
        }
        resource "local_file" "config" {
            path "out/config.txt"
            depends_on "local_directory.out"
            lifecycle {
                create_before_destroy #true
                prevent_destroy
                ignore_changes "content" "mode"
            }
        }
    "#;

    let stack = parse_stack_string(kdl, "test".to_string()).unwrap();
    let config = stack.resources.get(&id("local_file", "config")).unwrap();
    assert!(config.depends_on.contains(&id("local_directory", "out")));
    assert!(config.lifecycle.create_before_destroy);
    assert!(config.lifecycle.prevent_destroy);
    assert_eq!(
        config.lifecycle.ignore_changes,
        BTreeSet::from(["content".to_string(), "mode".to_string()])
    );
    assert!(!config.attributes.contains_key("lifecycle"));
    assert!(!config.attributes.contains_key("depends_on"));
}

#[test]
fn test_bad_depends_on() {
    let kdl = r#"
        resource "local_file" "config" {
            depends_on "not-an-address"
        }
    "#;
    let err = parse_stack_string(kdl, "test".to_string()).unwrap_err();
    assert!(matches!(err, StackError::InvalidConfig(_)));
    assert!(err.to_string().contains("resource.local_file.config.depends_on"));
}

#[test]
fn test_data_and_outputs() {
    let kdl = r#"
        data "local_file" "seed" {
            path "seed.txt"
        }
        resource "local_file" "copy" {
            path "copy.txt"
            content "${data.local_file.seed.content}"
        }
        output "copy_path" {
            value "${local_file.copy.path}"
        }
        output "greeting" "hello"
    "#;

    let stack = parse_stack_string(kdl, "test".to_string()).unwrap();
    let seed = &stack.resources.data[&id("local_file", "seed")];
    assert_eq!(seed.query["path"], json!("seed.txt"));

    assert_eq!(
        stack.resources.outputs["copy_path"],
        Expr::reference(Reference::to("local_file", "copy", "path"))
    );
    assert_eq!(stack.resources.outputs["greeting"], Expr::literal("hello"));
}

#[test]
fn test_data_query_cannot_reference_resources() {
    let kdl = r#"
        resource "local_file" "a" {
            path "a.txt"
        }
        data "local_file" "seed" {
            path "${local_file.a.path}"
        }
    "#;
    let err = parse_stack_string(kdl, "test".to_string()).unwrap_err();
    assert!(err.to_string().contains("data is read before planning"));
}

#[test]
fn test_variable_overrides() {
    let kdl = r#"
        variables {
            prefix "demo"
        }
        resource "local_file" "a" {
            path "${var.prefix}.txt"
        }
    "#;

    let mut overrides = Variables::new();
    overrides.insert("prefix".to_string(), json!("prod"));
    let stack = parse_stack_string_with_variables(kdl, "test".to_string(), &overrides).unwrap();
    assert_eq!(stack.variables["prefix"], json!("prod"));

    let a = stack.resources.get(&id("local_file", "a")).unwrap();
    assert_eq!(
        a.attributes["path"],
        Expr::call(Function::Concat, vec![Expr::literal("prod"), Expr::literal(".txt")])
    );
}

#[test]
fn test_expression_error_names_location() {
    let kdl = r#"
        resource "local_file" "a" {
            path "${var.nope}"
        }
    "#;
    let err = parse_stack_string(kdl, "test".to_string()).unwrap_err();
    match err {
        StackError::Expression { location, source } => {
            assert_eq!(location, "resource.local_file.a.path");
            assert!(source.message.contains("undefined variable"));
        }
        other => panic!("expected expression error, got {:?}", other),
    }
}

#[test]
fn test_duplicate_resource() {
    let kdl = r#"
        resource "local_file" "a" {}
        resource "local_file" "a" {}
    "#;
    let err = parse_stack_string(kdl, "test".to_string()).unwrap_err();
    assert!(matches!(
        err,
        StackError::Config(ConfigError::DuplicateResource(_))
    ));
}

#[test]
fn test_duplicate_attribute() {
    let kdl = r#"
        resource "local_file" "a" {
            path "x"
            path "y"
        }
    "#;
    let err = parse_stack_string(kdl, "test".to_string()).unwrap_err();
    assert!(err.to_string().contains("set more than once"));
}

#[test]
fn test_invalid_kdl() {
    let err = parse_stack_string("resource \"a\" {", "test".to_string()).unwrap_err();
    assert!(matches!(err, StackError::KdlParse(_)));
}

#[test]
fn test_parsed_stack_builds_a_graph() {
    let kdl = r#"
        resource "local_directory" "out" {
            path "out"
        }
        resource "local_file" "page" {
            count 2
            path "${local_directory.out.path}/page-${count.index}.txt"
        }
        resource "local_file" "index" {
            path "out/index.txt"
            content "${join(\",\", local_file.page.path)}"
        }
    "#;

    let stack = parse_stack_string(kdl, "test".to_string()).unwrap();
    let graph = ResourceGraph::build(&stack.resources, &DataValues::new()).unwrap();
    assert_eq!(graph.len(), 4);

    let out = InstanceAddress::single("local_directory", "out");
    let page1 = InstanceAddress::new(id("local_file", "page"), Some(InstanceKey::Index(1)));
    let index = InstanceAddress::single("local_file", "index");
    assert!(graph.dependencies(&page1).any(|d| *d == out));
    assert_eq!(graph.dependencies(&index).count(), 2);
    assert_eq!(graph.order().first(), Some(&out));
    assert_eq!(graph.order().last(), Some(&index));
}

#[test]
fn test_parse_stack_file_uses_directory_name() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("website");
    std::fs::create_dir_all(project.join(".stackflow")).unwrap();
    let path = project.join(".stackflow/stack.kdl");
    std::fs::write(&path, "resource \"local_file\" \"a\" {\n path \"a\"\n}\n").unwrap();

    let stack = parse_stack_file(&path, &Variables::new()).unwrap();
    assert_eq!(stack.name, "website");
    assert_eq!(stack.resource_count(), 1);
}
