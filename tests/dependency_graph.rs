// tests/dependency_graph.rs
mod common;
use crate::common::{init_tracing, unit};

use builddag::dag::DependencyGraph;
use builddag::errors::BuilddagError;

#[test]
fn layers_follow_longest_dependency_chain() {
    init_tracing();

    let graph = DependencyGraph::build(vec![
        unit("core", &[]),
        unit("util", &[]),
        unit("net", &["core"]),
        unit("cli", &["net", "util"]),
    ])
    .unwrap();

    assert_eq!(graph.len(), 4);
    assert_eq!(graph.layer("core"), Some(0));
    assert_eq!(graph.layer("util"), Some(0));
    assert_eq!(graph.layer("net"), Some(1));
    assert_eq!(graph.layer("cli"), Some(2));

    let layers = graph.ids_by_layer();
    assert_eq!(layers[&0], vec!["core".to_string(), "util".to_string()]);
    assert_eq!(layers[&2], vec!["cli".to_string()]);

    assert_eq!(graph.roots(), vec!["core".to_string(), "util".to_string()]);
}

#[test]
fn dependents_are_tracked_transitively() {
    let graph = DependencyGraph::build(vec![
        unit("a", &[]),
        unit("b", &["a"]),
        unit("c", &["b"]),
        unit("d", &[]),
    ])
    .unwrap();

    assert_eq!(graph.dependents_of("a"), &["b".to_string()]);

    let blocked: Vec<String> = graph.transitive_dependents("a").into_iter().collect();
    assert_eq!(blocked, vec!["b".to_string(), "c".to_string()]);
    assert!(graph.transitive_dependents("d").is_empty());
}

#[test]
fn cycle_reports_every_member() {
    let err = DependencyGraph::build(vec![
        unit("a", &["c"]),
        unit("b", &["a"]),
        unit("c", &["b"]),
        unit("ok", &[]),
    ])
    .unwrap_err();

    match err {
        BuilddagError::CycleDetected { members } => {
            assert_eq!(members, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        }
        other => panic!("expected cycle error, got {other:?}"),
    }
}

#[test]
fn self_dependency_is_a_cycle() {
    let err = DependencyGraph::build(vec![unit("loop", &["loop"])]).unwrap_err();
    assert!(
        matches!(err, BuilddagError::CycleDetected { ref members } if members == &["loop".to_string()]),
        "unexpected error: {err:?}"
    );
}

#[test]
fn duplicate_ids_are_rejected() {
    let err = DependencyGraph::build(vec![unit("a", &[]), unit("a", &[])]).unwrap_err();
    assert!(matches!(err, BuilddagError::DuplicateUnit(ref id) if id == "a"));
}

#[test]
fn unknown_dependencies_are_external() {
    let graph = DependencyGraph::build(vec![unit("app", &["libfoo", "core"]), unit("core", &[])])
        .unwrap();

    assert_eq!(graph.external_dependencies_of("app"), &["libfoo".to_string()]);
    assert_eq!(graph.dependencies_of("app").len(), 2);
    // External dependencies do not push a unit into a later layer.
    assert_eq!(graph.layer("app"), Some(1));
}

#[test]
fn adding_a_unit_that_closes_a_cycle_leaves_graph_untouched() {
    let graph = DependencyGraph::build(vec![unit("a", &["b"])]).unwrap();

    // "b" was external; adding it with a dependency on "a" closes a -> b -> a.
    let err = graph.with_unit(unit("b", &["a"])).unwrap_err();
    assert!(matches!(err, BuilddagError::CycleDetected { .. }));
    assert_eq!(graph.len(), 1);
    assert!(!graph.contains("b"));

    let grown = graph.with_unit(unit("b", &[])).unwrap();
    assert_eq!(grown.len(), 2);
    assert_eq!(grown.layer("a"), Some(1));
}
