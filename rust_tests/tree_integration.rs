//! Integration tests for tree building and mode propagation

use tickrun::builder::{build_tree, Source};
use tickrun::tree::{Mode, TestTree};

fn mode_of(tree: &TestTree, path: &str) -> Mode {
    let id = tree
        .find_by_path(path)
        .unwrap_or_else(|| panic!("no node at {path}"));
    tree.node(id).mode
}

#[test]
fn test_paths_join_source_blocks_and_tests() {
    let tree = build_tree(&[Source::new("world", |s| {
        s.describe("spawning", |s| {
            s.test("spawns a unit", |_| Ok(()));
            Ok(())
        });
        Ok(())
    })]);

    let id = tree
        .find_by_path("world > spawning > spawns a unit")
        .expect("Should find test by full path");
    assert!(tree.node(id).is_test());
    assert_eq!(tree.ancestors(id).len(), 3, "spawning, world, root");
}

#[test]
fn test_skip_dominates_nested_only() {
    let tree = build_tree(&[Source::new("f", |s| {
        s.describe_skip("skipped", |s| {
            s.test("focused inside", |_| Ok(())).only();
            s.describe("deeper", |s| {
                s.test("plain", |_| Ok(()));
                Ok(())
            });
            Ok(())
        });
        Ok(())
    })]);

    assert_eq!(mode_of(&tree, "f > skipped > focused inside"), Mode::Skip);
    assert_eq!(mode_of(&tree, "f > skipped > deeper > plain"), Mode::Skip);
    assert!(tree.has_focus(), "Any declared only sets the focus flag");
}

#[test]
fn test_only_block_promotes_descendants() {
    let tree = build_tree(&[Source::new("f", |s| {
        s.describe_only("focus", |s| {
            s.test("a", |_| Ok(()));
            s.test("b", |_| Ok(())).skip();
            s.describe("inner", |s| {
                s.test("c", |_| Ok(()));
                Ok(())
            });
            Ok(())
        });
        s.test("outside", |_| Ok(()));
        Ok(())
    })]);

    assert_eq!(mode_of(&tree, "f > focus > a"), Mode::Only);
    assert_eq!(mode_of(&tree, "f > focus > b"), Mode::Skip);
    assert_eq!(mode_of(&tree, "f > focus > inner > c"), Mode::Only);
    assert_eq!(mode_of(&tree, "f > outside"), Mode::Normal);
}

#[test]
fn test_nested_only_narrows_focus() {
    let tree = build_tree(&[Source::new("f", |s| {
        s.describe_only("focus", |s| {
            s.test("a", |_| Ok(()));
            s.test("b", |_| Ok(())).only();
            Ok(())
        });
        Ok(())
    })]);

    assert_eq!(mode_of(&tree, "f > focus > a"), Mode::Normal);
    assert_eq!(mode_of(&tree, "f > focus > b"), Mode::Only);
}

#[test]
fn test_failing_describe_body_prunes_children() {
    let tree = build_tree(&[Source::new("f", |s| {
        s.describe("broken", |s| {
            s.test("never runs", |_| Ok(()));
            anyhow::bail!("definition exploded")
        });
        s.test("still here", |_| Ok(()));
        Ok(())
    })]);

    let broken = tree.find_by_path("f > broken").expect("Block should exist");
    assert!(tree.children(broken).is_empty());
    assert_eq!(tree.node(broken).errors.len(), 1);
    assert!(tree.node(broken).errors[0].contains("definition exploded"));
    assert!(tree.find_by_path("f > still here").is_some());
}

#[test]
fn test_each_names_cases() {
    let tree = build_tree(&[Source::new("f", |s| {
        s.test_each("speed {}", [1, 2], |_, _| Ok(()));
        s.test_each("level", ["easy"], |_, _| Ok(()));
        Ok(())
    })]);

    assert!(tree.find_by_path("f > speed 1").is_some());
    assert!(tree.find_by_path("f > speed 2").is_some());
    assert!(tree.find_by_path("f > level easy").is_some());
}

#[test]
fn test_tags_inherit_from_blocks() {
    let tree = build_tree(&[Source::new("f", |s| {
        s.tags(["world"]);
        s.describe("slow things", |s| {
            s.tags(["slow"]);
            s.test("t", |_| Ok(())).tags(["net"]);
            Ok(())
        });
        Ok(())
    })]);

    let id = tree.find_by_path("f > slow things > t").unwrap();
    let tags: Vec<String> = tree.effective_tags(id).into_iter().collect();
    assert_eq!(tags, vec!["net", "slow", "world"]);
}
