//! Failed-first ordering
//!
//! Tests that failed last run, and every block containing one, move ahead
//! of their siblings. Sorting is stable and each block is sorted at most once.

use crate::tree::{NodeId, TestTree};
use std::collections::BTreeSet;

/// Reorder the whole tree so previously failed tests run first.
/// Returns true if any node matched.
pub fn reorder_failed_first(tree: &mut TestTree, failed: &BTreeSet<String>) -> bool {
    if failed.is_empty() {
        return false;
    }
    let root = tree.root();
    let mut marked = BTreeSet::new();
    mark(tree, root, failed, &mut marked);
    if marked.is_empty() {
        return false;
    }
    sort(tree, root, &marked);
    true
}

/// Mark tests in the failed set and every block with a marked descendant
fn mark(tree: &TestTree, id: NodeId, failed: &BTreeSet<String>, marked: &mut BTreeSet<NodeId>) -> bool {
    let node = tree.node(id);
    let hit = if node.is_test() {
        failed.contains(&node.path)
    } else {
        let mut any = false;
        for child in tree.children(id) {
            any |= mark(tree, *child, failed, marked);
        }
        any
    };
    if hit {
        marked.insert(id);
    }
    hit
}

fn sort(tree: &mut TestTree, id: NodeId, marked: &BTreeSet<NodeId>) {
    let Some(block) = tree.node(id).as_block() else {
        return;
    };
    let mut children = block.children.clone();
    if !block.reordered {
        children.sort_by_key(|c| (!marked.contains(c), tree.node(*c).index_in_parent));
        tree.reorder_children(id, children.clone());
    }
    for child in children {
        if marked.contains(&child) {
            sort(tree, child, marked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_tree, Source};

    fn tree() -> TestTree {
        build_tree(&[Source::new("f", |s| {
            s.test("a", |_| Ok(()));
            s.describe("group", |s| {
                s.test("x", |_| Ok(()));
                s.test("y", |_| Ok(()));
                Ok(())
            });
            s.test("b", |_| Ok(()));
            Ok(())
        })])
    }

    fn order(tree: &TestTree) -> Vec<String> {
        tree.preorder()
            .into_iter()
            .filter(|id| tree.node(*id).is_test())
            .map(|id| tree.node(id).path.clone())
            .collect()
    }

    fn set(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_failed_tests_and_ancestors_move_first() {
        let mut tree = tree();
        assert!(reorder_failed_first(&mut tree, &set(&["f > b", "f > group > y"])));
        assert_eq!(
            order(&tree),
            vec!["f > group > y", "f > group > x", "f > b", "f > a"]
        );
    }

    #[test]
    fn test_reorder_is_idempotent() {
        let mut tree = tree();
        let failed = set(&["f > group > y"]);
        reorder_failed_first(&mut tree, &failed);
        let first = order(&tree);
        reorder_failed_first(&mut tree, &failed);
        assert_eq!(order(&tree), first);
    }

    #[test]
    fn test_unknown_paths_leave_order_alone() {
        let mut tree = tree();
        assert!(!reorder_failed_first(&mut tree, &set(&["f > gone"])));
        assert_eq!(
            order(&tree),
            vec!["f > a", "f > group > x", "f > group > y", "f > b"]
        );
    }
}
