//! Test Tree Model
//!
//! Describe blocks and tests live in an arena addressed by [`NodeId`].
//! Parent links are plain ids into the same arena, so the tree never forms
//! reference-counted cycles. Child order is declaration order (and later
//! execution order) unless failed-first reordering permutes it.

use crate::context::TestContext;
use crate::protocol::SourceLocation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

/// Body of one test part
pub type TestFn = Rc<dyn Fn(&mut TestContext<'_>) -> anyhow::Result<()>>;
/// Body of a hook
pub type HookFn = Rc<dyn Fn() -> anyhow::Result<()>>;

pub const PATH_SEPARATOR: &str = " > ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Declared or effective execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    Normal,
    Skip,
    Only,
    Todo,
}

/// Effective mode of a child, given its parent's effective mode.
///
/// Skip dominates everything below it. A focused parent promotes all of
/// its children unless something beneath it declares `only` itself, in
/// which case focus narrows to those declarations.
pub fn effective_mode(parent: Mode, parent_has_nested_only: bool, declared: Mode) -> Mode {
    match (parent, declared) {
        (Mode::Skip, _) | (_, Mode::Skip) => Mode::Skip,
        (_, Mode::Todo) => Mode::Todo,
        (_, Mode::Only) => Mode::Only,
        (Mode::Only, _) if !parent_has_nested_only => Mode::Only,
        _ => Mode::Normal,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookKind {
    BeforeAll,
    AfterAll,
    BeforeEach,
    AfterEach,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HookKind::BeforeAll => "beforeAll",
            HookKind::AfterAll => "afterAll",
            HookKind::BeforeEach => "beforeEach",
            HookKind::AfterEach => "afterEach",
        })
    }
}

#[derive(Clone)]
pub struct Hook {
    pub kind: HookKind,
    pub func: HookFn,
    pub source: Option<SourceLocation>,
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("kind", &self.kind)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// A contiguous segment of a test body, split at host reload points
#[derive(Clone)]
pub struct Part {
    pub func: TestFn,
    pub source: Option<SourceLocation>,
}

impl fmt::Debug for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Part")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct TestData {
    pub parts: Vec<Part>,
    pub duration: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct BlockData {
    pub children: Vec<NodeId>,
    pub hooks: Vec<Hook>,
    /// Set once failed-first sorting has been applied
    pub reordered: bool,
}

#[derive(Debug)]
pub enum NodeKind {
    Test(TestData),
    Block(BlockData),
}

#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub path: String,
    pub source: Option<SourceLocation>,
    pub tags: BTreeSet<String>,
    pub declared_mode: Mode,
    pub mode: Mode,
    pub index_in_parent: usize,
    pub parent: Option<NodeId>,
    /// Tests: non-empty means failed. Blocks: the block itself failed.
    pub errors: Vec<String>,
    pub kind: NodeKind,
}

impl Node {
    pub fn is_test(&self) -> bool {
        matches!(self.kind, NodeKind::Test(_))
    }

    pub fn is_block(&self) -> bool {
        matches!(self.kind, NodeKind::Block(_))
    }

    pub fn as_test(&self) -> Option<&TestData> {
        match &self.kind {
            NodeKind::Test(data) => Some(data),
            NodeKind::Block(_) => None,
        }
    }

    pub fn as_block(&self) -> Option<&BlockData> {
        match &self.kind {
            NodeKind::Block(data) => Some(data),
            NodeKind::Test(_) => None,
        }
    }
}

/// Arena holding the whole test tree; index 0 is the root block
#[derive(Debug)]
pub struct TestTree {
    nodes: Vec<Node>,
    has_focus: bool,
    focus_active: bool,
}

impl Default for TestTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TestTree {
    pub fn new() -> Self {
        let root = Node {
            name: String::new(),
            path: String::new(),
            source: None,
            tags: BTreeSet::new(),
            declared_mode: Mode::Normal,
            mode: Mode::Normal,
            index_in_parent: 0,
            parent: None,
            errors: Vec::new(),
            kind: NodeKind::Block(BlockData::default()),
        };
        Self {
            nodes: vec![root],
            has_focus: false,
            focus_active: false,
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// True when any reachable node declares `only`
    pub fn has_focus(&self) -> bool {
        self.has_focus
    }

    /// True when some node is effectively focused. A declared `only`
    /// under a skipped block does not narrow the run.
    pub fn focus_active(&self) -> bool {
        self.focus_active
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match &self.nodes[id.0].kind {
            NodeKind::Block(block) => &block.children,
            NodeKind::Test(_) => &[],
        }
    }

    pub fn hooks(&self, id: NodeId, kind: HookKind) -> impl Iterator<Item = &Hook> {
        let hooks: &[Hook] = match &self.nodes[id.0].kind {
            NodeKind::Block(block) => &block.hooks,
            NodeKind::Test(_) => &[],
        };
        hooks.iter().filter(move |hook| hook.kind == kind)
    }

    pub fn part_count(&self, id: NodeId) -> usize {
        self.nodes[id.0].as_test().map_or(0, |t| t.parts.len())
    }

    pub fn part(&self, id: NodeId, index: usize) -> Option<&Part> {
        self.nodes[id.0].as_test().and_then(|t| t.parts.get(index))
    }

    /// Parent chain from the direct parent up to the root
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.nodes[id.0].parent;
        while let Some(parent) = current {
            out.push(parent);
            current = self.nodes[parent.0].parent;
        }
        out
    }

    /// Reachable nodes in depth-first pre-order, starting at the root
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            out.push(id);
            for child in self.children(id).iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    pub fn find_by_path(&self, path: &str) -> Option<NodeId> {
        self.preorder()
            .into_iter()
            .find(|id| self.nodes[id.0].path == path)
    }

    /// Own tags united with every ancestor's tags
    pub fn effective_tags(&self, id: NodeId) -> BTreeSet<String> {
        let mut tags = self.nodes[id.0].tags.clone();
        for ancestor in self.ancestors(id) {
            tags.extend(self.nodes[ancestor.0].tags.iter().cloned());
        }
        tags
    }

    /// Add a child node. Duplicate names within one block are a definition
    /// error on the parent; the new node is still allocated but left detached.
    pub(crate) fn add_node(
        &mut self,
        parent: NodeId,
        name: String,
        source: Option<SourceLocation>,
        kind: NodeKind,
    ) -> NodeId {
        let path = if parent == self.root() {
            name.clone()
        } else {
            format!("{}{}{}", self.nodes[parent.0].path, PATH_SEPARATOR, name)
        };
        let duplicate = self
            .children(parent)
            .iter()
            .any(|c| self.nodes[c.0].name == name);
        let index_in_parent = self.children(parent).len();

        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name,
            path,
            source,
            tags: BTreeSet::new(),
            declared_mode: Mode::Normal,
            mode: Mode::Normal,
            index_in_parent,
            parent: Some(parent),
            errors: Vec::new(),
            kind,
        });

        if duplicate {
            let message = format!(
                "Duplicate name '{}' declared in the same describe block",
                self.nodes[id.0].name
            );
            self.nodes[parent.0].errors.push(message);
        } else if let NodeKind::Block(block) = &mut self.nodes[parent.0].kind {
            block.children.push(id);
        }
        id
    }

    pub(crate) fn add_hook(&mut self, block: NodeId, hook: Hook) {
        if let NodeKind::Block(data) = &mut self.nodes[block.0].kind {
            data.hooks.push(hook);
        }
    }

    pub(crate) fn add_part(&mut self, test: NodeId, part: Part) {
        if let NodeKind::Test(data) = &mut self.nodes[test.0].kind {
            data.parts.push(part);
        }
    }

    pub(crate) fn set_declared_mode(&mut self, id: NodeId, mode: Mode) {
        let node = &mut self.nodes[id.0];
        node.declared_mode = mode;
        node.mode = mode;
    }

    /// Remove every child of a block from execution
    pub(crate) fn prune(&mut self, block: NodeId) {
        if let NodeKind::Block(data) = &mut self.nodes[block.0].kind {
            data.children.clear();
        }
    }

    pub(crate) fn reorder_children(&mut self, block: NodeId, children: Vec<NodeId>) {
        if let NodeKind::Block(data) = &mut self.nodes[block.0].kind {
            data.children = children;
            data.reordered = true;
        }
    }

    pub fn set_duration(&mut self, test: NodeId, duration: Option<Duration>) {
        if let NodeKind::Test(data) = &mut self.nodes[test.0].kind {
            data.duration = duration;
        }
    }

    /// True when some strict descendant declares `only`
    pub fn has_nested_only(&self, id: NodeId) -> bool {
        self.children(id).iter().any(|child| {
            self.nodes[child.0].declared_mode == Mode::Only || self.has_nested_only(*child)
        })
    }

    /// Recompute effective modes below `block` from its current mode
    pub fn propagate_modes(&mut self, block: NodeId) {
        let parent_mode = self.nodes[block.0].mode;
        let nested_only = self.has_nested_only(block);
        let children = self.children(block).to_vec();
        for child in children {
            let declared = self.nodes[child.0].declared_mode;
            self.nodes[child.0].mode = effective_mode(parent_mode, nested_only, declared);
            if self.nodes[child.0].is_block() {
                self.propagate_modes(child);
            }
        }
    }

    /// Final pass once every definition source has run
    pub(crate) fn finish(&mut self) {
        let focus = self
            .preorder()
            .into_iter()
            .any(|id| self.nodes[id.0].declared_mode == Mode::Only);
        self.has_focus = focus;
        let root = self.root();
        self.propagate_modes(root);
        self.focus_active = self
            .preorder()
            .into_iter()
            .any(|id| self.nodes[id.0].mode == Mode::Only);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_block(tree: &mut TestTree, parent: NodeId, name: &str, mode: Mode) -> NodeId {
        let id = tree.add_node(
            parent,
            name.to_string(),
            None,
            NodeKind::Block(BlockData::default()),
        );
        tree.set_declared_mode(id, mode);
        id
    }

    fn mk_test(tree: &mut TestTree, parent: NodeId, name: &str, mode: Mode) -> NodeId {
        let id = tree.add_node(
            parent,
            name.to_string(),
            None,
            NodeKind::Test(TestData::default()),
        );
        tree.set_declared_mode(id, mode);
        id
    }

    #[test]
    fn test_paths_join_with_separator() {
        let mut tree = TestTree::new();
        let root = tree.root();
        let outer = mk_block(&mut tree, root, "outer", Mode::Normal);
        let inner = mk_test(&mut tree, outer, "inner", Mode::Normal);
        assert_eq!(tree.node(outer).path, "outer");
        assert_eq!(tree.node(inner).path, "outer > inner");
        assert_eq!(tree.ancestors(inner), vec![outer, root]);
    }

    #[test]
    fn test_effective_mode_table() {
        assert_eq!(effective_mode(Mode::Skip, false, Mode::Only), Mode::Skip);
        assert_eq!(effective_mode(Mode::Normal, false, Mode::Skip), Mode::Skip);
        assert_eq!(effective_mode(Mode::Only, false, Mode::Normal), Mode::Only);
        assert_eq!(effective_mode(Mode::Only, true, Mode::Normal), Mode::Normal);
        assert_eq!(effective_mode(Mode::Only, true, Mode::Only), Mode::Only);
        assert_eq!(effective_mode(Mode::Normal, false, Mode::Todo), Mode::Todo);
        assert_eq!(effective_mode(Mode::Only, false, Mode::Todo), Mode::Todo);
    }

    #[test]
    fn test_duplicate_name_errors_parent() {
        let mut tree = TestTree::new();
        let root = tree.root();
        let outer = mk_block(&mut tree, root, "outer", Mode::Normal);
        mk_test(&mut tree, outer, "same", Mode::Normal);
        mk_test(&mut tree, outer, "same", Mode::Normal);
        assert_eq!(tree.children(outer).len(), 1);
        assert_eq!(tree.node(outer).errors.len(), 1);
    }

    #[test]
    fn test_preorder_follows_children() {
        let mut tree = TestTree::new();
        let root = tree.root();
        let a = mk_block(&mut tree, root, "a", Mode::Normal);
        let a1 = mk_test(&mut tree, a, "1", Mode::Normal);
        let b = mk_test(&mut tree, root, "b", Mode::Normal);
        assert_eq!(tree.preorder(), vec![root, a, a1, b]);
    }

    #[test]
    fn test_prune_hides_children_from_lookup() {
        let mut tree = TestTree::new();
        let root = tree.root();
        let a = mk_block(&mut tree, root, "a", Mode::Normal);
        mk_test(&mut tree, a, "x", Mode::Normal);
        tree.prune(a);
        assert!(tree.find_by_path("a > x").is_none());
    }

    #[test]
    fn test_effective_tags_include_ancestors() {
        let mut tree = TestTree::new();
        let root = tree.root();
        let a = mk_block(&mut tree, root, "a", Mode::Normal);
        tree.node_mut(a).tags.insert("slow".to_string());
        let t = mk_test(&mut tree, a, "t", Mode::Normal);
        tree.node_mut(t).tags.insert("io".to_string());
        let tags: Vec<_> = tree.effective_tags(t).into_iter().collect();
        assert_eq!(tags, vec!["io".to_string(), "slow".to_string()]);
    }
}
