//! Test Tree Builder
//!
//! Definition sources are plain closures receiving a [`Suite`]. They are
//! invoked again on every rebuild after a host restart, so they must be
//! deterministic: same declarations, same order.

use crate::context::{guarded, TestContext};
use crate::protocol::SourceLocation;
use crate::tree::{
    BlockData, Hook, HookFn, HookKind, Mode, NodeId, NodeKind, Part, TestData, TestFn, TestTree,
};
use std::fmt::Display;
use std::rc::Rc;

pub type DefineFn = Rc<dyn Fn(&mut Suite<'_>) -> anyhow::Result<()>>;

/// A named definition source, wrapped in an implicit describe block
#[derive(Clone)]
pub struct Source {
    pub name: String,
    pub define: DefineFn,
}

impl Source {
    pub fn new<F>(name: impl Into<String>, define: F) -> Self
    where
        F: Fn(&mut Suite<'_>) -> anyhow::Result<()> + 'static,
    {
        Self {
            name: name.into(),
            define: Rc::new(define),
        }
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source").field("name", &self.name).finish()
    }
}

/// Build a fresh tree from every source, in order
pub fn build_tree(sources: &[Source]) -> TestTree {
    let mut tree = TestTree::new();
    let root = tree.root();
    for source in sources {
        let mut suite = Suite {
            tree: &mut tree,
            current: root,
        };
        let define = source.define.clone();
        suite.block(source.name.clone(), None, Mode::Normal, move |s| define(s));
    }
    tree.finish();
    tree
}

/// Declaration API, only available while the tree is being built
pub struct Suite<'t> {
    tree: &'t mut TestTree,
    current: NodeId,
}

impl<'t> Suite<'t> {
    /// The block declarations currently land in
    pub fn current(&self) -> NodeId {
        self.current
    }

    #[track_caller]
    pub fn describe<F>(&mut self, name: impl Into<String>, body: F) -> BlockHandle<'_>
    where
        F: FnOnce(&mut Suite<'_>) -> anyhow::Result<()>,
    {
        let source = SourceLocation::caller();
        let id = self.block(name.into(), Some(source), Mode::Normal, body);
        BlockHandle {
            tree: &mut *self.tree,
            id,
        }
    }

    #[track_caller]
    pub fn describe_skip<F>(&mut self, name: impl Into<String>, body: F) -> BlockHandle<'_>
    where
        F: FnOnce(&mut Suite<'_>) -> anyhow::Result<()>,
    {
        let source = SourceLocation::caller();
        let id = self.block(name.into(), Some(source), Mode::Skip, body);
        BlockHandle {
            tree: &mut *self.tree,
            id,
        }
    }

    #[track_caller]
    pub fn describe_only<F>(&mut self, name: impl Into<String>, body: F) -> BlockHandle<'_>
    where
        F: FnOnce(&mut Suite<'_>) -> anyhow::Result<()>,
    {
        let source = SourceLocation::caller();
        let id = self.block(name.into(), Some(source), Mode::Only, body);
        BlockHandle {
            tree: &mut *self.tree,
            id,
        }
    }

    /// One describe block per case; `{}` in the name is replaced by the case
    #[track_caller]
    pub fn describe_each<T, F>(&mut self, name: &str, cases: impl IntoIterator<Item = T>, body: F)
    where
        T: Display,
        F: Fn(&mut Suite<'_>, &T) -> anyhow::Result<()>,
    {
        let source = SourceLocation::caller();
        for case in cases {
            let case_name = format_case(name, &case);
            self.block(case_name, Some(source.clone()), Mode::Normal, |s| {
                body(s, &case)
            });
        }
    }

    #[track_caller]
    pub fn test<F>(&mut self, name: impl Into<String>, body: F) -> TestHandle<'_>
    where
        F: Fn(&mut TestContext<'_>) -> anyhow::Result<()> + 'static,
    {
        let source = SourceLocation::caller();
        let id = self.leaf(name.into(), source, Rc::new(body));
        TestHandle {
            tree: &mut *self.tree,
            id,
        }
    }

    /// One test per case; `{}` in the name is replaced by the case
    #[track_caller]
    pub fn test_each<T, F>(&mut self, name: &str, cases: impl IntoIterator<Item = T>, body: F)
    where
        T: Display + Clone + 'static,
        F: Fn(&mut TestContext<'_>, &T) -> anyhow::Result<()> + 'static,
    {
        let source = SourceLocation::caller();
        let body = Rc::new(body);
        for case in cases {
            let case_name = format_case(name, &case);
            let body = body.clone();
            self.leaf(
                case_name,
                source.clone(),
                Rc::new(move |ctx: &mut TestContext<'_>| body(ctx, &case)),
            );
        }
    }

    /// A placeholder test with no body
    #[track_caller]
    pub fn todo(&mut self, name: impl Into<String>) -> TestHandle<'_> {
        let source = SourceLocation::caller();
        let id = self.tree.add_node(
            self.current,
            name.into(),
            Some(source),
            NodeKind::Test(TestData::default()),
        );
        self.tree.set_declared_mode(id, Mode::Todo);
        TestHandle {
            tree: &mut *self.tree,
            id,
        }
    }

    #[track_caller]
    pub fn before_all<F>(&mut self, f: F)
    where
        F: Fn() -> anyhow::Result<()> + 'static,
    {
        self.hook(HookKind::BeforeAll, Rc::new(f));
    }

    #[track_caller]
    pub fn after_all<F>(&mut self, f: F)
    where
        F: Fn() -> anyhow::Result<()> + 'static,
    {
        self.hook(HookKind::AfterAll, Rc::new(f));
    }

    #[track_caller]
    pub fn before_each<F>(&mut self, f: F)
    where
        F: Fn() -> anyhow::Result<()> + 'static,
    {
        self.hook(HookKind::BeforeEach, Rc::new(f));
    }

    #[track_caller]
    pub fn after_each<F>(&mut self, f: F)
    where
        F: Fn() -> anyhow::Result<()> + 'static,
    {
        self.hook(HookKind::AfterEach, Rc::new(f));
    }

    /// Tag the block declarations currently land in
    pub fn tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let node = self.tree.node_mut(self.current);
        node.tags.extend(tags.into_iter().map(Into::into));
    }

    #[track_caller]
    fn hook(&mut self, kind: HookKind, func: HookFn) {
        let hook = Hook {
            kind,
            func,
            source: Some(SourceLocation::caller()),
        };
        self.tree.add_hook(self.current, hook);
    }

    fn leaf(&mut self, name: String, source: SourceLocation, func: TestFn) -> NodeId {
        let data = TestData {
            parts: vec![Part {
                func,
                source: Some(source.clone()),
            }],
            duration: None,
        };
        self.tree
            .add_node(self.current, name, Some(source), NodeKind::Test(data))
    }

    /// Declare a block and run its body right away. A failing body
    /// records the error on the block and removes its children.
    fn block<F>(&mut self, name: String, source: Option<SourceLocation>, mode: Mode, body: F) -> NodeId
    where
        F: FnOnce(&mut Suite<'_>) -> anyhow::Result<()>,
    {
        let id = self.tree.add_node(
            self.current,
            name,
            source,
            NodeKind::Block(BlockData::default()),
        );
        self.tree.set_declared_mode(id, mode);

        let outcome = {
            let mut inner = Suite {
                tree: &mut *self.tree,
                current: id,
            };
            guarded(|| body(&mut inner))
        };
        if let Err(error) = outcome {
            tracing::debug!(path = %self.tree.node(id).path, %error, "describe body failed");
            self.tree.node_mut(id).errors.push(error);
        }
        if !self.tree.node(id).errors.is_empty() {
            self.tree.prune(id);
        }
        self.tree.propagate_modes(id);
        id
    }
}

fn format_case<T: Display>(name: &str, case: &T) -> String {
    if name.contains("{}") {
        name.replacen("{}", &case.to_string(), 1)
    } else {
        format!("{name} {case}")
    }
}

/// Modifiers for a just-declared test
pub struct TestHandle<'a> {
    tree: &'a mut TestTree,
    id: NodeId,
}

impl TestHandle<'_> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn skip(self) -> Self {
        self.tree.set_declared_mode(self.id, Mode::Skip);
        self
    }

    pub fn only(self) -> Self {
        self.tree.set_declared_mode(self.id, Mode::Only);
        self
    }

    pub fn tags<I, S>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let node = self.tree.node_mut(self.id);
        node.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Continue the test in a new part after the host restarts
    #[track_caller]
    pub fn after_reload<F>(self, f: F) -> Self
    where
        F: Fn(&mut TestContext<'_>) -> anyhow::Result<()> + 'static,
    {
        let part = Part {
            func: Rc::new(f),
            source: Some(SourceLocation::caller()),
        };
        self.tree.add_part(self.id, part);
        self
    }
}

pub struct BlockHandle<'a> {
    tree: &'a mut TestTree,
    id: NodeId,
}

impl BlockHandle<'_> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn tags<I, S>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let node = self.tree.node_mut(self.id);
        node.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(define: impl Fn(&mut Suite<'_>) -> anyhow::Result<()> + 'static) -> TestTree {
        build_tree(&[Source::new("file", define)])
    }

    #[test]
    fn test_sources_become_implicit_blocks() {
        let tree = build_tree(&[
            Source::new("a", |s| {
                s.test("one", |_| Ok(()));
                Ok(())
            }),
            Source::new("b", |_| Ok(())),
        ]);
        let names: Vec<_> = tree
            .children(tree.root())
            .iter()
            .map(|id| tree.node(*id).name.clone())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(tree.find_by_path("a > one").is_some());
    }

    #[test]
    fn test_failing_describe_prunes_children() {
        let tree = build(|s| {
            s.describe("broken", |s| {
                s.test("never", |_| Ok(()));
                anyhow::bail!("definition failed")
            });
            Ok(())
        });
        let broken = tree.find_by_path("file > broken").unwrap();
        assert!(tree.children(broken).is_empty());
        assert_eq!(tree.node(broken).errors, vec!["definition failed".to_string()]);
    }

    #[test]
    fn test_panicking_describe_is_recorded() {
        let tree = build(|s| {
            s.describe("boom", |_| panic!("oops"));
            Ok(())
        });
        let boom = tree.find_by_path("file > boom").unwrap();
        assert_eq!(tree.node(boom).errors, vec!["panicked: oops".to_string()]);
    }

    #[test]
    fn test_each_formats_names() {
        let tree = build(|s| {
            s.test_each("each {}", [1, 2], |_, _| Ok(()));
            s.describe_each("case", ["x"], |s, _| {
                s.test("t", |_| Ok(()));
                Ok(())
            });
            Ok(())
        });
        assert!(tree.find_by_path("file > each 1").is_some());
        assert!(tree.find_by_path("file > each 2").is_some());
        assert!(tree.find_by_path("file > case x > t").is_some());
    }

    #[test]
    fn test_skip_dominates_nested_only() {
        let tree = build(|s| {
            s.describe_skip("skipped", |s| {
                s.test("focused", |_| Ok(())).only();
                Ok(())
            });
            Ok(())
        });
        let focused = tree.find_by_path("file > skipped > focused").unwrap();
        assert_eq!(tree.node(focused).mode, Mode::Skip);
        assert!(tree.has_focus());
        assert!(!tree.focus_active());
    }

    #[test]
    fn test_only_block_narrows_to_nested_only() {
        let tree = build(|s| {
            s.describe_only("outer", |s| {
                s.test("plain", |_| Ok(()));
                s.describe("inner", |s| {
                    s.test("x", |_| Ok(())).only();
                    s.test("y", |_| Ok(()));
                    Ok(())
                });
                Ok(())
            });
            s.describe_only("wide", |s| {
                s.test("z", |_| Ok(()));
                Ok(())
            });
            Ok(())
        });
        let mode = |path: &str| tree.node(tree.find_by_path(path).unwrap()).mode;
        assert_eq!(mode("file > outer > plain"), Mode::Normal);
        assert_eq!(mode("file > outer > inner > x"), Mode::Only);
        assert_eq!(mode("file > outer > inner > y"), Mode::Normal);
        assert_eq!(mode("file > wide > z"), Mode::Only);
    }

    #[test]
    fn test_after_reload_adds_parts_and_tags_apply() {
        let tree = build(|s| {
            s.tags(["file-tag"]);
            s.test("reloading", |_| Ok(()))
                .tags(["slow"])
                .after_reload(|_| Ok(()));
            Ok(())
        });
        let id = tree.find_by_path("file > reloading").unwrap();
        assert_eq!(tree.part_count(id), 2);
        let tags = tree.effective_tags(id);
        assert!(tags.contains("slow"));
        assert!(tags.contains("file-tag"));
    }

    #[test]
    fn test_todo_has_no_parts() {
        let tree = build(|s| {
            s.todo("later");
            Ok(())
        });
        let id = tree.find_by_path("file > later").unwrap();
        assert_eq!(tree.node(id).mode, Mode::Todo);
        assert_eq!(tree.part_count(id), 0);
    }
}
