//! Checkpoint / Resume
//!
//! A checkpoint is taken right before a deliberate host restart and
//! consumed once afterwards. Resuming compares fingerprints first and only
//! then writes saved state back into the rebuilt tree; the two steps never mix.

use crate::listener::RunResults;
use crate::protocol::SourceLocation;
use crate::tree::{HookKind, Mode, NodeId, TestTree};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResumeError {
    #[error("Test definitions changed across restart: {0}")]
    DefinitionsChanged(String),

    #[error("Host restarted unexpectedly during a test run; no checkpoint was found")]
    UnexpectedRestart,

    #[error("Checkpoint is unreadable: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FingerprintKind {
    Test { parts: usize },
    Block,
}

/// Structural signature of a subtree, compared across a restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub path: String,
    pub kind: FingerprintKind,
    pub tags: Vec<String>,
    pub source: Option<SourceLocation>,
    pub mode: Mode,
    pub hooks: Vec<HookKind>,
    pub children: Vec<Fingerprint>,
}

impl Fingerprint {
    pub fn of(tree: &TestTree, id: NodeId) -> Self {
        let node = tree.node(id);
        let (kind, hooks) = match node.as_block() {
            Some(block) => (
                FingerprintKind::Block,
                block.hooks.iter().map(|h| h.kind).collect(),
            ),
            None => (
                FingerprintKind::Test {
                    parts: tree.part_count(id),
                },
                Vec::new(),
            ),
        };
        Self {
            path: node.path.clone(),
            kind,
            tags: node.tags.iter().cloned().collect(),
            source: node.source.clone(),
            mode: node.mode,
            hooks,
            children: tree
                .children(id)
                .iter()
                .map(|child| Self::of(tree, *child))
                .collect(),
        }
    }

    /// Describe the first place where `other` differs, if anywhere
    pub fn first_difference(&self, other: &Fingerprint) -> Option<String> {
        let at = if self.path.is_empty() { "<root>" } else { self.path.as_str() };
        if self.path != other.path {
            return Some(format!("expected '{}', found '{}'", self.path, other.path));
        }
        if self.kind != other.kind {
            return Some(format!("{at}: kind or part count differs"));
        }
        if self.tags != other.tags {
            return Some(format!("{at}: tags differ"));
        }
        if self.source != other.source {
            return Some(format!("{at}: source location differs"));
        }
        if self.mode != other.mode {
            return Some(format!("{at}: mode differs"));
        }
        if self.hooks != other.hooks {
            return Some(format!("{at}: hooks differ"));
        }
        if self.children.len() != other.children.len() {
            return Some(format!(
                "{at}: expected {} children, found {}",
                self.children.len(),
                other.children.len()
            ));
        }
        self.children
            .iter()
            .zip(&other.children)
            .find_map(|(mine, theirs)| mine.first_difference(theirs))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub errors: Vec<String>,
    pub duration_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub fingerprint: Fingerprint,
    /// Per-node state in pre-order
    pub node_state: Vec<NodeState>,
    pub results: RunResults,
    pub test_path: String,
    pub resume_part: usize,
    /// Wall time the in-flight test has used so far
    pub elapsed_ms: f64,
    /// Failed-first set the run was ordered with
    pub failed_first: Vec<String>,
}

impl Checkpoint {
    pub fn capture(
        tree: &TestTree,
        results: &RunResults,
        test: NodeId,
        resume_part: usize,
        elapsed: Duration,
        failed_first: Vec<String>,
    ) -> Self {
        let node_state = tree
            .preorder()
            .into_iter()
            .map(|id| {
                let node = tree.node(id);
                NodeState {
                    errors: node.errors.clone(),
                    duration_ms: node
                        .as_test()
                        .and_then(|t| t.duration)
                        .map(|d| d.as_secs_f64() * 1000.0),
                }
            })
            .collect();
        Self {
            fingerprint: Fingerprint::of(tree, tree.root()),
            node_state,
            results: results.clone(),
            test_path: tree.node(test).path.clone(),
            resume_part,
            elapsed_ms: elapsed.as_secs_f64() * 1000.0,
            failed_first,
        }
    }

    /// bincode payload behind a little-endian u32 length
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        let payload = bincode::serialize(self)?;
        let len = payload.len() as u32;
        let mut out = Vec::with_capacity(4 + payload.len());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ResumeError> {
        let Some((header, payload)) = bytes.split_first_chunk::<4>() else {
            return Err(ResumeError::Corrupt("truncated length header".to_string()));
        };
        let len = u32::from_le_bytes(*header) as usize;
        if payload.len() != len {
            return Err(ResumeError::Corrupt(format!(
                "expected {len} bytes, found {}",
                payload.len()
            )));
        }
        let checkpoint: Self =
            bincode::deserialize(payload).map_err(|e| ResumeError::Corrupt(e.to_string()))?;
        millis_to_duration(checkpoint.elapsed_ms)?;
        for state in &checkpoint.node_state {
            if let Some(ms) = state.duration_ms {
                millis_to_duration(ms)?;
            }
        }
        Ok(checkpoint)
    }

    /// Time the in-flight test had used before the restart
    pub fn elapsed(&self) -> Duration {
        millis_to_duration(self.elapsed_ms).unwrap_or_default()
    }

    /// Read-only structural comparison against a freshly built tree.
    /// Returns the in-flight test on success.
    pub fn verify(&self, tree: &TestTree) -> Result<NodeId, ResumeError> {
        let current = Fingerprint::of(tree, tree.root());
        if let Some(difference) = self.fingerprint.first_difference(&current) {
            return Err(ResumeError::DefinitionsChanged(difference));
        }
        let test = tree
            .find_by_path(&self.test_path)
            .filter(|id| tree.node(*id).is_test())
            .ok_or_else(|| {
                ResumeError::DefinitionsChanged(format!("test '{}' not found", self.test_path))
            })?;
        if self.resume_part >= tree.part_count(test) {
            return Err(ResumeError::DefinitionsChanged(format!(
                "test '{}' has no part {}",
                self.test_path, self.resume_part
            )));
        }
        Ok(test)
    }

    /// Write saved per-node state back. Only call after [`Checkpoint::verify`].
    pub fn restore(&self, tree: &mut TestTree) {
        for (id, state) in tree.preorder().into_iter().zip(&self.node_state) {
            tree.node_mut(id).errors = state.errors.clone();
            let duration = state
                .duration_ms
                .and_then(|ms| millis_to_duration(ms).ok());
            tree.set_duration(id, duration);
        }
    }
}

fn millis_to_duration(ms: f64) -> Result<Duration, ResumeError> {
    Duration::try_from_secs_f64(ms / 1000.0)
        .map_err(|e| ResumeError::Corrupt(format!("invalid duration {ms}ms: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_tree, Source};

    fn sources(extra: bool) -> Vec<Source> {
        vec![Source::new("f", move |s| {
            s.before_each(|| Ok(()));
            s.test("a", |_| Ok(()));
            s.test("b", |_| Ok(())).after_reload(|_| Ok(()));
            if extra {
                s.test("c", |_| Ok(()));
            }
            Ok(())
        })]
    }

    fn checkpoint(tree: &mut TestTree) -> Checkpoint {
        let a = tree.find_by_path("f > a").unwrap();
        tree.node_mut(a).errors.push("boom".to_string());
        tree.set_duration(a, Some(Duration::from_millis(5)));
        let b = tree.find_by_path("f > b").unwrap();
        let results = RunResults {
            failed: 1,
            ran: 1,
            ..RunResults::default()
        };
        Checkpoint::capture(tree, &results, b, 1, Duration::from_millis(2), Vec::new())
    }

    #[test]
    fn test_matching_tree_restores_state() {
        let mut tree = build_tree(&sources(false));
        let saved = checkpoint(&mut tree);
        let bytes = saved.encode().unwrap();

        let mut rebuilt = build_tree(&sources(false));
        let decoded = Checkpoint::decode(&bytes).unwrap();
        let test = decoded.verify(&rebuilt).unwrap();
        assert_eq!(rebuilt.node(test).path, "f > b");

        decoded.restore(&mut rebuilt);
        let a = rebuilt.find_by_path("f > a").unwrap();
        assert_eq!(rebuilt.node(a).errors, vec!["boom".to_string()]);
        assert_eq!(
            rebuilt.node(a).as_test().unwrap().duration,
            Some(Duration::from_millis(5))
        );
        assert_eq!(decoded.results.failed, 1);
    }

    #[test]
    fn test_changed_tree_is_rejected_without_writes() {
        let mut tree = build_tree(&sources(false));
        let saved = checkpoint(&mut tree);

        let rebuilt = build_tree(&sources(true));
        let err = saved.verify(&rebuilt).unwrap_err();
        assert!(matches!(err, ResumeError::DefinitionsChanged(_)));
        let a = rebuilt.find_by_path("f > a").unwrap();
        assert!(rebuilt.node(a).errors.is_empty());
    }

    #[test]
    fn test_truncated_bytes_are_corrupt() {
        let mut tree = build_tree(&sources(false));
        let bytes = checkpoint(&mut tree).encode().unwrap();
        assert!(matches!(
            Checkpoint::decode(&bytes[..bytes.len() - 1]),
            Err(ResumeError::Corrupt(_))
        ));
        assert!(matches!(
            Checkpoint::decode(&[1, 0]),
            Err(ResumeError::Corrupt(_))
        ));
    }

    #[test]
    fn test_difference_names_the_block() {
        let one = build_tree(&sources(false));
        let two = build_tree(&sources(true));
        let diff = Fingerprint::of(&one, one.root())
            .first_difference(&Fingerprint::of(&two, two.root()))
            .unwrap();
        assert!(diff.starts_with("f:"), "{diff}");
    }
}
