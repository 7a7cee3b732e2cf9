//! Test declaration sources.
//!
//! Discovering specs from actual source files (parsing test files in some
//! target language, loading a compiled test binary, etc.) is explicitly out
//! of scope for this crate — it is a collaborator the planner consumes
//! through this trait, analogous to the teacher's `TestFramework::discover`.
//! This module also ships an in-process `registry` implementation used by
//! the planner's and dispatcher's own test suites, since there is no real
//! discovery backend to drive them with.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{FileSuite, Project};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Discovers the suite tree for a project. One `FileSuite` per test file
/// found under `project.test_dir` matching its match/ignore patterns.
#[async_trait]
pub trait TestSource: Send + Sync {
    async fn discover(&self, project: &Arc<Project>) -> SourceResult<Vec<FileSuite>>;
}

/// An in-process registry of suites, keyed by the file path a suite claims
/// to belong to. Used by this crate's own tests to exercise the planner and
/// dispatcher without a real external discovery backend.
#[derive(Default)]
pub struct Registry {
    suites: Vec<(PathBuf, FileSuite)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, path: impl Into<PathBuf>, suite: FileSuite) -> &mut Self {
        self.suites.push((path.into(), suite));
        self
    }
}

#[async_trait]
impl TestSource for Registry {
    async fn discover(&self, project: &Arc<Project>) -> SourceResult<Vec<FileSuite>> {
        Ok(self
            .suites
            .iter()
            .filter(|(_, suite)| Arc::ptr_eq(&suite.project, project))
            .map(|(_, suite)| suite.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Suite;

    #[tokio::test]
    async fn registry_only_returns_suites_for_matching_project() {
        let project_a = Arc::new(Project::new("a", "tests"));
        let project_b = Arc::new(Project::new("b", "tests"));

        let mut registry = Registry::new();
        registry.register(
            "a.spec",
            FileSuite {
                project: project_a.clone(),
                file: PathBuf::from("a.spec"),
                root: Suite::new("root", "a.spec"),
            },
        );

        let found = registry.discover(&project_a).await.unwrap();
        assert_eq!(found.len(), 1);

        let found_b = registry.discover(&project_b).await.unwrap();
        assert!(found_b.is_empty());
    }
}
