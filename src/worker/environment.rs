//! The `Environment` contract (spec.md §6): an ambient fixture layer a
//! worker runs outside of and around the user's own `beforeAll`/
//! `beforeEach`/`afterEach`/`afterAll` hooks.
//!
//! A worker composes a *list* of environments (spec.md §9 design note and
//! §6: "forward order for `before*`, reverse order for `after*`"), held by
//! `BucketRunner` as `&[Arc<dyn Environment>]` rather than a single
//! instance. `before_all`/`before_each` run in list order, outermost (index
//! 0) first; `after_each`/`after_all` run in reverse. `before_each` returns
//! an object that is shallow-merged into the test's argument bag, later
//! environments overwriting earlier ones on key collision; its `after_each`
//! runs after all suite `afterEach` hooks, user hooks innermost-first then
//! the environment list reverse-first (spec.md §9 Open Question 2, resolved
//! as stated in the spec).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::model::{HookError, TestInfo, WorkerInfo};

#[async_trait]
pub trait Environment: Send + Sync {
    async fn before_all(&self, _info: &WorkerInfo) -> Result<(), HookError> {
        Ok(())
    }

    /// Returns a value (`void` is represented as `Value::Null`) merged into
    /// the test body's argument bag (spec.md §6: "returned object merged
    /// into test arguments in the order environments were composed").
    async fn before_each(&self, _info: &Arc<Mutex<TestInfo>>) -> Result<serde_json::Value, HookError> {
        Ok(serde_json::Value::Null)
    }

    async fn after_each(&self, _info: &Arc<Mutex<TestInfo>>) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_all(&self, _info: &WorkerInfo) -> Result<(), HookError> {
        Ok(())
    }
}

/// The environment used when no project-specific fixture layer is
/// configured: every hook is a no-op.
pub struct NullEnvironment;

#[async_trait]
impl Environment for NullEnvironment {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Project;
    use std::path::PathBuf;

    #[tokio::test]
    async fn null_environment_hooks_always_succeed() {
        let env = NullEnvironment;
        let worker_info =
            WorkerInfo { worker_index: 0, project: Arc::new(Project::new("default", "tests")) };
        assert!(env.before_all(&worker_info).await.is_ok());
        assert!(env.after_all(&worker_info).await.is_ok());

        let project = Arc::new(Project::new("default", "tests"));
        let test = crate::model::Test::new(
            project,
            PathBuf::from("a.spec"),
            0,
            "t".into(),
            Default::default(),
            0,
            vec![],
            std::time::Duration::from_secs(1),
            Arc::new(|_i, _a| Box::pin(async { Ok(()) })),
        );
        let info = Arc::new(Mutex::new(TestInfo::new(&test, 0, 0)));
        assert_eq!(env.before_each(&info).await.unwrap(), serde_json::Value::Null);
        assert!(env.after_each(&info).await.is_ok());
    }
}
