//! Terminal reporter with a progress bar and colored pass/fail lines.
//!
//! Grounded on the teacher's `report.rs::ConsoleReporter` (same
//! `indicatif`/`console` pairing, same normal-vs-verbose split), adapted to
//! the per-attempt event shape (`on_test_end` may fire more than once per
//! test id across retries).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::model::{Status, Test, TestResult};
use crate::report::Reporter;

pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
    quiet: bool,
    passed: AtomicUsize,
    failed: AtomicUsize,
    timed_out: AtomicUsize,
    skipped: AtomicUsize,
    failures: Mutex<Vec<(String, Option<String>)>>,
}

impl ConsoleReporter {
    pub fn new(verbose: bool, quiet: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
            quiet,
            passed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            timed_out: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            failures: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_begin(&self, tests: &[Arc<Test>]) {
        if self.quiet {
            return;
        }
        println!("Running {} tests", tests.len());
        let pb = indicatif::ProgressBar::new(tests.len() as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        *self.progress.lock().unwrap() = Some(pb);
    }

    async fn on_test_begin(&self, test: &Arc<Test>) {
        if self.verbose && !self.quiet {
            println!("Running: {}", test.title);
        }
    }

    async fn on_test_end(&self, test: &Arc<Test>, result: &TestResult) {
        match result.status {
            Status::Passed => {
                self.passed.fetch_add(1, Ordering::SeqCst);
            }
            Status::Failed => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                self.failures
                    .lock()
                    .unwrap()
                    .push((test.title.clone(), result.error.as_ref().map(|e| e.message.clone())));
            }
            Status::TimedOut => {
                self.timed_out.fetch_add(1, Ordering::SeqCst);
                self.failures.lock().unwrap().push((test.title.clone(), Some("timed out".into())));
            }
            Status::Skipped => {
                self.skipped.fetch_add(1, Ordering::SeqCst);
            }
        }

        if self.quiet {
            return;
        }

        if let Some(pb) = self.progress.lock().unwrap().as_ref() {
            pb.inc(1);
            let label = match result.status {
                Status::Passed => console::style("PASS").green(),
                Status::Failed => console::style("FAIL").red(),
                Status::TimedOut => console::style("TIME").red().bold(),
                Status::Skipped => console::style("SKIP").yellow(),
            };
            if self.verbose || result.status != Status::Passed {
                pb.println(format!("{} {}", label, test.title));
            }
        }
    }

    async fn on_end(&self, tests: &[Arc<Test>]) {
        if let Some(pb) = self.progress.lock().unwrap().take() {
            pb.finish_and_clear();
        }

        let passed = self.passed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let timed_out = self.timed_out.load(Ordering::SeqCst);
        let skipped = self.skipped.load(Ordering::SeqCst);
        let flaky = tests.iter().filter(|t| t.is_flaky()).count();

        println!();
        println!("Results:");
        println!("  Total:     {}", tests.len());
        println!("  Passed:    {}", console::style(passed).green());
        println!("  Failed:    {}", console::style(failed).red());
        println!("  Timed out: {}", console::style(timed_out).red());
        println!("  Skipped:   {}", console::style(skipped).yellow());
        if flaky > 0 {
            println!("  Flaky:     {}", console::style(flaky).yellow());
        }

        if failed == 0 && timed_out == 0 {
            println!();
            println!("{}", console::style("All tests passed!").green().bold());
        } else {
            println!();
            println!("{}", console::style("Failed tests:").red().bold());
            for (title, message) in self.failures.lock().unwrap().iter() {
                println!("  - {title}");
                if let Some(message) = message {
                    println!("    {}", console::style(message).dim());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Project, Variation};
    use std::path::PathBuf;
    use std::time::Duration;

    fn sample_test(title: &str) -> Arc<Test> {
        let project = Arc::new(Project::new("default", "tests"));
        Arc::new(Test::new(
            project,
            PathBuf::from("a.spec"),
            0,
            title.into(),
            Variation::default(),
            0,
            vec![],
            Duration::from_secs(1),
            Arc::new(|_info, _args| Box::pin(async { Ok(()) })),
        ))
    }

    #[tokio::test]
    async fn tallies_outcomes_by_status() {
        let reporter = ConsoleReporter::new(false, true);
        let t1 = sample_test("one");
        let t2 = sample_test("two");
        reporter.on_test_end(&t1, &TestResult::new(0, 0, Status::Passed)).await;
        reporter.on_test_end(&t2, &TestResult::new(0, 0, Status::Failed)).await;
        assert_eq!(reporter.passed.load(Ordering::SeqCst), 1);
        assert_eq!(reporter.failed.load(Ordering::SeqCst), 1);
        assert_eq!(reporter.failures.lock().unwrap().len(), 1);
    }
}
