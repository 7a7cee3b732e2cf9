//! JUnit XML reporter.
//!
//! Grounded on the teacher's `report/junit.rs` XML-writer idiom
//! (`quick_xml::Writer` + `events::{BytesStart,BytesText,BytesEnd}`), but
//! rebuilt from streamed `on_test_end` events rather than merging XML files
//! produced by sandboxes — this crate's workers report structured results
//! directly over IPC, there is nothing to merge.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::sync::Arc;

use crate::model::{Status, Test, TestResult};
use crate::report::Reporter;

struct CaseRecord {
    classname: String,
    name: String,
    duration_secs: f64,
    status: Status,
    message: Option<String>,
    stdout: Vec<String>,
    stderr: Vec<String>,
}

/// Writes a single JUnit XML file when the run ends. Accumulates one
/// `<testcase>` per *final* attempt observed for a given test id — a
/// retried test that eventually passes is recorded with its last (passing)
/// attempt, matching the `final_result()` convention used everywhere else
/// in this crate.
pub struct JUnitReporter {
    output_path: PathBuf,
    cases: Mutex<std::collections::HashMap<String, CaseRecord>>,
    suite_name: String,
}

impl JUnitReporter {
    pub fn new(output_path: PathBuf, suite_name: impl Into<String>) -> Self {
        Self {
            output_path,
            cases: Mutex::new(std::collections::HashMap::new()),
            suite_name: suite_name.into(),
        }
    }

    fn write(&self, tests: &[Arc<Test>]) -> std::io::Result<()> {
        let cases = self.cases.lock().unwrap();

        let total = tests.len();
        let failures = cases.values().filter(|c| c.status == Status::Failed).count();
        let errors = cases.values().filter(|c| c.status == Status::TimedOut).count();
        let skipped = cases.values().filter(|c| c.status == Status::Skipped).count();

        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None))).ok();

        let mut suites = BytesStart::new("testsuites");
        suites.push_attribute(("tests", total.to_string().as_str()));
        suites.push_attribute(("failures", failures.to_string().as_str()));
        suites.push_attribute(("errors", errors.to_string().as_str()));
        suites.push_attribute(("skipped", skipped.to_string().as_str()));
        writer.write_event(Event::Start(suites)).ok();

        let mut suite = BytesStart::new("testsuite");
        suite.push_attribute(("name", self.suite_name.as_str()));
        suite.push_attribute(("tests", total.to_string().as_str()));
        suite.push_attribute(("failures", failures.to_string().as_str()));
        suite.push_attribute(("errors", errors.to_string().as_str()));
        suite.push_attribute(("skipped", skipped.to_string().as_str()));
        writer.write_event(Event::Start(suite)).ok();

        for test in tests {
            let Some(case) = cases.get(&test.id) else { continue };
            let mut tc = BytesStart::new("testcase");
            tc.push_attribute(("classname", case.classname.as_str()));
            tc.push_attribute(("name", case.name.as_str()));
            tc.push_attribute(("time", format!("{:.3}", case.duration_secs).as_str()));

            match case.status {
                Status::Passed => {
                    writer.write_event(Event::Empty(tc)).ok();
                }
                Status::Skipped => {
                    writer.write_event(Event::Start(tc)).ok();
                    writer.write_event(Event::Empty(BytesStart::new("skipped"))).ok();
                    writer.write_event(Event::End(BytesEnd::new("testcase"))).ok();
                }
                Status::Failed | Status::TimedOut => {
                    writer.write_event(Event::Start(tc)).ok();
                    let tag = if case.status == Status::TimedOut { "error" } else { "failure" };
                    let mut failure = BytesStart::new(tag);
                    let message = case.message.clone().unwrap_or_default();
                    failure.push_attribute(("message", message.as_str()));
                    writer.write_event(Event::Start(failure)).ok();
                    writer.write_event(Event::Text(BytesText::new(&message))).ok();
                    writer.write_event(Event::End(BytesEnd::new(tag))).ok();
                    if !case.stdout.is_empty() {
                        writer.write_event(Event::Start(BytesStart::new("system-out"))).ok();
                        writer
                            .write_event(Event::Text(BytesText::new(&case.stdout.join("\n"))))
                            .ok();
                        writer.write_event(Event::End(BytesEnd::new("system-out"))).ok();
                    }
                    if !case.stderr.is_empty() {
                        writer.write_event(Event::Start(BytesStart::new("system-err"))).ok();
                        writer
                            .write_event(Event::Text(BytesText::new(&case.stderr.join("\n"))))
                            .ok();
                        writer.write_event(Event::End(BytesEnd::new("system-err"))).ok();
                    }
                    writer.write_event(Event::End(BytesEnd::new("testcase"))).ok();
                }
            }
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite"))).ok();
        writer.write_event(Event::End(BytesEnd::new("testsuites"))).ok();

        if let Some(parent) = self.output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.output_path, writer.into_inner().into_inner())
    }
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_begin(&self, _tests: &[Arc<Test>]) {}

    async fn on_test_begin(&self, _test: &Arc<Test>) {}

    async fn on_test_end(&self, test: &Arc<Test>, result: &TestResult) {
        let (classname, name) = split_title(&test.title);
        let record = CaseRecord {
            classname,
            name,
            duration_secs: result.duration.as_secs_f64(),
            status: result.status,
            message: result.error.as_ref().map(|e| e.message.clone()),
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
        };
        self.cases.lock().unwrap().insert(test.id.clone(), record);
    }

    async fn on_end(&self, tests: &[Arc<Test>]) {
        if let Err(e) = self.write(tests) {
            tracing::warn!(error = %e, "failed to write junit report");
        }
    }
}

fn split_title(title: &str) -> (String, String) {
    match title.rsplit_once(' ') {
        Some((ancestors, leaf)) if !ancestors.is_empty() => (ancestors.to_string(), leaf.to_string()),
        _ => ("root".to_string(), title.to_string()),
    }
}
