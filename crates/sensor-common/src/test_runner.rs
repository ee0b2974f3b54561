//! Test utility for driving a sensor with scripted hook invocations
//!
//! Example usage taken from file-system-monitor:
//! ```ignore
//! #[cfg(feature = "test-suite")]
//! pub mod test_suite {
//!     use super::*;
//!     use sensor_common::test_runner::{TestCase, TestRunner, TestSuite};
//!     use sensor_core::event_check;
//!
//!     pub fn tests() -> TestSuite {
//!         TestSuite {
//!             name: "file-system-monitor",
//!             tests: vec![hardlink()],
//!         }
//!     }
//!
//!     fn hardlink() -> TestCase {
//!         TestCase::new("hardlink", async {
//!             let (tree, ring) = fixture();
//!             TestRunner::with_sensor(ring.clone(), |sender| sensor(tree, ring, sender))
//!                 .run(|sensor| link(sensor, "/tmp/a", "/tmp/b"))
//!                 .await
//!                 .expect_event(event_check!(
//!                     Payload::Link,
//!                     (target.path_ref, "/tmp/b".to_string(), "target path")
//!                 ))
//!                 .report()
//!         })
//!     }
//! }
//! ```

use std::{fmt::Debug, future::Future, pin::Pin, sync::Arc};

use tokio::sync::mpsc;

use crate::{EventSender, PathRef, PathRing, TransportError};

/// Every module should export its own test suite
pub struct TestSuite {
    /// Name of the module
    pub name: &'static str,
    /// List of tests to run
    pub tests: Vec<TestCase>,
}

/// Every feature have a test case
pub struct TestCase {
    /// Name of the test
    pub name: &'static str,
    /// A test is an async function which returns a TestReport
    pub test: Pin<Box<dyn Future<Output = TestReport> + Send>>,
}

/// TestReport is the TestCase output
#[must_use]
pub struct TestReport {
    /// Wheather or not the test passed
    pub success: bool,
    /// Output describing the failure
    pub lines: Vec<String>,
}

impl TestCase {
    pub fn new(
        name: &'static str,
        test: impl Future<Output = TestReport> + 'static + Send,
    ) -> Self {
        Self {
            name,
            test: Box::pin(test),
        }
    }
}

/// TestRunner owns a sensor and collects into a TestResult all messages
/// produced by the given trigger program.
pub struct TestRunner<S, T: Debug> {
    sensor: S,
    ring: Arc<PathRing>,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<S, T: Debug> TestRunner<S, T> {
    /// Build the sensor under test. The given ring must be the one used by
    /// the sensor, it's needed to compare path references.
    pub fn with_sensor<F>(ring: Arc<PathRing>, build: F) -> Self
    where
        F: FnOnce(TestSender<T>) -> S,
    {
        // We use a channel to collect messages
        let (tx, rx) = mpsc::unbounded_channel();
        let sensor = build(TestSender { tx });
        Self { sensor, ring, rx }
    }

    /// Run the given triggering code and collect all messages into a TestResult.
    pub async fn run<F>(mut self, trigger_program: F) -> TestResult<S, T>
    where
        F: FnOnce(&S),
    {
        trigger_program(&self.sensor);
        // Let background tasks (eg. the orphan sweeper) make progress
        tokio::task::yield_now().await;
        let messages: Vec<_> = std::iter::from_fn(|| self.rx.try_recv().ok()).collect();
        TestResult {
            sensor: self.sensor,
            ring: self.ring,
            messages,
            expectations: Vec::new(),
        }
    }
}

/// Simple EventSender used to collect messages produced by the sensor.
pub struct TestSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for TestSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> EventSender<T> for TestSender<T> {
    fn send(&self, data: T) -> Result<(), TransportError> {
        self.tx.send(data).map_err(|_| TransportError::Closed)
    }
}

/// Messages collected by the TestRunner
pub struct TestResult<S, T: Debug> {
    /// Sensor under test, available to state expectations
    pub sensor: S,
    ring: Arc<PathRing>,
    /// Collected messages
    pub messages: Vec<T>,

    /// Expectations for this test. These are checked by the `report`
    /// function and used to produce a TestReport.
    expectations: Vec<Expectation<S, T>>,
}

/// Expectation for a given test
enum Expectation<S, T> {
    /// At least one message must match all provided constraints
    Checks(Vec<Check<T>>),
    /// Exactly `count` messages must match the predicate
    Count {
        description: &'static str,
        predicate: Predicate<T>,
        count: usize,
    },
    /// A property of the sensor after the run
    State {
        description: &'static str,
        predicate: Box<dyn Fn(&S) -> bool + Send>,
    },
}

/// A `Predicate<T>` is a function which takes a message and returns if
/// an expectation is satisfied.
type Predicate<T> = Box<dyn Fn(&T) -> bool + Send>;

impl<S, T: Debug> TestResult<S, T> {
    /// Make sure the sensor produced at least one message matching all checks.
    pub fn expect_event(mut self, checks: Vec<Check<T>>) -> Self {
        self.expectations.push(Expectation::Checks(checks));
        self
    }

    /// Make sure exactly `count` messages satisfy the predicate.
    pub fn expect_count(
        mut self,
        description: &'static str,
        count: usize,
        predicate: impl Fn(&T) -> bool + 'static + Send,
    ) -> Self {
        self.expectations.push(Expectation::Count {
            description,
            predicate: Box::new(predicate),
            count,
        });
        self
    }

    /// Make sure no message satisfies the predicate.
    pub fn expect_none(
        self,
        description: &'static str,
        predicate: impl Fn(&T) -> bool + 'static + Send,
    ) -> Self {
        self.expect_count(description, 0, predicate)
    }

    /// Make sure the sensor is left in the expected state.
    pub fn expect_state(
        mut self,
        description: &'static str,
        predicate: impl Fn(&S) -> bool + 'static + Send,
    ) -> Self {
        self.expectations.push(Expectation::State {
            description,
            predicate: Box::new(predicate),
        });
        self
    }

    /// Check all expectations against the produced messages.
    pub fn report(self) -> TestReport {
        let messages = self.messages;
        let mut success = true;
        let mut lines = Vec::new();
        // print all messages
        lines.push(format!("* {} messages generated:", messages.len()));
        messages.iter().for_each(|m| lines.push(format!("| {m:?}")));
        lines.push(String::new());

        for expectation in self.expectations {
            match expectation {
                Expectation::Checks(checks) => {
                    success = run_checks(&messages, &self.ring, checks, &mut lines) && success;
                }
                Expectation::Count {
                    description,
                    predicate,
                    count,
                } => {
                    let found = messages.iter().filter(|m| predicate(m)).count();
                    if found != count {
                        lines.push(format!(
                            "❌ {description}: found {found} messages, expected {count}"
                        ));
                        success = false;
                    }
                }
                Expectation::State {
                    description,
                    predicate,
                } => {
                    if !predicate(&self.sensor) {
                        lines.push(format!("❌ {description}: (FAIL)"));
                        success = false;
                    }
                }
            }
        }
        TestReport { success, lines }
    }
}

/// Make sure the sensor produced at least one message maching all checks.
pub fn run_checks<T: Debug>(
    messages: &[T],
    ring: &PathRing,
    checks: Vec<Check<T>>,
    lines: &mut Vec<String>,
) -> bool {
    // for each message, run all checks
    let results: Vec<(&T, usize, Vec<CheckResult>)> = messages
        .iter()
        .map(|message| {
            let results: Vec<CheckResult> =
                checks.iter().map(|c| (c.check_fn)(message, ring)).collect();
            let score = results.iter().filter(|x| x.success).count();
            (message, score, results)
        })
        .collect();

    // check how many checks have passed
    let max_score = match results.iter().map(|x| x.1).max() {
        Some(max_score) => max_score,
        None => {
            lines.push("No messages generated".to_string());
            return false;
        }
    };

    // if no message satisfies all cheks, we print a report table for each one
    if max_score != checks.len() {
        let best_results = results.into_iter().filter(|x| x.1 == max_score);
        for (message, score, check_results) in best_results {
            lines.push(format!(
                "* Only ({}/{}) matches for \"{:?}\"",
                score,
                checks.len(),
                message
            ));
            for (check_result, check) in check_results.iter().zip(checks.iter()) {
                if check_result.success {
                    lines.push(format!(
                        "✓ {}: {}",
                        check.description, check_result.expected
                    ));
                } else {
                    lines.push(format!("❌ {}: (FAIL)", check.description));
                    lines.push(format!("  |    found: {}", check_result.found));
                    lines.push(format!("  | expected: {}", check_result.expected));
                }
            }
            lines.push(String::new());
        }
        false
    } else {
        true
    }
}

/// A Check is an expectation about a message which should be emitted.
/// This allows to split test expectations in different lines, making it easier to spot the error.
/// Build this is using the `sensor_core::event_check!` macro.
pub struct Check<T> {
    pub description: &'static str,
    pub check_fn: CheckFunction<T>,
}

/// A `CheckFunction<T>` is a function which takes a message and returns the description
/// of the test-result
type CheckFunction<T> = Box<dyn Fn(&T, &PathRing) -> CheckResult + Send>;

impl<T> Check<T> {
    pub fn new(
        description: &'static str,
        check_fn: impl Fn(&T, &PathRing) -> CheckResult + 'static + Send,
    ) -> Self {
        Self {
            description,
            check_fn: Box::new(check_fn),
        }
    }
}

pub struct CheckResult {
    /// Weather or not the message passed this test
    pub success: bool,
    /// String representation of the actual value produced
    pub found: String,
    /// String representation of the value which should have been produced
    pub expected: String,
}

/// Trait for message field types which can be compared inside the event_check macro.
/// A given type X can be compared to a different type T if X: ComparableField<T>
/// All methods take the path ring, where the implementation could read data from.
/// This allows a PathRef to be compared to the String it points to.
pub trait ComparableField<T> {
    /// Check if the field equals the provided one, t.
    fn equals(&self, t: &T, ring: &PathRing) -> bool;
    /// Get a textual debug representation of the field.
    fn repr(&self, ring: &PathRing) -> String;
}

/// Every type which implements Debug and PartialEq is comparable to itself.
impl<T: PartialEq + Debug> ComparableField<T> for T {
    fn equals(&self, t: &T, _ring: &PathRing) -> bool {
        self == t
    }
    fn repr(&self, _ring: &PathRing) -> String {
        format!("{self:?}")
    }
}

// Allow comparing PathRef to String
impl ComparableField<String> for PathRef {
    fn equals(&self, t: &String, ring: &PathRing) -> bool {
        ring.read(self).as_ref() == Ok(t)
    }
    fn repr(&self, ring: &PathRing) -> String {
        format!("{:?}", ring.read(self))
    }
}

// Allow comparing an optional PathRef to String
impl ComparableField<String> for Option<PathRef> {
    fn equals(&self, t: &String, ring: &PathRing) -> bool {
        self.as_ref()
            .is_some_and(|r| <PathRef as ComparableField<String>>::equals(r, t, ring))
    }
    fn repr(&self, ring: &PathRing) -> String {
        match self {
            Some(r) => <PathRef as ComparableField<String>>::repr(r, ring),
            None => "no path".to_string(),
        }
    }
}
