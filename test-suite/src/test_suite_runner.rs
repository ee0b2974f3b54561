use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use libtest_mimic::{Arguments, Failed, Trial};
use sensor_common::{
    log_error,
    test_runner::{TestCase, TestReport, TestSuite},
};
use tokio::sync::{mpsc, oneshot};

pub struct TestSuiteRunner {
    tx_test: mpsc::Sender<TestRequest>,
}

struct TestRequest {
    test_case: TestCase,
    tx_reply: oneshot::Sender<Result<(), Failed>>,
}

impl TestSuiteRunner {
    /// Spawn the actual test runner in a background task. This is needed to run
    /// async tests from libtest_mimic.
    pub fn spawn() -> Self {
        // Since writing to stdout will mess the output,
        // we'll write logs to a channel instead.
        let (tx_log, mut rx_log) = mpsc::unbounded_channel();
        replace_logger(tx_log.clone());
        replace_panic_hook(tx_log);
        // Spawn the actual runner, which receives tests over a channel.
        let (tx_test, mut rx_test) = mpsc::channel::<TestRequest>(1);
        tokio::spawn(async move {
            while let Some(TestRequest {
                test_case,
                tx_reply,
            }) = rx_test.recv().await
            {
                let name = test_case.name;
                let outcome = run_test_case(test_case, &mut rx_log).await;
                // Logged directly: a log record would be drained by the next test
                if tx_reply.send(outcome).is_err() {
                    eprintln!("result of {name} dropped: nobody is waiting for it");
                }
            }
        });

        Self { tx_test }
    }

    /// Run our test-suite with libtest-mimic.
    pub async fn run_tests(&self, modules: Vec<TestSuite>) {
        let tests = modules
            .into_iter()
            // Fetch all the test cases for all module test suites
            .flat_map(|test_suite: TestSuite| {
                test_suite
                    .tests
                    .into_iter()
                    .map(move |test_case| (test_suite.name, test_case))
            })
            // Map to a libtest_mimic runner which forwards execution to the background task
            .map(|(module_name, test_case)| {
                let test_name = format!("{}::{}", module_name, test_case.name);
                let (tx_reply, rx_reply) = oneshot::channel();
                let test_request = TestRequest {
                    tx_reply,
                    test_case,
                };
                let tx_test = self.tx_test.clone();
                let run_in_background = move || {
                    tx_test
                        .blocking_send(test_request)
                        .map_err(|_| "Test runner failed to accept request")?;
                    rx_reply
                        .blocking_recv()
                        .map_err(|_| "Test runner failed to send reply")?
                };
                Trial::test(test_name, run_in_background)
            })
            .collect();

        // Parse command line arguments and run tests in a blocking task.
        let args = Arguments::from_args();
        let conclusion = tokio::task::spawn_blocking(move || libtest_mimic::run(&args, tests)).await;
        match conclusion {
            Ok(conclusion) => conclusion.exit(),
            Err(err) => {
                log_error("Test runner failed", err);
                std::process::exit(101);
            }
        }
    }
}

/// Run a single test case, treating panics as failures. Logs emitted while it
/// runs become the failure message.
async fn run_test_case(
    test_case: TestCase,
    rx_log: &mut mpsc::UnboundedReceiver<String>,
) -> Result<(), Failed> {
    // Logs of a previous test don't belong to this one
    while rx_log.try_recv().is_ok() {}

    let TestReport { success, mut lines } = AssertUnwindSafe(test_case.test)
        .catch_unwind()
        .await
        .unwrap_or(TestReport {
            success: false,
            lines: vec![],
        });
    while let Ok(log) = rx_log.try_recv() {
        lines.push(log);
    }
    if success {
        Ok(())
    } else {
        Err(lines.join("\n").into())
    }
}

/// We want to show logs only for failed tests, so we use a simple
/// interceptor which sends them over a channel.
fn replace_logger(tx_log: mpsc::UnboundedSender<String>) {
    /// A simple logger which forwards logs over a channel
    struct SimpleLogger(mpsc::UnboundedSender<String>);

    impl log::Log for SimpleLogger {
        fn enabled(&self, _: &log::Metadata) -> bool {
            true
        }
        fn log(&self, record: &log::Record) {
            let line = format!("{}:{} -- {}", record.level(), record.target(), record.args());
            // The runner is gone: stderr is the only place left
            if let Err(mpsc::error::SendError(line)) = self.0.send(line) {
                eprintln!("{line}");
            }
        }
        fn flush(&self) {}
    }

    if log::set_boxed_logger(Box::new(SimpleLogger(tx_log))).is_ok() {
        log::set_max_level(log::LevelFilter::Debug);
    }
}

/// Replace the panic hook with one which sends a message over the log channel
fn replace_panic_hook(tx_log: mpsc::UnboundedSender<String>) {
    if std::env::var("USE_NORMAL_PANIC_HANDLER").is_err() {
        std::panic::set_hook(Box::new(move |panic_info| {
            let panic_msg = if let Some(msg) = panic_info.payload().downcast_ref::<&str>() {
                msg.to_string()
            } else if let Some(msg) = panic_info.payload().downcast_ref::<String>() {
                msg.to_string()
            } else {
                "Unknown panic error\nRe-run exporting the USE_NORMAL_PANIC_HANDLER env variable"
                    .to_string()
            };
            let location = panic_info
                .location()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown location".to_string());
            let message = format!("❌ Panic: {panic_msg}\n  | at {location}");
            if let Err(mpsc::error::SendError(message)) = tx_log.send(message) {
                eprintln!("{message}");
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failure_carries_only_its_own_logs() {
        let (tx_log, mut rx_log) = mpsc::unbounded_channel();
        tx_log.send("leftover".to_string()).unwrap();
        let test_case = TestCase::new("failing", async move {
            tx_log.send("while running".to_string()).unwrap();
            TestReport {
                success: false,
                lines: vec!["expected event".to_string()],
            }
        });
        let failed = run_test_case(test_case, &mut rx_log).await.unwrap_err();
        assert_eq!(failed.message(), Some("expected event\nwhile running"));
    }

    #[tokio::test]
    async fn panic_is_a_failure() {
        let (_tx_log, mut rx_log) = mpsc::unbounded_channel();
        let test_case = TestCase::new("panicking", async {
            let lines: Vec<String> = Vec::new();
            assert!(!lines.is_empty(), "no lines");
            TestReport {
                success: true,
                lines,
            }
        });
        assert!(run_test_case(test_case, &mut rx_log).await.is_err());
    }

    #[tokio::test]
    async fn success() {
        let (_tx_log, mut rx_log) = mpsc::unbounded_channel();
        let test_case = TestCase::new("passing", async {
            TestReport {
                success: true,
                lines: vec![],
            }
        });
        assert!(run_test_case(test_case, &mut rx_log).await.is_ok());
    }
}
