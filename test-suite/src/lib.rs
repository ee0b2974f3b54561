mod test_suite_runner;

pub use test_suite_runner::TestSuiteRunner;

/// Returns the testable modules of the sensor
pub fn modules() -> Vec<sensor_common::test_runner::TestSuite> {
    vec![file_system_monitor::test_suite::tests()]
}
