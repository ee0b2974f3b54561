//! Domain types shared by the sensor crates: the [events](event) produced by
//! the file-system pipeline, the per-module [configuration](config), the
//! broadcast [bus](bus) transport and the [context enrichment](context)
//! collaborator.

pub mod bus;
pub mod config;
pub mod context;
pub mod event;

pub use sensor_common::{Pid, Timestamp};

/// event_check! makes it easy to build a list of checks for a given payload variant.
/// Nested fields are reached with dots. Example usage from file-system-monitor:
///
/// (...).expect_event(event_check!(
///    Payload::Link,
///    (source.path_key, source_key, "source key"),
///    (target.path_ref, "/tmp/b".to_string(), "target path")
/// ));
#[cfg(feature = "test-utils")]
#[macro_export]
macro_rules! event_check {
    ($payload:tt :: $subtype:tt, $(($left:ident $(. $field:ident)*, $right:expr, $description:literal)),*) => {
        {
            use $crate::event::SensorMessage;
            use ::sensor_common::path_ring::PathRing;
            use ::sensor_common::test_runner::{Check, CheckResult, ComparableField};
            let mut checks = Vec::new();
            checks.push(Check::new("event type", move |message: &SensorMessage, _ring: &PathRing| {
                CheckResult {
                    success: matches!(
                        message,
                        SensorMessage::Event(event) if matches!(event.payload(), $payload::$subtype {..})
                    ),
                    found: String::new(),
                    expected: stringify!($payload::$subtype).to_string(),
                }
            }));
            $(
                let expected_value = $right;
                checks.push(Check::new(
                    $description,
                    move |message: &SensorMessage, ring: &PathRing| match message {
                        SensorMessage::Event(event) => match event.payload() {
                            $payload::$subtype { $left, .. } => {
                                let field = &(*$left) $(. $field)*;
                                CheckResult {
                                    success: ComparableField::equals(field, &expected_value, ring),
                                    found: {
                                        fn repr_as<F: ComparableField<T> + ?Sized, T>(f: &F, _t: &T, ring: &PathRing) -> String {
                                            f.repr(ring)
                                        }
                                        repr_as(field, &expected_value, ring)
                                    },
                                    expected: format!("{:?}", expected_value),
                                }
                            }
                            #[allow(unreachable_patterns)]
                            _ => CheckResult {
                                success: false,
                                found: format!("wrong variant"),
                                expected: format!("{:?}", expected_value),
                            },
                        },
                        _ => CheckResult {
                            success: false,
                            found: format!("not an event"),
                            expected: format!("{:?}", expected_value),
                        },
                    },
                ));
            )*
            checks
        }
    }
}
