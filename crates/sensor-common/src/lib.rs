mod event_sender;
pub mod path_ring;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_runner;
pub mod time;

pub use event_sender::{EventSender, TransportError};
pub use path_ring::{PathRef, PathRefError, PathRing};
pub use time::Timestamp;

/// Utility function to pretty print an error with its sources.
///
/// We use this because by default Rust won't print the source of an error message,
/// making it much less useful. Instead of re-implementing that, we'll just use
/// anyhow as an error pretty-printer.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:?}", msg, anyhow::Error::from(err));
}

pub use nix::unistd::Pid;

/// Maximum number of chained continuations a single hook invocation may
/// trigger. Same value as the kernel tail call limit (`MAX_TAIL_CALL_CNT`).
pub const MAX_TAIL_CALLS: usize = 33;
