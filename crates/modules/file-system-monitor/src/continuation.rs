use std::collections::VecDeque;

use sensor_core::event::EventType;
use thiserror::Error;

use crate::resolver::ResolverCallback;

/// Program a continuation jumps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgKey {
    /// Next hop of the path resolver
    Resolve,
    /// Resolution finished, resume the operation
    Callback(ResolverCallback),
}

/// A deferred step of the operation of the dispatching thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Continuation {
    pub event_type: EventType,
    pub prog: ProgKey,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TailCallError {
    #[error("tail call limit of {limit} reached")]
    LimitReached { limit: usize },
}

/// Continuations scheduled while handling one invocation, processed in
/// order once the handler returns. Like kernel tail calls, only a limited
/// number of them can be chained.
#[derive(Debug)]
pub struct ContinuationQueue {
    queue: VecDeque<Continuation>,
    limit: usize,
    used: usize,
}

impl ContinuationQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            limit,
            used: 0,
        }
    }

    /// On failure nothing is scheduled: the caller must give up on the
    /// operation.
    pub fn tail_call(&mut self, continuation: Continuation) -> Result<(), TailCallError> {
        if self.used >= self.limit {
            return Err(TailCallError::LimitReached { limit: self.limit });
        }
        self.used += 1;
        self.queue.push_back(continuation);
        Ok(())
    }

    pub fn next(&mut self) -> Option<Continuation> {
        self.queue.pop_front()
    }

    /// Tail calls done so far
    pub fn used(&self) -> usize {
        self.used
    }
}
