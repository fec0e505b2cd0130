pub mod audit;
pub mod classify;
pub mod locator;
pub mod progress;
pub mod recovery;
pub mod retry;
pub mod sink;
pub mod stats;
pub mod steps;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;
pub mod workflow;

#[cfg(test)]
mod workflow_tests;
