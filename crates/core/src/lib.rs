pub mod config;
pub mod distributed;
pub mod logging;
pub mod meta;
pub mod models;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
