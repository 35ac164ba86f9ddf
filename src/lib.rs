pub mod compare;
pub mod config;
pub mod errors;
pub mod exec;
pub mod executor;
pub mod metrics;
pub mod phase;
pub mod store;
pub mod util;
pub mod workspace;

pub use errors::RelayError;
