pub mod github;
pub mod host;
pub mod mock;
pub mod types;

pub use host::{GitHost, GitHostError};
