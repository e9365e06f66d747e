pub mod anthropic;
pub mod contracts;
pub mod error;
pub mod mock;
pub mod retry;
pub mod validate;

pub use contracts::AgentSuite;
pub use error::AgentError;
