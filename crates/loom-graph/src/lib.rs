mod error;
mod history;
mod persist;
mod similarity;
mod store;

pub use error::StoreError;
pub use history::{HistoryAction, HistoryEntry};
pub use persist::PersistedGraph;
pub use similarity::{label_similarity, normalize_label};
pub use store::{GraphStore, UpsertOutcome, SIMILARITY_THRESHOLD};
