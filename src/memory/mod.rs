pub mod store;

pub use store::{MemoryStore, Row, StatementRecord};
