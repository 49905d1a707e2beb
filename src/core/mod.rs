pub mod error;

pub use error::{Result, TxError, failure_chain};
