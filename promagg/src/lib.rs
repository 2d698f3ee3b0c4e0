pub mod error;
pub mod labels;
pub mod merge;
pub mod metric;
pub mod store;
pub mod text;

pub use error::Error;
pub use store::AggregateStore;
