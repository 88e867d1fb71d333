//! Filter and operations DSL: textual expressions compiled against entity
//! metadata into safe, storage-lowerable plans.

pub mod filter;
pub mod ops;

pub use filter::{parse_filter, CompareOp, Predicate};
pub use ops::{parse_ops, OpsPipeline, SortKey};
