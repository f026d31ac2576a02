//! Database query modules, one per table.

pub mod batches;
pub mod parts;
pub mod pipeline_runs;
pub mod publish_attempts;
pub mod quota;
pub mod source_items;
pub mod tasks;
