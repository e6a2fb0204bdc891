//! Raw TDDF input.
//!
//! - `reader`: stored bytes to ordered [`RawLine`](crate::record::RawLine)s
//! - `discovery`: lists the inbox and enqueues files not seen before

mod discovery;
mod reader;

pub use discovery::{InboxDiscovery, business_day_from_name};
pub use reader::LineReader;
