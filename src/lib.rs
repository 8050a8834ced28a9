mod attribute_value;
mod big_segments;
mod bucketing;
mod codec;
mod config;
mod contexts;
mod eval;
mod flag;
mod flag_value;
mod rule;
mod segment;
mod store;
pub mod stream;
mod test_common;
mod util;
mod variation;

pub use attribute_value::*;
pub use big_segments::*;
pub use bucketing::big_segment_context_hash;
pub use codec::*;
pub use config::*;
pub use contexts::attribute_reference::Reference;
pub use contexts::context::{Context, Kind};
pub use contexts::context_builder::{ContextBuilder, MultiContextBuilder};
pub use eval::*;
pub use flag::*;
pub use flag_value::*;
pub use rule::*;
pub use segment::*;
pub use store::*;
pub use stream::{
    DataSourceError, DataSourceState, DataSourceStatus, StreamError, StreamHandle,
    StreamProcessor,
};
pub use variation::*;
