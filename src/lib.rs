pub mod logging;
pub mod model;
pub mod pipeline;
pub mod server;
pub mod source;
pub mod store;

pub use model::{EventCategories, FilterSpec, Granularity, IpFilter, LogRecord, TimeRange};
pub use pipeline::{to_csv, FilteredResult, Pipeline};
pub use store::{LoadError, LogStore};
