//! Stop lookup, stop search and imminent-departure pipelines over the
//! Transitland REST API and a GTFS-realtime trip-updates feed.

pub mod arrivals;
pub mod config;
pub mod debounce;
pub mod error;
pub mod models;
pub mod provider;
pub mod realtime;
pub mod search;
pub mod server;
pub mod session;
pub mod stops;

pub use config::TransitConfig;
pub use error::{PipelineError, TransitError};
pub use models::{Arrival, Region, Stop, ViewState};
