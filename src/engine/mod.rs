pub mod aggregator;
pub mod clock;
pub mod eviction;
pub mod hub;
pub mod service;
pub mod steps;
pub mod store;
pub mod ticker;
pub mod types;

pub use aggregator::{Aggregator, AggregatorBuilder};
pub use service::{AggregatorHandle, AggregatorService, ServiceError, ServiceSettings};
