//! Entity emailer: subscription-driven email fan-out over an entity graph.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod expander;
pub mod jobs;
pub mod materializer;
pub mod model;
pub mod render;
pub mod resolver;
pub mod store;
pub mod subject;
pub mod transport;
