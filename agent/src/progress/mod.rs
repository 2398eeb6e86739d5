//! Progress reporting: typed events, sinks and console output

pub mod emitter;
pub mod formatter;
pub mod sink;
