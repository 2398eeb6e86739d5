//! Background workers

pub mod intake;
pub mod mqtt;
