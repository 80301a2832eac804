#![forbid(unsafe_code)]

pub mod audit;
pub mod common;
pub mod effects;
pub mod fact;
pub mod mapping;
pub mod rollup;
pub mod tenant;

pub use common::{
    ContractViolation, DayStamp, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate,
    NS_PER_DAY,
};
