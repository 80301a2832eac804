#![forbid(unsafe_code)]

pub mod context;
pub mod pipeline;
pub mod rebuild;
pub mod repair;
