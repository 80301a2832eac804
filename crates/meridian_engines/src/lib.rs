#![forbid(unsafe_code)]

pub mod activation;
pub mod mapping_sync;
pub mod rollup;
