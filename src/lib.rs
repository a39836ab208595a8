//! jobmail — job-search email classification and company resolution.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod store;
