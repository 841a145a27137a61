//! Core infrastructure: configuration gate, constants, errors, time,
//! runtime orchestration.

pub mod config;
pub mod constants;
pub mod error;
pub mod runtime;
pub mod time;
