//! Foundational and often-reused types.

pub mod config;
pub mod contact;
pub mod id;
pub mod traits;
