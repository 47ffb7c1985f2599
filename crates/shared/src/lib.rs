//! Wire and domain types shared by the conference client crates.

pub mod domain;
pub mod error;
pub mod protocol;
