#![deny(warnings)]
#![deny(dead_code)]
#![deny(unused_variables)]
#![deny(unused_imports)]

//! kbroute-core
//!
//! Domain types, adapter traits, errors and configuration shared by every
//! kbroute crate.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;
