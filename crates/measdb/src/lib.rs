#![doc = include_str!("../../../README.md")]
//!

//! This crate re-exports the storage engine, writer and exporter from
//! `measdb-core` under one name.

pub use measdb_core::*;
