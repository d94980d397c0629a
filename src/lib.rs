// src/lib.rs

//! Incremental imageboard thread archiver.

pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod sources;
pub mod storage;
pub mod utils;
