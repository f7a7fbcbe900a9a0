//! ocrflow - document OCR pipeline with sync/async dispatch and completion
//! reconciliation.

#![allow(clippy::should_implement_trait)]

pub mod analysis;
pub mod cli;
pub mod config;
pub mod models;
pub mod pipeline;
pub mod repository;
pub mod schema;
pub mod services;
pub mod storage;
pub mod topic;
pub mod work_queue;
