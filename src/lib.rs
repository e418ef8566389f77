//! Sticker extraction and grouping service
//!
//! Images are queued for segmentation by priority, processed one at a time
//! by a single worker, and the extracted stickers are periodically grouped
//! by visual similarity once the queue drains.

pub mod app_state;
pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
