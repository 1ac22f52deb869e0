//! Subscription scanner: tracks per-source progress watermarks and a download
//! ledger, runs scheduled scans over every active subscription and hands new
//! items to a downloader.

pub mod api;
pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod scan;
pub mod services;

pub use error::{Error, Result};
