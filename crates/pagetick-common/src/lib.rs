//! pagetick Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, the SWMR configuration and its
//! validation, and small types used across all pagetick components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{compute_crc32c, verify_crc32c};
pub use config::{
    CURRENT_SWMR_CONFIG_VERSION, DEFAULT_PAGE_SIZE, FileAccessProps, FileCreateProps,
    MIN_MAX_LAG, MIN_MD_PAGES_RESERVED, MIN_PAGE_SIZE, SwmrConfig,
};
pub use error::{Error, Result};
pub use types::*;
