//! Configuration types for pagetick
//!
//! This module defines the SWMR configuration and the create/access
//! property structs that carry it into the file layer.

use crate::error::{Error, Result};
use crate::types::FileSpaceStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// SWMR configuration version understood by this library
pub const CURRENT_SWMR_CONFIG_VERSION: u32 = 1;

/// Smallest `max_lag` that still lets a reader finish a snapshot read
/// before the slots it references are reused
pub const MIN_MAX_LAG: u32 = 3;

/// Smallest number of metadata file pages reserved for the header
pub const MIN_MD_PAGES_RESERVED: u32 = 1;

/// Default file page size (4KB)
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Minimum file page size
pub const MIN_PAGE_SIZE: u32 = 512;

/// One tick_len unit
const TICK_UNIT: Duration = Duration::from_millis(100);

/// Single-writer/multiple-reader configuration
///
/// The all-zero default is deliberately invalid; callers fill in every
/// field and attach it with [`FileAccessProps::set_swmr_config`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwmrConfig {
    /// Configuration version, must be [`CURRENT_SWMR_CONFIG_VERSION`]
    pub version: u32,
    /// Tick length in tenths of a second (0 = ticks are driven manually)
    pub tick_len: i64,
    /// Ticks a superseded metadata slot stays readable
    pub max_lag: u32,
    /// Pages reserved at the head of the metadata file
    pub md_pages_reserved: u32,
    /// Path of the metadata file
    pub md_file_path: String,
    /// Open as the writer
    pub is_writer: bool,
}

impl SwmrConfig {
    /// Writer configuration with the minimum lag and one reserved page
    pub fn writer(md_file_path: impl Into<String>) -> Self {
        Self {
            version: CURRENT_SWMR_CONFIG_VERSION,
            tick_len: 1,
            max_lag: MIN_MAX_LAG,
            md_pages_reserved: MIN_MD_PAGES_RESERVED,
            md_file_path: md_file_path.into(),
            is_writer: true,
        }
    }

    /// Reader configuration with the minimum lag and one reserved page
    pub fn reader(md_file_path: impl Into<String>) -> Self {
        Self {
            is_writer: false,
            ..Self::writer(md_file_path)
        }
    }

    /// Validate every field
    pub fn validate(&self) -> Result<()> {
        if self.version == 0 {
            return Err(Error::invalid_config("version", "version is not set"));
        }
        if self.version < CURRENT_SWMR_CONFIG_VERSION {
            return Err(Error::invalid_config(
                "version",
                format!(
                    "version {} is older than {}",
                    self.version, CURRENT_SWMR_CONFIG_VERSION
                ),
            ));
        }
        if self.version > CURRENT_SWMR_CONFIG_VERSION {
            return Err(Error::invalid_config(
                "version",
                format!("unknown version {}", self.version),
            ));
        }
        if self.tick_len < 0 {
            return Err(Error::invalid_config(
                "tick_len",
                format!("tick_len {} is negative", self.tick_len),
            ));
        }
        if self.max_lag < MIN_MAX_LAG {
            return Err(Error::invalid_config(
                "max_lag",
                format!("max_lag {} is below minimum {}", self.max_lag, MIN_MAX_LAG),
            ));
        }
        if self.md_pages_reserved < MIN_MD_PAGES_RESERVED {
            return Err(Error::invalid_config(
                "md_pages_reserved",
                format!(
                    "md_pages_reserved {} is below minimum {}",
                    self.md_pages_reserved, MIN_MD_PAGES_RESERVED
                ),
            ));
        }
        if self.md_file_path.is_empty() {
            return Err(Error::invalid_config("md_file_path", "path is empty"));
        }
        Ok(())
    }

    /// Metadata file path
    pub fn md_file_path(&self) -> &Path {
        Path::new(&self.md_file_path)
    }

    /// Wall-clock tick interval, `None` when ticks are driven manually
    #[must_use]
    pub fn tick_interval(&self) -> Option<Duration> {
        match u32::try_from(self.tick_len) {
            Ok(0) | Err(_) => None,
            Ok(n) => Some(TICK_UNIT * n),
        }
    }
}

/// File creation properties
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileCreateProps {
    /// File space handling strategy
    pub space_strategy: FileSpaceStrategy,
    /// Page size in bytes
    pub page_size: u32,
}

impl Default for FileCreateProps {
    fn default() -> Self {
        Self {
            space_strategy: FileSpaceStrategy::Aggregate,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl FileCreateProps {
    /// Default creation properties
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the page size
    #[must_use]
    pub const fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Paged space strategy with the given page size
    #[must_use]
    pub fn paged(page_size: u32) -> Self {
        Self {
            space_strategy: FileSpaceStrategy::Paged,
            page_size,
        }
    }

    /// Validate the page size
    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE || !self.page_size.is_power_of_two() {
            return Err(Error::invalid_argument(format!(
                "page size {} must be a power of two >= {}",
                self.page_size, MIN_PAGE_SIZE
            )));
        }
        Ok(())
    }
}

/// File access properties
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileAccessProps {
    /// Page buffer size in bytes (None = no page buffering)
    page_buffer_size: Option<usize>,
    /// Attached SWMR configuration
    swmr: Option<SwmrConfig>,
}

impl FileAccessProps {
    /// Empty access properties: no page buffer, no SWMR
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable page buffering with the given size in bytes
    pub fn set_page_buffer_size(&mut self, size: usize) -> &mut Self {
        self.page_buffer_size = (size > 0).then_some(size);
        self
    }

    /// Page buffer size, if page buffering is enabled
    #[must_use]
    pub fn page_buffer_size(&self) -> Option<usize> {
        self.page_buffer_size
    }

    /// Validate and attach a SWMR configuration
    ///
    /// Nothing is attached when validation fails.
    pub fn set_swmr_config(&mut self, config: SwmrConfig) -> Result<()> {
        config.validate()?;
        self.swmr = Some(config);
        Ok(())
    }

    /// The attached SWMR configuration
    #[must_use]
    pub fn swmr_config(&self) -> Option<&SwmrConfig> {
        self.swmr.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> SwmrConfig {
        SwmrConfig {
            version: CURRENT_SWMR_CONFIG_VERSION,
            tick_len: 3,
            max_lag: 3,
            md_pages_reserved: 2,
            md_file_path: "swmr_metadata_file".to_string(),
            is_writer: true,
        }
    }

    #[test]
    fn test_default_config_is_invalid() {
        let config = SwmrConfig::default();
        assert!(config.version < CURRENT_SWMR_CONFIG_VERSION);
        let err = config.validate().unwrap_err();
        assert_eq!(err.config_field(), Some("version"));
    }

    #[test]
    fn test_each_field_rejected_in_turn() {
        let mut props = FileAccessProps::new();
        let mut config = SwmrConfig::default();

        assert!(props.set_swmr_config(config.clone()).is_err());

        config.version = CURRENT_SWMR_CONFIG_VERSION;
        config.tick_len = -1;
        let err = props.set_swmr_config(config.clone()).unwrap_err();
        assert_eq!(err.config_field(), Some("tick_len"));

        config.tick_len = 3;
        config.max_lag = 2;
        let err = props.set_swmr_config(config.clone()).unwrap_err();
        assert_eq!(err.config_field(), Some("max_lag"));

        config.max_lag = 3;
        let err = props.set_swmr_config(config.clone()).unwrap_err();
        assert_eq!(err.config_field(), Some("md_pages_reserved"));

        config.md_pages_reserved = 2;
        let err = props.set_swmr_config(config.clone()).unwrap_err();
        assert_eq!(err.config_field(), Some("md_file_path"));

        // Nothing was attached by the failed attempts
        assert!(props.swmr_config().is_none());

        config.md_file_path = "swmr_metadata_file".to_string();
        config.is_writer = true;
        props.set_swmr_config(config.clone()).unwrap();
        assert_eq!(props.swmr_config(), Some(&config));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let config = SwmrConfig {
            version: CURRENT_SWMR_CONFIG_VERSION + 1,
            ..valid_config()
        };
        assert_eq!(config.validate().unwrap_err().config_field(), Some("version"));
    }

    #[test]
    fn test_failed_set_keeps_previous_config() {
        let mut props = FileAccessProps::new();
        props.set_swmr_config(valid_config()).unwrap();

        let bad = SwmrConfig {
            max_lag: 0,
            ..valid_config()
        };
        assert!(props.set_swmr_config(bad).is_err());
        assert_eq!(props.swmr_config(), Some(&valid_config()));
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = valid_config();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SwmrConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_tick_interval() {
        let mut config = valid_config();
        assert_eq!(config.tick_interval(), Some(Duration::from_millis(300)));
        config.tick_len = 0;
        assert_eq!(config.tick_interval(), None);
    }

    #[test]
    fn test_page_buffer_toggle() {
        let mut props = FileAccessProps::new();
        assert_eq!(props.page_buffer_size(), None);
        props.set_page_buffer_size(4096);
        assert_eq!(props.page_buffer_size(), Some(4096));
        props.set_page_buffer_size(0);
        assert_eq!(props.page_buffer_size(), None);
    }

    #[test]
    fn test_create_props_page_size() {
        assert!(FileCreateProps::paged(512).validate().is_ok());
        assert!(FileCreateProps::paged(256).validate().is_err());
        assert!(FileCreateProps::paged(1000).validate().is_err());
        assert_eq!(FileCreateProps::new().with_page_size(512).page_size, 512);
        assert_eq!(
            FileCreateProps::default().space_strategy,
            FileSpaceStrategy::Aggregate
        );
    }
}
