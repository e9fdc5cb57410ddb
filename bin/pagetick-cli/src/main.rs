//! pagetick CLI - Inspect metadata files and drive SWMR writers and readers
//!
//! The writer and reader subcommands tick a data file by hand so two
//! processes can be watched exchanging pages through the metadata file.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pagetick_common::{
    AccessMode, DEFAULT_PAGE_SIZE, FileAccessProps, FileCreateProps, FileRole, SwmrConfig,
};
use pagetick_storage::swmr::codec::page_image;
use pagetick_storage::{FileHandle, FileRegistry, MetadataSnapshot, TickReport, decode_snapshot};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "pagetick-cli")]
#[command(about = "pagetick SWMR tool")]
#[command(version)]
struct Args {
    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode a metadata file and print its header and index
    Inspect {
        /// Metadata file path
        md_file: PathBuf,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Validate a configuration file
    CheckConfig {
        /// TOML configuration file
        config: PathBuf,
    },
    /// Open (or create) a data file as the SWMR writer and publish pages
    Writer {
        /// Data file path
        #[arg(short, long)]
        file: PathBuf,
        /// TOML configuration file
        #[arg(short, long)]
        config: PathBuf,
        /// Number of ticks to run
        #[arg(long, default_value = "10")]
        ticks: u64,
        /// Pages modified per tick
        #[arg(long, default_value = "4")]
        pages: u64,
    },
    /// Open a data file as a SWMR reader and follow the writer
    Reader {
        /// Data file path
        #[arg(short, long)]
        file: PathBuf,
        /// TOML configuration file
        #[arg(short, long)]
        config: PathBuf,
        /// Number of ticks to run
        #[arg(long, default_value = "10")]
        ticks: u64,
        /// Pages read back per tick
        #[arg(long, default_value = "4")]
        pages: u64,
    },
}

/// Configuration file contents
#[derive(Debug, Deserialize)]
#[serde(default)]
struct CliConfig {
    /// Page size used when the data file is created
    page_size: u32,
    /// Page buffer size in bytes (defaults to 64 pages)
    page_buffer_size: Option<usize>,
    /// SWMR settings
    swmr: SwmrConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            page_buffer_size: None,
            swmr: SwmrConfig::default(),
        }
    }
}

impl CliConfig {
    fn load(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&config_str)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    fn create_props(&self) -> FileCreateProps {
        FileCreateProps::paged(self.page_size)
    }

    /// Access properties for `role`, overriding the file's `is_writer`
    fn access_props(&self, role: FileRole) -> Result<FileAccessProps> {
        let mut swmr = self.swmr.clone();
        if swmr.is_writer != role.is_writer() {
            warn!("Config is_writer = {}, running as {}", swmr.is_writer, role);
            swmr.is_writer = role.is_writer();
        }

        let mut props = FileAccessProps::new();
        props.set_page_buffer_size(
            self.page_buffer_size
                .unwrap_or(self.page_size as usize * 64),
        );
        props.set_swmr_config(swmr)?;
        Ok(props)
    }

    fn validate(&self) -> Result<()> {
        self.create_props().validate()?;
        self.swmr.validate()?;
        if let Some(size) = self.page_buffer_size
            && size < self.page_size as usize
        {
            bail!(
                "page_buffer_size {} is smaller than page_size {}",
                size,
                self.page_size
            );
        }
        Ok(())
    }

    fn tick_pause(&self) -> Duration {
        self.swmr
            .tick_interval()
            .unwrap_or(Duration::from_millis(100))
    }
}

fn format_size(bytes: u64) -> String {
    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;

    if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn inspect(md_file: &Path, json: bool) -> Result<()> {
    let image =
        std::fs::read(md_file).with_context(|| format!("failed to read {}", md_file.display()))?;
    let snapshot = decode_snapshot(&image)?;

    let MetadataSnapshot::Published { header, index } = snapshot else {
        if json {
            println!("{}", serde_json::json!({ "published": false }));
        } else {
            println!("{}: nothing published yet", md_file.display());
        }
        return Ok(());
    };

    let damaged: Vec<u64> = index
        .entries
        .iter()
        .filter(|entry| page_image(&image, entry, header.page_size).is_err())
        .map(|entry| entry.data_page_offset)
        .collect();

    if json {
        let out = serde_json::json!({
            "published": true,
            "header": header,
            "entries": index.entries,
            "damaged_pages": damaged,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Metadata File: {}", md_file.display());
    println!("==============");
    println!("Size:           {}", format_size(image.len() as u64));
    println!("Tick:           {}", header.tick_num.get());
    println!("Page size:      {}", header.page_size);
    println!("Reserved pages: {}", header.reserved_pages);
    println!("Data file UUID: {}", header.file_uuid);
    println!(
        "Index:          {} entries at offset {} ({})",
        header.index_entry_count,
        header.index_offset,
        format_size(header.index_length)
    );
    if damaged.is_empty() {
        println!("Images:         {} verified", index.entries.len());
    } else {
        println!("Images:         {} damaged: {:?}", damaged.len(), damaged);
    }

    if !index.entries.is_empty() {
        println!();
        println!(
            "{:<12} {:<12} {:<10} {:<10}",
            "DATA PAGE", "MD PAGE", "LENGTH", "CHECKSUM"
        );
        for entry in &index.entries {
            println!(
                "{:<12} {:<12} {:<10} {:08x}",
                entry.data_page_offset, entry.md_file_page_offset, entry.length, entry.checksum
            );
        }
    }
    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    let config = CliConfig::load(path)?;
    config.validate()?;

    println!("{}: ok", path.display());
    println!("  role:              {}", FileRole::from_is_writer(config.swmr.is_writer));
    println!("  page size:         {}", config.page_size);
    println!("  max lag:           {} ticks", config.swmr.max_lag);
    match config.swmr.tick_interval() {
        Some(interval) => println!("  tick interval:     {interval:?}"),
        None => println!("  tick interval:     manual"),
    }
    println!("  metadata file:     {}", config.swmr.md_file_path);
    Ok(())
}

fn print_report(report: &TickReport) -> Result<()> {
    println!("{}", serde_json::to_string(report)?);
    Ok(())
}

fn open_writer(registry: &FileRegistry, path: &Path, config: &CliConfig) -> Result<FileHandle> {
    let props = config.access_props(FileRole::Writer)?;
    let file = if path.exists() {
        info!("Opening {} as writer", path.display());
        registry.open(path, AccessMode::ReadWrite, &props)?
    } else {
        info!("Creating {} as writer", path.display());
        registry.create(path, &config.create_props(), &props)?
    };
    Ok(file)
}

fn run_writer(path: &Path, config: &CliConfig, ticks: u64, pages: u64) -> Result<()> {
    config.validate()?;
    let registry = FileRegistry::new();
    let file = open_writer(&registry, path, config)?;
    let page_size = file.page_size() as usize;
    let pause = config.tick_pause();

    for _ in 0..ticks {
        // Stamp each page with the tick it was written in
        let stamp = file.tick_num().next().get();
        for page in 1..=pages {
            let mut content = vec![0u8; page_size];
            content[..8].copy_from_slice(&stamp.to_le_bytes());
            content[8..16].copy_from_slice(&page.to_le_bytes());
            file.write_page(page, content)?;
        }
        print_report(&file.end_tick()?)?;
        std::thread::sleep(pause);
    }

    file.close()?;
    info!("Writer finished after {} ticks", ticks);
    Ok(())
}

fn run_reader(path: &Path, config: &CliConfig, ticks: u64, pages: u64) -> Result<()> {
    config.validate()?;
    let registry = FileRegistry::new();
    let props = config.access_props(FileRole::Reader)?;
    let file = registry.open(path, AccessMode::ReadOnly, &props)?;
    let pause = config.tick_pause();

    for _ in 0..ticks {
        let report = match file.end_tick() {
            Ok(report) => report,
            Err(e) if e.is_retryable() => {
                warn!("Tick failed, retrying next interval: {}", e);
                std::thread::sleep(pause);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        print_report(&report)?;

        for page in 1..=pages {
            let content = file.read_page(page)?;
            let mut stamp = [0u8; 8];
            stamp.copy_from_slice(&content[..8]);
            println!("  page {:>4}: written at tick {}", page, u64::from_le_bytes(stamp));
        }
        if let Some(buffer) = file.page_buffer() {
            println!(
                "  page buffer: {} pages, hit ratio {:.2}",
                buffer.len(),
                buffer.stats().hit_ratio()
            );
        }
        std::thread::sleep(pause);
    }

    file.close()?;
    Ok(())
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match args.command {
        Commands::Inspect { md_file, json } => inspect(&md_file, json),
        Commands::CheckConfig { config } => check_config(&config),
        Commands::Writer {
            file,
            config,
            ticks,
            pages,
        } => run_writer(&file, &CliConfig::load(&config)?, ticks, pages),
        Commands::Reader {
            file,
            config,
            ticks,
            pages,
        } => run_reader(&file, &CliConfig::load(&config)?, ticks, pages),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
page_size = 512

[swmr]
version = 1
tick_len = 0
max_lag = 3
md_pages_reserved = 1
md_file_path = "/tmp/data.md"
is_writer = true
"#;

    #[test]
    fn test_parse_config() {
        let config: CliConfig = toml::from_str(CONFIG).unwrap();
        assert_eq!(config.page_size, 512);
        assert!(config.swmr.is_writer);
        config.validate().unwrap();
        assert_eq!(config.tick_pause(), Duration::from_millis(100));
    }

    #[test]
    fn test_access_props_override_role() {
        let config: CliConfig = toml::from_str(CONFIG).unwrap();
        let props = config.access_props(FileRole::Reader).unwrap();
        assert!(!props.swmr_config().unwrap().is_writer);
        assert_eq!(props.page_buffer_size(), Some(512 * 64));
    }

    #[test]
    fn test_missing_swmr_section_is_invalid() {
        let config: CliConfig = toml::from_str("page_size = 4096").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(100), "100 B");
        assert_eq!(format_size(2048), "2.0 KiB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MiB");
    }
}
