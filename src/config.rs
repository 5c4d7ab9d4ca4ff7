//! Storage configuration.
//!
//! All tuning knobs for the engine, validated once at construction. Channel
//! count must be a power of two because channel ownership is a mask over the
//! object id.

use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::{LoamError, Result};

/// Strategy used to pick a channel for newly issued object ids.
///
/// Assignment is permanent: once an OID is issued for a channel it stays
/// there for the lifetime of the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistributionStrategy {
  RoundRobin,
  #[default]
  LeastLoaded,
  HashByType,
  HashByObjectId,
  WeightedCapacity,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
  /// Number of channels; power of two. Default: logical CPU count rounded
  /// down to a power of two.
  pub channel_count: usize,
  /// Root of the on-disk layout.
  pub storage_directory: PathBuf,
  /// Per-channel subdirectory prefix.
  pub channel_directory_prefix: String,
  pub housekeeping_interval_ms: u64,
  pub housekeeping_time_budget_ns: u64,
  pub budget_increase_threshold: u32,
  pub budget_increase_ns: u64,
  pub maximum_time_budget_ns: u64,
  pub data_file_minimum_size: u64,
  pub data_file_maximum_size: u64,
  pub transaction_file_maximum_size: u64,
  /// Files with live/total below this are evacuated. Range (0, 1].
  pub minimum_use_ratio: f64,
  pub entity_cache_timeout_ms: u64,
  pub entity_cache_threshold: u64,
  /// Whether the active head file is eligible for cleanup.
  pub clean_up_head_file: bool,
  pub backup_directory: Option<PathBuf>,
  pub distribution_strategy: DistributionStrategy,
  /// Per-channel weights for `WeightedCapacity`; empty means uniform.
  pub channel_weights: Vec<f64>,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      channel_count: default_channel_count(),
      storage_directory: PathBuf::from(DEFAULT_STORAGE_DIRECTORY),
      channel_directory_prefix: DEFAULT_CHANNEL_DIRECTORY_PREFIX.to_string(),
      housekeeping_interval_ms: DEFAULT_HOUSEKEEPING_INTERVAL_MS,
      housekeeping_time_budget_ns: DEFAULT_HOUSEKEEPING_TIME_BUDGET_NS,
      budget_increase_threshold: DEFAULT_BUDGET_INCREASE_THRESHOLD,
      budget_increase_ns: DEFAULT_BUDGET_INCREASE_NS,
      maximum_time_budget_ns: DEFAULT_MAXIMUM_TIME_BUDGET_NS,
      data_file_minimum_size: DEFAULT_DATA_FILE_MINIMUM_SIZE,
      data_file_maximum_size: DEFAULT_DATA_FILE_MAXIMUM_SIZE,
      transaction_file_maximum_size: DEFAULT_TRANSACTION_FILE_MAXIMUM_SIZE,
      minimum_use_ratio: DEFAULT_MINIMUM_USE_RATIO,
      entity_cache_timeout_ms: DEFAULT_CACHE_TIMEOUT_MS,
      entity_cache_threshold: DEFAULT_CACHE_THRESHOLD,
      clean_up_head_file: false,
      backup_directory: None,
      distribution_strategy: DistributionStrategy::default(),
      channel_weights: Vec::new(),
    }
  }
}

/// Logical CPU count rounded down to a power of two, at least 1.
fn default_channel_count() -> usize {
  let cpus = std::thread::available_parallelism()
    .map(|n| n.get())
    .unwrap_or(1);
  if cpus.is_power_of_two() {
    cpus
  } else {
    cpus.next_power_of_two() / 2
  }
}

impl StorageConfig {
  pub fn new<P: AsRef<Path>>(storage_directory: P) -> Self {
    Self {
      storage_directory: storage_directory.as_ref().to_path_buf(),
      ..Default::default()
    }
  }

  pub fn channel_count(mut self, value: usize) -> Self {
    self.channel_count = value;
    self
  }

  pub fn channel_directory_prefix<S: Into<String>>(mut self, value: S) -> Self {
    self.channel_directory_prefix = value.into();
    self
  }

  pub fn housekeeping_interval_ms(mut self, value: u64) -> Self {
    self.housekeeping_interval_ms = value;
    self
  }

  pub fn housekeeping_time_budget_ns(mut self, value: u64) -> Self {
    self.housekeeping_time_budget_ns = value;
    self
  }

  pub fn data_file_minimum_size(mut self, value: u64) -> Self {
    self.data_file_minimum_size = value;
    self
  }

  pub fn data_file_maximum_size(mut self, value: u64) -> Self {
    self.data_file_maximum_size = value;
    self
  }

  pub fn transaction_file_maximum_size(mut self, value: u64) -> Self {
    self.transaction_file_maximum_size = value;
    self
  }

  pub fn minimum_use_ratio(mut self, value: f64) -> Self {
    self.minimum_use_ratio = value;
    self
  }

  pub fn entity_cache_timeout_ms(mut self, value: u64) -> Self {
    self.entity_cache_timeout_ms = value;
    self
  }

  pub fn entity_cache_threshold(mut self, value: u64) -> Self {
    self.entity_cache_threshold = value;
    self
  }

  pub fn clean_up_head_file(mut self, value: bool) -> Self {
    self.clean_up_head_file = value;
    self
  }

  pub fn backup_directory<P: AsRef<Path>>(mut self, value: P) -> Self {
    self.backup_directory = Some(value.as_ref().to_path_buf());
    self
  }

  pub fn distribution_strategy(mut self, value: DistributionStrategy) -> Self {
    self.distribution_strategy = value;
    self
  }

  pub fn channel_weights(mut self, value: Vec<f64>) -> Self {
    self.channel_weights = value;
    self
  }

  /// Fail-fast validation of programmer errors.
  pub fn validate(&self) -> Result<()> {
    if self.channel_count == 0 || !self.channel_count.is_power_of_two() {
      return Err(LoamError::InvalidConfiguration(format!(
        "channel count must be a non-zero power of two, got {}",
        self.channel_count
      )));
    }
    if self.data_file_minimum_size >= self.data_file_maximum_size {
      return Err(LoamError::InvalidConfiguration(format!(
        "data file minimum size {} must be below maximum size {}",
        self.data_file_minimum_size, self.data_file_maximum_size
      )));
    }
    if self.data_file_maximum_size <= RECORD_HEADER_SIZE {
      return Err(LoamError::InvalidConfiguration(
        "data file maximum size must exceed the record header size".to_string(),
      ));
    }
    if !(self.minimum_use_ratio > 0.0 && self.minimum_use_ratio <= 1.0) {
      return Err(LoamError::InvalidConfiguration(format!(
        "minimum use ratio must be in (0, 1], got {}",
        self.minimum_use_ratio
      )));
    }
    if self.housekeeping_interval_ms == 0 {
      return Err(LoamError::InvalidConfiguration(
        "housekeeping interval must be non-zero".to_string(),
      ));
    }
    if self.housekeeping_time_budget_ns == 0 {
      return Err(LoamError::InvalidConfiguration(
        "housekeeping time budget must be non-zero".to_string(),
      ));
    }
    if self.maximum_time_budget_ns < self.housekeeping_time_budget_ns {
      return Err(LoamError::InvalidConfiguration(
        "maximum time budget must be at least the baseline budget".to_string(),
      ));
    }
    if !self.channel_weights.is_empty() {
      if self.channel_weights.len() != self.channel_count {
        return Err(LoamError::InvalidConfiguration(format!(
          "expected {} channel weights, got {}",
          self.channel_count,
          self.channel_weights.len()
        )));
      }
      if self.channel_weights.iter().any(|w| *w <= 0.0) {
        return Err(LoamError::InvalidConfiguration(
          "channel weights must be positive".to_string(),
        ));
      }
    }
    Ok(())
  }

  // ==========================================================================
  // Layout helpers
  // ==========================================================================

  pub fn channel_directory_name(&self, channel_index: usize) -> String {
    format!("{}{}", self.channel_directory_prefix, channel_index)
  }

  pub fn data_file_name(&self, channel_index: usize, file_number: u64) -> String {
    format!("{DATA_FILE_PREFIX}{channel_index}_{file_number}{DATA_FILE_SUFFIX}")
  }

  pub fn transaction_file_name(&self, channel_index: usize) -> String {
    format!("{TRANSACTION_FILE_PREFIX}{channel_index}{TRANSACTION_FILE_SUFFIX}")
  }

  /// Parse a data file name back into its file number.
  pub fn parse_data_file_name(&self, channel_index: usize, name: &str) -> Option<u64> {
    let prefix = format!("{DATA_FILE_PREFIX}{channel_index}_");
    let rest = name.strip_prefix(&prefix)?;
    let digits = rest.strip_suffix(DATA_FILE_SUFFIX)?;
    digits.parse().ok()
  }
}
