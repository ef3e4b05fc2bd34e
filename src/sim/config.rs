use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::Value;

use crate::base::BLOCK_SIZE;

/// One TOML section per component. Missing sections fall back to defaults;
/// keys without a hardware default are `Option` and checked at component
/// construction.
pub trait Config: DeserializeOwned + Default {
    const SECTION: &'static str;

    fn from_config(config: &Value) -> Self {
        match config.get(Self::SECTION) {
            Some(value) => value
                .clone()
                .try_into()
                .unwrap_or_else(|e| panic!("cannot deserialize [{}]: {}", Self::SECTION, e)),
            None => {
                warn!("config section [{}] not found, using defaults", Self::SECTION);
                Self::default()
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct MemConfig {
    pub latency: u64,
    /// Bytes per cycle; divided by the transaction size to get the number of
    /// requests served per cycle.
    pub bandwidth: usize,
}

impl Config for MemConfig {
    const SECTION: &'static str = "mem";
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            latency: 80,
            bandwidth: 128,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PeManagerConfig {
    #[serde(rename = "num_PEs")]
    pub num_pes: Option<usize>,
    #[serde(rename = "PE_radix")]
    pub pe_radix: Option<usize>,
    #[serde(rename = "PE_input_buffer_size")]
    pub pe_input_buffer_size: usize,
    #[serde(rename = "PE_output_buffer_size")]
    pub pe_output_buffer_size: usize,
    pub prefetched_rows_per_cycle: usize,
    #[serde(rename = "A_row_ptr_buffer_size")]
    pub a_row_ptr_buffer_size: usize,
    #[serde(rename = "A_values_buffer_size")]
    pub a_values_buffer_size: usize,
    #[serde(rename = "B_row_ptr_end_buffer_size")]
    pub b_row_ptr_end_buffer_size: usize,
}

impl Config for PeManagerConfig {
    const SECTION: &'static str = "PE_manager";
}

impl Default for PeManagerConfig {
    fn default() -> Self {
        Self {
            num_pes: None,
            pe_radix: None,
            pe_input_buffer_size: 16,
            pe_output_buffer_size: 16,
            prefetched_rows_per_cycle: 4,
            a_row_ptr_buffer_size: 128,
            a_values_buffer_size: 1024,
            b_row_ptr_end_buffer_size: 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FiberCacheConfig {
    /// Total capacity in bytes.
    pub size: Option<usize>,
    pub num_banks: Option<usize>,
    pub assoc: Option<usize>,
    pub num_mem_ports: Option<usize>,
    pub sample_interval: usize,
}

impl Config for FiberCacheConfig {
    const SECTION: &'static str = "fiber_cache";
}

impl Default for FiberCacheConfig {
    fn default() -> Self {
        Self {
            size: None,
            num_banks: None,
            assoc: None,
            num_mem_ports: None,
            sample_interval: 10000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MergeTreeConfig {
    pub num_merge_trees: Option<usize>,
    pub merge_tree_size: Option<usize>,
    pub merge_tree_merger_width: Option<usize>,
    /// Defaults to `merge_tree_merger_width - 1`; also bounds the adders of
    /// the dynamic mergers when set.
    pub merge_tree_merger_num_adds: Option<usize>,
    pub num_final_mergers: Option<usize>,
    pub final_merger_width: Option<usize>,
    pub input_buffer_size: Option<usize>,
    pub output_buffer_size: Option<usize>,
    pub num_mem_ports: Option<usize>,
    pub max_prefetched_rows: usize,
    #[serde(rename = "A_row_ptr_buffer_size")]
    pub a_row_ptr_buffer_size: usize,
}

impl Config for MergeTreeConfig {
    const SECTION: &'static str = "merge_tree_manager";
}

impl Default for MergeTreeConfig {
    fn default() -> Self {
        Self {
            num_merge_trees: None,
            merge_tree_size: None,
            merge_tree_merger_width: None,
            merge_tree_merger_num_adds: None,
            num_final_mergers: None,
            final_merger_width: None,
            input_buffer_size: None,
            output_buffer_size: None,
            num_mem_ports: None,
            max_prefetched_rows: 1024,
            a_row_ptr_buffer_size: 16,
        }
    }
}

impl MergeTreeConfig {
    pub fn input_buffer_size_or_default(&self) -> usize {
        self.input_buffer_size.unwrap_or(2 * BLOCK_SIZE)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LinkedListCacheConfig {
    /// Total capacity in bytes.
    pub size: usize,
    pub num_mem_ports: usize,
    pub max_fetched_rows: Option<usize>,
    pub max_inactive_rows: usize,
    pub inactive_rows_assoc: usize,
    pub max_active_rows: usize,
    pub num_banks: Option<usize>,
    pub max_outstanding_reqs: usize,
    pub prefetched_rows_per_cycle: usize,
    pub sample_interval: usize,
}

impl Config for LinkedListCacheConfig {
    const SECTION: &'static str = "linked_list_cache";
}

impl Default for LinkedListCacheConfig {
    fn default() -> Self {
        Self {
            size: 3 * 1024 * 1024,
            num_mem_ports: 4,
            max_fetched_rows: None,
            max_inactive_rows: 32768,
            inactive_rows_assoc: 16,
            max_active_rows: 1024,
            num_banks: None,
            max_outstanding_reqs: 800,
            prefetched_rows_per_cycle: 4,
            sample_interval: 10000,
        }
    }
}

pub fn clock_period_ns(config: &Value) -> f64 {
    config
        .get("clock_period_ns")
        .and_then(Value::as_float)
        .unwrap_or(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_section_uses_defaults() {
        let value: Value = "arch = \"gamma\"".parse().unwrap();
        let mem = MemConfig::from_config(&value);
        assert_eq!(mem.latency, 80);
        assert_eq!(mem.bandwidth, 128);
    }

    #[test]
    fn section_overrides_defaults() {
        let value: Value = "[mem]\nlatency = 10\n".parse().unwrap();
        let mem = MemConfig::from_config(&value);
        assert_eq!(mem.latency, 10);
        assert_eq!(mem.bandwidth, 128);
    }

    #[test]
    fn renamed_keys_deserialize() {
        let value: Value = "[PE_manager]\nnum_PEs = 8\nPE_radix = 4\n".parse().unwrap();
        let cfg = PeManagerConfig::from_config(&value);
        assert_eq!(cfg.num_pes, Some(8));
        assert_eq!(cfg.pe_radix, Some(4));
        assert_eq!(cfg.pe_input_buffer_size, 16);
    }

    #[test]
    fn clock_period_default() {
        let value: Value = "arch = \"gamma\"".parse().unwrap();
        assert_eq!(clock_period_ns(&value), 1.0);
        let value: Value = "clock_period_ns = 0.5".parse().unwrap();
        assert_eq!(clock_period_ns(&value), 0.5);
    }
}
