//! Fuzz target for pipeline configuration loading.
//!
//! Tests that TOML parsing plus validation handles arbitrary input without
//! panicking, and that accepted configs are actually valid.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tq_common::PipelineConfig;

fuzz_target!(|data: &str| {
    if let Ok(config) = PipelineConfig::from_toml_str(data) {
        assert!(config.validate().is_ok());
        assert!(config.queue.storage_allotment >= config.queue.max_file_size);
    }
});
