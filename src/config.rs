// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//

//! Engine configuration

use std::collections::HashMap;

use log::warn;

pub const HELION_EXECUTOR_CONCURRENCY: &str = "helion.executor.concurrency";
pub const HELION_EXECUTOR_STREAM_POOL_SIZE: &str = "helion.executor.stream_pool_size";
pub const HELION_CACHE_CAPACITY: &str = "helion.cache.capacity";

/// Engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Settings stored in map for easy serde
    settings: HashMap<String, String>,
}

impl EngineConfig {
    /// Create a new configuration based on key-value pairs
    pub fn new(settings: HashMap<String, String>) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &HashMap<String, String> {
        &self.settings
    }

    /// Number of worker threads in the task executor's pool
    pub fn executor_concurrency(&self) -> usize {
        let default = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        self.get_usize_setting(HELION_EXECUTOR_CONCURRENCY, default)
    }

    /// Number of compute streams the executor rotates tasks over
    pub fn executor_stream_pool_size(&self) -> usize {
        self.get_usize_setting(HELION_EXECUTOR_STREAM_POOL_SIZE, 8)
    }

    /// Maximum number of batches a cache holds before producers block
    pub fn cache_capacity(&self) -> usize {
        self.get_usize_setting(HELION_CACHE_CAPACITY, 64)
    }

    fn get_usize_setting(&self, key: &str, default_value: usize) -> usize {
        if let Some(v) = self.settings.get(key) {
            match v.parse() {
                Ok(parsed) => parsed,
                Err(_) => {
                    warn!("Ignoring invalid value '{}' for setting {}", v, key);
                    default_value
                }
            }
        } else {
            default_value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EngineConfig::default();
        assert!(config.executor_concurrency() >= 1);
        assert_eq!(config.executor_stream_pool_size(), 8);
        assert_eq!(config.cache_capacity(), 64);
    }

    #[test]
    fn custom_and_invalid_settings() {
        let mut settings = HashMap::new();
        settings.insert(HELION_CACHE_CAPACITY.to_string(), "4".to_string());
        settings.insert(
            HELION_EXECUTOR_STREAM_POOL_SIZE.to_string(),
            "not-a-number".to_string(),
        );
        let config = EngineConfig::new(settings);
        assert_eq!(config.cache_capacity(), 4);
        // invalid values fall back to the default
        assert_eq!(config.executor_stream_pool_size(), 8);
    }
}
