/*
 * This file is part of module-reconciler, licensed under the MIT License (MIT).
 *
 * Copyright (c) 2024 easybill GmbH
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 */
use std::path::{Path, PathBuf};

use anyhow::bail;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::queue::QueueConfig;

/// The command line options model. `external_modules_dir` is the one mandatory
/// input; everything else falls back to a default if neither the flag nor the
/// matching environment variable is present.
#[derive(Parser, Clone, Debug)]
pub(crate) struct CommandLineOptions {
    /// The root directory under which module payloads and the `modules/` enable
    /// symlinks live. If neither this nor `EXTERNAL_MODULES_DIR` is set the
    /// process exits immediately without doing anything (see SPEC_FULL.md §6).
    #[arg(long = "external-modules-dir", env = "EXTERNAL_MODULES_DIR")]
    pub external_modules_dir: Option<PathBuf>,

    /// The path to an optional tuning configuration file.
    #[arg(long = "config-path", env = "MODULE_RECONCILER_CONFIG_PATH")]
    pub config_path: Option<PathBuf>,

    /// The number of reconcile workers to run.
    #[arg(long = "workers", env = "MODULE_RECONCILER_WORKERS", default_value_t = 4)]
    pub workers: usize,
}

/// The optional tuning configuration, loaded from `config_path` if given.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub(crate) struct ReconcilerConfig {
    #[serde(default = "default_base_delay_millis")]
    pub base_delay_millis: u64,
    #[serde(default = "default_max_delay_millis")]
    pub max_delay_millis: u64,
    #[serde(default = "default_bucket_rate_per_sec")]
    pub bucket_rate_per_sec: u32,
    #[serde(default = "default_bucket_burst")]
    pub bucket_burst: u32,
}

fn default_base_delay_millis() -> u64 {
    500
}

fn default_max_delay_millis() -> u64 {
    1_000_000
}

fn default_bucket_rate_per_sec() -> u32 {
    50
}

fn default_bucket_burst() -> u32 {
    300
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            base_delay_millis: default_base_delay_millis(),
            max_delay_millis: default_max_delay_millis(),
            bucket_rate_per_sec: default_bucket_rate_per_sec(),
            bucket_burst: default_bucket_burst(),
        }
    }
}

impl ReconcilerConfig {
    /// Loads the tuning configuration from the given file path.
    pub(crate) async fn load_from_file(file_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let toml_file_content = fs::read_to_string(file_path).await?;
        let parsed_configuration: ReconcilerConfig = toml::from_str(&toml_file_content)?;
        Ok(parsed_configuration)
    }

    /// Validates the tuning parameters, rejecting configurations that would make
    /// the work queue ill-behaved (zero rate, or a max delay shorter than the
    /// base delay).
    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        if self.bucket_rate_per_sec == 0 {
            bail!("bucket_rate_per_sec must be greater than zero");
        }
        if self.bucket_burst == 0 {
            bail!("bucket_burst must be greater than zero");
        }
        if self.max_delay_millis < self.base_delay_millis {
            bail!("max_delay_millis must not be smaller than base_delay_millis");
        }
        Ok(())
    }

    pub(crate) fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            base_delay: std::time::Duration::from_millis(self.base_delay_millis),
            max_delay: std::time::Duration::from_millis(self.max_delay_millis),
            bucket_rate_per_sec: self.bucket_rate_per_sec,
            bucket_burst: self.bucket_burst,
        }
    }
}
