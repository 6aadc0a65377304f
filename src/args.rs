// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration plumbing shared by the daemon and client drivers: RON
//! config files whose missing fields fall back to serde defaults, overlaid
//! field-by-field with bpaf flags.

use std::env;
use std::fmt::Debug;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;

use bpaf::Parser;
use ron::Options;
use ron::extensions::Extensions;
use serde::Deserialize;
use serde::Serialize;
use tracing::Level;

use crate::manager::FarMemConfig;
use crate::prelude::*;

/// Where farmem config files live: `$XDG_CONFIG_HOME/farmem`, falling back
/// to `~/.config/farmem`, then `/etc/farmem`.
pub fn default_config_dir() -> PathBuf {
    let base = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| home::home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from("/etc"));
    base.join("farmem")
}

pub fn default_config_file(name: &str) -> PathBuf {
    default_config_dir().join(format!("{name}.ron"))
}

pub fn default_control_socket_path(prefix: &str) -> PathBuf {
    let dir = env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| env::temp_dir().join(whoami::username()));
    dir.join(format!("{prefix}-ctrl.sock"))
}

/// Loads `name.ron`. An explicitly named file must exist and parse; the
/// default location is allowed to be absent, in which case the type's
/// defaults are used. Partial files work: every farmem config struct
/// carries serde defaults.
pub fn load_or_default<T>(explicit: Option<&Path>, name: &str) -> Result<T>
where
    T: Debug + Default + for<'de> Deserialize<'de>,
{
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => (default_config_file(name), false),
    };
    if !path.exists() {
        ensure!(!required, "config file {path:?} does not exist");
        debug!("no config file at {path:?}, using defaults");
        return Ok(T::default());
    }
    let text = fs::read_to_string(&path)
        .with_context(loc!(), || format!("reading config file {path:?}"))?;
    let config: T = Options::default()
        .with_default_extension(Extensions::IMPLICIT_SOME)
        .from_str(&text)
        .with_context(loc!(), || format!("parsing config file {path:?}"))?;
    debug!("config from {path:?}: {config:#?}");
    Ok(config)
}

/// Prints a default config in RON to stdout and exits. Redirecting stdout
/// to the config location yields a starter file.
pub fn print_default_config_and_exit<T: Default + Serialize>() -> ! {
    let pretty = ron::ser::PrettyConfig::default();
    println!(
        "{}",
        ron::ser::to_string_pretty(&T::default(), pretty).unwrap()
    );
    process::exit(0);
}

pub fn parse_level(s: &str) -> Result<Level> {
    Level::from_str(s).with_context(loc!(), || format!("bad log level {s:?}"))
}

/* Flags every farmem binary takes. */

pub fn config_file() -> impl Parser<Option<PathBuf>> {
    bpaf::long("config-file")
        .argument::<PathBuf>("PATH")
        .help("Config file to read. Defaults to <name>.ron in farmem's config dir, which may be absent.")
        .optional()
}

pub fn print_default_config() -> impl Parser<bool> {
    bpaf::long("print-default-config")
        .help("Print a config file with default values to stdout and exit.")
        .switch()
}

/// Runtime tuning flags for the client side. Drivers parse these alongside
/// their own flags and overlay them on a [`FarMemConfig`] loaded from file.
#[derive(Debug, Clone, Default)]
pub struct FarMemOverrides {
    pub cache_bytes: Option<usize>,
    pub gc_threads: Option<usize>,
    pub num_connections: Option<usize>,
    pub prefetch_workers: Option<usize>,
    pub prefetch_num: Option<u32>,
    pub trend_window: Option<usize>,
    pub pushdown_ratio: Option<f64>,
}

pub fn far_mem_overrides() -> impl Parser<FarMemOverrides> {
    let cache_bytes = bpaf::long("cache-bytes")
        .argument::<usize>("BYTES")
        .help("Local cache capacity in bytes.")
        .optional();
    let gc_threads = bpaf::long("gc-threads")
        .argument::<usize>("N")
        .help("Background evictor threads.")
        .optional();
    let num_connections = bpaf::long("connections")
        .argument::<usize>("N")
        .help("Request connections in the device pool.")
        .optional();
    let prefetch_workers = bpaf::long("prefetch-workers")
        .argument::<usize>("N")
        .help("Worker threads per prefetcher, at most 16.")
        .optional();
    let prefetch_num = bpaf::long("prefetch-num")
        .argument::<u32>("N")
        .help("Speculative fetches issued per trend hit.")
        .optional();
    let trend_window = bpaf::long("trend-window")
        .argument::<usize>("N")
        .help("Pattern window of the trend predictor.")
        .optional();
    let pushdown_ratio = bpaf::long("pushdown-ratio")
        .argument::<f64>("RATIO")
        .help("Hysteresis factor below 1 biasing calls toward local execution.")
        .optional();
    bpaf::construct!(FarMemOverrides {
        cache_bytes,
        gc_threads,
        num_connections,
        prefetch_workers,
        prefetch_num,
        trend_window,
        pushdown_ratio,
    })
}

impl FarMemOverrides {
    pub fn apply(&self, config: &mut FarMemConfig) {
        if let Some(cache_bytes) = self.cache_bytes {
            config.cache_bytes = cache_bytes;
        }
        if let Some(gc_threads) = self.gc_threads {
            config.gc_threads = gc_threads;
        }
        if let Some(num_connections) = self.num_connections {
            config.num_connections = num_connections;
        }
        if let Some(prefetch_workers) = self.prefetch_workers {
            config.prefetch_workers = prefetch_workers;
        }
        if let Some(prefetch_num) = self.prefetch_num {
            config.prefetch_num = prefetch_num;
        }
        if let Some(trend_window) = self.trend_window {
            config.trend_window = trend_window;
        }
        if let Some(pushdown_ratio) = self.pushdown_ratio {
            config.pushdown_ratio = pushdown_ratio;
        }
    }
}
