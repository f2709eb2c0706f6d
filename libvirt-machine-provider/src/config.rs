//! Layered configuration: an optional YAML file overlaid with CLI flags,
//! falling back to hard-coded defaults (file values are overridden by
//! whatever flags the operator actually passed).

use serde::Deserialize;

fn default_workers() -> usize {
    15
}

fn default_base_delay_ms() -> u64 {
    5
}

fn default_max_delay_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub root_dir: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_base_delay_ms")]
    pub rate_limiter_base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub rate_limiter_max_delay_ms: u64,
    #[serde(default)]
    pub tcmalloc_lib_path: Option<String>,
}

impl Settings {
    /// Loads `path` (if given) via the `config` crate, then overlays any
    /// CLI-provided overrides on top — CLI flags win over the file,
    /// hard-coded defaults win over neither being set.
    pub fn load(config_file: Option<&str>, overrides: ConfigOverrides) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        if let Some(root_dir) = &overrides.root_dir {
            builder = builder.set_override("root_dir", root_dir.clone())?;
        }
        if let Some(workers) = overrides.workers {
            builder = builder.set_override("workers", workers as i64)?;
        }
        if let Some(path) = &overrides.tcmalloc_lib_path {
            builder = builder.set_override("tcmalloc_lib_path", path.clone())?;
        }
        let settings = builder.build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub root_dir: Option<String>,
    pub workers: Option<usize>,
    pub tcmalloc_lib_path: Option<String>,
}
