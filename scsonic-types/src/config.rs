//! Transport configuration with defaults supplied at one site.
//!
//! An embedded `config.toml` carries the defaults; a user file at
//! `<config-dir>/scsonic/config.toml` may override individual keys.
//! Malformed user files are logged and ignored.

use std::path::PathBuf;

use serde::Deserialize;

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

/// Concurrency mode of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Atomics + wait/notify on one shared region; worker readers.
    SharedMemory,
    /// Datagrams posted over channels; the audio thread owns the region.
    #[default]
    MessagePassing,
}

impl Mode {
    fn parse(s: &str) -> Option<Mode> {
        match s {
            "shared-memory" => Some(Mode::SharedMemory),
            "message-passing" => Some(Mode::MessagePassing),
            _ => None,
        }
    }
}

/// Engine world options, passed through to the engine's init export
/// unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldOptions {
    pub num_buffers: u32,
    pub max_nodes: u32,
    pub max_graph_defs: u32,
    pub real_time_memory_kb: u32,
    pub num_input_bus_channels: u32,
    pub num_output_bus_channels: u32,
    pub verbosity: i32,
}

impl Default for WorldOptions {
    fn default() -> Self {
        Self {
            num_buffers: 1024,
            max_nodes: 1024,
            max_graph_defs: 1024,
            real_time_memory_kb: 8192,
            num_input_bus_channels: 2,
            num_output_bus_channels: 2,
            verbosity: 0,
        }
    }
}

/// Resolved transport configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub mode: Mode,
    /// Bundles due within this window bypass the prescheduler (seconds).
    pub bypass_lookahead: f64,
    /// Combined heap + retry-queue capacity of the prescheduler.
    pub prescheduler_capacity: usize,
    /// Minimum interval between metrics/tree snapshots.
    pub snapshot_interval_ms: u64,
    /// Retries for sample-file loads before giving up.
    pub fetch_max_retries: u32,
    /// Base delay between load retries; doubles per attempt.
    pub fetch_retry_delay_ms: u64,
    pub world: WorldOptions,
}

impl Default for Config {
    fn default() -> Self {
        let file: ConfigFile =
            toml::from_str(DEFAULT_CONFIG).expect("embedded config.toml must parse");
        Config::from_file(file)
    }
}

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    transport: TransportSection,
    #[serde(default)]
    fetch: FetchSection,
    #[serde(default)]
    world: WorldSection,
}

#[derive(Deserialize, Default)]
struct TransportSection {
    mode: Option<String>,
    bypass_lookahead_secs: Option<f64>,
    prescheduler_capacity: Option<usize>,
    snapshot_interval_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct FetchSection {
    max_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct WorldSection {
    num_buffers: Option<u32>,
    max_nodes: Option<u32>,
    max_graph_defs: Option<u32>,
    real_time_memory_kb: Option<u32>,
    num_input_bus_channels: Option<u32>,
    num_output_bus_channels: Option<u32>,
    verbosity: Option<i32>,
}

fn merge(base: &mut ConfigFile, user: ConfigFile) {
    macro_rules! take {
        ($($section:ident . $field:ident),* $(,)?) => {
            $(if user.$section.$field.is_some() {
                base.$section.$field = user.$section.$field;
            })*
        };
    }
    take!(
        transport.mode,
        transport.bypass_lookahead_secs,
        transport.prescheduler_capacity,
        transport.snapshot_interval_ms,
        fetch.max_retries,
        fetch.retry_delay_ms,
        world.num_buffers,
        world.max_nodes,
        world.max_graph_defs,
        world.real_time_memory_kb,
        world.num_input_bus_channels,
        world.num_output_bus_channels,
        world.verbosity,
    );
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("scsonic").join("config.toml"))
}

impl Config {
    /// Load defaults merged with the user's config file, if present.
    pub fn load() -> Self {
        let mut base: ConfigFile =
            toml::from_str(DEFAULT_CONFIG).expect("embedded config.toml must parse");

        if let Some(path) = user_config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
                        Ok(user) => merge(&mut base, user),
                        Err(e) => {
                            log::warn!(target: "config", "ignoring malformed config {}: {}", path.display(), e)
                        }
                    },
                    Err(e) => {
                        log::warn!(target: "config", "could not read {}: {}", path.display(), e)
                    }
                }
            }
        }

        Config::from_file(base)
    }

    fn from_file(file: ConfigFile) -> Self {
        let defaults = WorldOptions::default();
        let mode = file
            .transport
            .mode
            .as_deref()
            .and_then(Mode::parse)
            .unwrap_or_default();
        Config {
            mode,
            bypass_lookahead: file.transport.bypass_lookahead_secs.unwrap_or(0.5),
            prescheduler_capacity: file.transport.prescheduler_capacity.unwrap_or(65536),
            snapshot_interval_ms: file.transport.snapshot_interval_ms.unwrap_or(150),
            fetch_max_retries: file.fetch.max_retries.unwrap_or(3),
            fetch_retry_delay_ms: file.fetch.retry_delay_ms.unwrap_or(1000),
            world: WorldOptions {
                num_buffers: file.world.num_buffers.unwrap_or(defaults.num_buffers),
                max_nodes: file.world.max_nodes.unwrap_or(defaults.max_nodes),
                max_graph_defs: file.world.max_graph_defs.unwrap_or(defaults.max_graph_defs),
                real_time_memory_kb: file
                    .world
                    .real_time_memory_kb
                    .unwrap_or(defaults.real_time_memory_kb),
                num_input_bus_channels: file
                    .world
                    .num_input_bus_channels
                    .unwrap_or(defaults.num_input_bus_channels),
                num_output_bus_channels: file
                    .world
                    .num_output_bus_channels
                    .unwrap_or(defaults.num_output_bus_channels),
                verbosity: file.world.verbosity.unwrap_or(defaults.verbosity),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_resolve() {
        let c = Config::default();
        assert_eq!(c.mode, Mode::MessagePassing);
        assert_eq!(c.bypass_lookahead, 0.5);
        assert_eq!(c.prescheduler_capacity, 65536);
        assert_eq!(c.snapshot_interval_ms, 150);
        assert_eq!(c.fetch_max_retries, 3);
        assert_eq!(c.fetch_retry_delay_ms, 1000);
    }

    #[test]
    fn user_values_override_defaults() {
        let mut base: ConfigFile = toml::from_str(DEFAULT_CONFIG).unwrap();
        let user: ConfigFile = toml::from_str(
            r#"
            [transport]
            mode = "shared-memory"
            prescheduler_capacity = 4
            "#,
        )
        .unwrap();
        merge(&mut base, user);
        let c = Config::from_file(base);
        assert_eq!(c.mode, Mode::SharedMemory);
        assert_eq!(c.prescheduler_capacity, 4);
        // untouched keys keep their defaults
        assert_eq!(c.snapshot_interval_ms, 150);
    }

    #[test]
    fn unknown_mode_falls_back_to_default() {
        let user: ConfigFile = toml::from_str("[transport]\nmode = \"telepathy\"\n").unwrap();
        let c = Config::from_file(user);
        assert_eq!(c.mode, Mode::MessagePassing);
    }
}
