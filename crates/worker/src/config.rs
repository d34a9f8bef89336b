//! Worker configuration loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use meteomap_core::parameter::parse_parameter_list;
use meteomap_core::region::{default_regions, parse_region_table};
use meteomap_core::{CoreError, Parameter, Region};
use meteomap_events::connection::{DEFAULT_HEARTBEAT_SECS, DEFAULT_RETRY_INTERVAL};
use meteomap_events::{amqp_uri, BrokerSettings, QueueLayout};
use meteomap_pipeline::{pool, AckMode, CommandRenderer, OrchestratorConfig, DEFAULT_MAX_IN_FLIGHT};
use meteomap_storage::S3Config;

use crate::telemetry::LogFormat;

/// A configuration value that could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{var}: {source}")]
    Domain {
        var: &'static str,
        #[source]
        source: CoreError,
    },
}

/// Everything the worker needs to start.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub broker: BrokerSettings,
    pub storage: S3Config,
    pub regions: Vec<Region>,
    pub parameters: Vec<Parameter>,
    pub orchestrator: OrchestratorConfig,
    /// Render slots in the worker pool.
    pub worker_threads: usize,
    pub render_command: String,
    /// Kill a render or index process running longer than this.
    pub render_timeout: Option<Duration>,
    pub render_work_dir: PathBuf,
    pub log_format: LogFormat,
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                   | Default                                   |
    /// |---------------------------|-------------------------------------------|
    /// | `RABBITMQ_URL`            | built from the `RABBITMQ_*` parts below   |
    /// | `RABBITMQ_HOST`           | `localhost`                               |
    /// | `RABBITMQ_PORT`           | `5672`                                    |
    /// | `RABBITMQ_USER`           | `guest`                                   |
    /// | `RABBITMQ_PASSWORD`       | `guest`                                   |
    /// | `RABBITMQ_VHOST`          | `/`                                       |
    /// | `RABBITMQ_HEARTBEAT_SECS` | `600`                                     |
    /// | `RECONNECT_INTERVAL_SECS` | `5`                                       |
    /// | `PREFETCH_COUNT`          | `2 * MAX_CONCURRENT_EVENTS`               |
    /// | `MINIO_ENDPOINT`          | `minio:9000`                              |
    /// | `MINIO_ACCESS_KEY`        | `minioadmin`                              |
    /// | `MINIO_SECRET_KEY`        | `minioadmin`                              |
    /// | `MINIO_BUCKET`            | `weather-maps`                            |
    /// | `MINIO_REGION`            | `us-east-1`                               |
    /// | `MINIO_SECURE`            | `false`                                   |
    /// | `REGIONS`                 | built-in table (JSON object)              |
    /// | `PARAMETERS`              | `t2m,apcp,synoptic`                       |
    /// | `LISTEN_MODEL`            | unset (shared queue)                      |
    /// | `ACK_MODE`                | `reliable`                                |
    /// | `MAX_CONCURRENT_EVENTS`   | `5`                                       |
    /// | `WORKER_THREADS`          | available parallelism                     |
    /// | `RENDER_COMMAND`          | `map-render`                              |
    /// | `RENDER_TIMEOUT_SECS`     | unset (no limit; `0` also means none)     |
    /// | `RENDER_WORK_DIR`         | `<tmp>/meteomap`                          |
    /// | `LOG_FORMAT`              | `text`                                    |
    ///
    /// `PREFETCH_COUNT` is shared by render and deletion deliveries on the
    /// one consumer channel. In reliable mode render deliveries hold their
    /// credit until published, so once `PREFETCH_COUNT` of them are
    /// outstanding a `map.deleted` message waits for one of them to finish.
    /// The default leaves `MAX_CONCURRENT_EVENTS` of headroom for deletions
    /// and queued render events; raise it if deletions must never wait.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        // --- Orchestration ---
        let max_in_flight: usize = env.parse("MAX_CONCURRENT_EVENTS", DEFAULT_MAX_IN_FLIGHT, "a positive integer")?;
        if max_in_flight == 0 {
            return Err(env.invalid("MAX_CONCURRENT_EVENTS", "a positive integer", "0"));
        }

        let ack_mode = match env.get("ACK_MODE") {
            Some(raw) => raw
                .parse::<AckMode>()
                .map_err(|source| ConfigError::Domain { var: "ACK_MODE", source })?,
            None => AckMode::default(),
        };

        let listen_model = env.get("LISTEN_MODEL");

        // --- Broker ---
        let heartbeat: u16 = env.parse("RABBITMQ_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS, "a u16")?;
        let uri = match env.get("RABBITMQ_URL") {
            Some(uri) => uri,
            None => amqp_uri(
                &env.or("RABBITMQ_HOST", "localhost"),
                env.parse("RABBITMQ_PORT", 5672u16, "a valid port")?,
                &env.or("RABBITMQ_USER", "guest"),
                &env.or("RABBITMQ_PASSWORD", "guest"),
                &env.or("RABBITMQ_VHOST", "/"),
                heartbeat,
            ),
        };
        let retry_secs: u64 = env.parse(
            "RECONNECT_INTERVAL_SECS",
            DEFAULT_RETRY_INTERVAL.as_secs(),
            "a positive number of seconds",
        )?;
        if retry_secs == 0 {
            return Err(env.invalid("RECONNECT_INTERVAL_SECS", "a positive number of seconds", "0"));
        }
        // Twice the admission bound: one running unit and one queued delivery
        // per slot. See `from_env` for how this interacts with deletions.
        let default_prefetch = u16::try_from(max_in_flight.saturating_mul(2)).unwrap_or(u16::MAX);
        let prefetch: u16 = env.parse("PREFETCH_COUNT", default_prefetch, "a u16")?;

        let broker = BrokerSettings {
            uri,
            retry_interval: Duration::from_secs(retry_secs),
            prefetch,
            layout: QueueLayout::from_listen_model(listen_model.as_deref()),
        };

        // --- Object storage ---
        let storage = S3Config {
            endpoint: env.or("MINIO_ENDPOINT", "minio:9000"),
            access_key: env.or("MINIO_ACCESS_KEY", "minioadmin"),
            secret_key: env.or("MINIO_SECRET_KEY", "minioadmin"),
            bucket: env.or("MINIO_BUCKET", "weather-maps"),
            region: env.or("MINIO_REGION", "us-east-1"),
            secure: env.flag("MINIO_SECURE", false)?,
        };

        // --- Job matrix ---
        let regions = match env.get("REGIONS") {
            Some(json) => parse_region_table(&json)
                .map_err(|source| ConfigError::Domain { var: "REGIONS", source })?,
            None => default_regions(),
        };
        let parameters = parse_parameter_list(&env.or("PARAMETERS", "t2m,apcp,synoptic"))
            .map_err(|source| ConfigError::Domain { var: "PARAMETERS", source })?;

        // --- Rendering ---
        let worker_threads: usize = env.parse("WORKER_THREADS", pool::default_size(), "a positive integer")?;
        if worker_threads == 0 {
            return Err(env.invalid("WORKER_THREADS", "a positive integer", "0"));
        }
        let render_command = env.or("RENDER_COMMAND", "map-render");
        if CommandRenderer::from_command_line(&render_command).is_none() {
            return Err(env.invalid("RENDER_COMMAND", "a command line", &render_command));
        }
        let render_timeout_secs: u64 = env.parse("RENDER_TIMEOUT_SECS", 0, "a number of seconds")?;
        let render_timeout = (render_timeout_secs > 0).then(|| Duration::from_secs(render_timeout_secs));
        let render_work_dir = env
            .get("RENDER_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("meteomap"));

        let log_format: LogFormat = env.parse("LOG_FORMAT", LogFormat::Text, "'text' or 'json'")?;

        Ok(Self {
            broker,
            storage,
            regions,
            parameters,
            orchestrator: OrchestratorConfig {
                ack_mode,
                max_in_flight,
                listen_model,
            },
            worker_threads,
            render_command,
            render_timeout,
            render_work_dir,
            log_format,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed value; blank counts as unset.
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, name: &'static str, default: T, expected: &'static str) -> Result<T, ConfigError> {
        match self.get(name) {
            Some(raw) => raw.parse().map_err(|_| self.invalid(name, expected, &raw)),
            None => Ok(default),
        }
    }

    fn flag(&self, name: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(name).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(self.invalid(name, "a boolean", &v)),
            },
        }
    }

    fn invalid(&self, var: &'static str, expected: &'static str, value: &str) -> ConfigError {
        ConfigError::Invalid {
            var,
            expected,
            value: value.to_string(),
        }
    }
}
