// ConfigurationStore: loading/saving builder settings from disk, plus
// environment overrides and validation.

use crate::constants::{self, broker, path, pool, topics, variables, OsPlatform};

use builder_sdk::StringUtil;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A settings problem detected at startup. Always fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read settings from {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Broker credentials are required outside the 'production' environment")]
    MissingCredentials,
}

// ---------------------------------------------------------------------------
// BuilderSettings
// ---------------------------------------------------------------------------

/// Broker acknowledgment mode for the job and keepalive subscriptions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckMode {
    /// The broker treats a message as delivered once it is handed over.
    #[default]
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    /// Header value used in a STOMP `SUBSCRIBE` frame.
    pub fn as_header(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }

    /// Whether received messages must be acknowledged explicitly.
    pub fn requires_ack(&self) -> bool {
        !matches!(self, AckMode::Auto)
    }
}

/// Broker destinations used by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topics {
    pub jobs: String,
    pub events: String,
    pub keepalive: String,
    pub keepalive_response: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            jobs: topics::JOBS.to_string(),
            events: topics::EVENTS.to_string(),
            keepalive: topics::KEEPALIVE.to_string(),
            keepalive_response: topics::KEEPALIVE_RESPONSE.to_string(),
        }
    }
}

/// Username/password pair for the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Persisted worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderSettings {
    pub broker_host: String,
    pub broker_port: u16,

    /// Deployment mode; `production` connects without credentials.
    pub environment: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Root of the packagebuilder installation (build scripts live here).
    pub packagebuilder_home: Option<PathBuf>,

    /// Where job workspaces are created. Defaults to `<home>/jobs`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs_directory: Option<PathBuf>,

    /// External build program. Defaults to `<home>/<builder_id>.sh` (`.bat` on Windows).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_command: Option<PathBuf>,

    /// Identity used when the host name cannot be normalized unambiguously.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub builder_host: Option<String>,

    pub topics: Topics,
    pub ack_mode: AckMode,

    pub max_concurrent_jobs: usize,
    pub job_queue_capacity: usize,
    pub spawn_attempts: u32,

    /// Reconnect attempts after a dropped session; 0 means keep trying.
    pub max_reconnect_attempts: u32,
    pub connect_timeout_secs: u64,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            broker_host: broker::DEFAULT_HOST.to_string(),
            broker_port: broker::DEFAULT_PORT,
            environment: "development".to_string(),
            username: None,
            password: None,
            packagebuilder_home: None,
            jobs_directory: None,
            build_command: None,
            builder_host: None,
            topics: Topics::default(),
            ack_mode: AckMode::default(),
            max_concurrent_jobs: pool::DEFAULT_MAX_CONCURRENT_JOBS,
            job_queue_capacity: pool::DEFAULT_QUEUE_CAPACITY,
            spawn_attempts: pool::DEFAULT_SPAWN_ATTEMPTS,
            max_reconnect_attempts: 0,
            connect_timeout_secs: broker::DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl BuilderSettings {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case(constants::PRODUCTION_ENVIRONMENT)
    }

    /// Credentials to present to the broker, or `None` in production.
    pub fn broker_credentials(&self) -> Result<Option<Credentials>, ConfigError> {
        if self.is_production() {
            return Ok(None);
        }
        let username = self
            .username
            .as_deref()
            .and_then(StringUtil::non_empty)
            .ok_or(ConfigError::MissingCredentials)?;
        Ok(Some(Credentials {
            username: username.to_string(),
            password: self.password.clone().unwrap_or_default(),
        }))
    }

    fn home(&self) -> Result<&Path, ConfigError> {
        self.packagebuilder_home
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid {
                field: "packagebuilder_home",
                reason: "not set".to_string(),
            })
    }

    /// Root directory for job workspaces.
    pub fn jobs_root(&self) -> Result<PathBuf, ConfigError> {
        match &self.jobs_directory {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.home()?.join(path::JOBS_DIRECTORY)),
        }
    }

    /// The external build program for this builder.
    pub fn build_program(&self, builder_id: &str, platform: OsPlatform) -> Result<PathBuf, ConfigError> {
        match &self.build_command {
            Some(cmd) => Ok(cmd.clone()),
            None => Ok(self
                .home()?
                .join(format!("{}{}", builder_id, platform.build_script_extension()))),
        }
    }

    /// Apply environment overrides. `lookup` is `std::env::var(..).ok()` in production.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(variables::ENVIRONMENT) {
            self.environment = v;
        }
        if let Some(v) = get(variables::BROKER_USER) {
            self.username = Some(v);
        }
        if let Some(v) = get(variables::BROKER_PASSWORD) {
            self.password = Some(v);
        }
        if let Some(v) = get(variables::BROKER_HOST) {
            self.broker_host = v;
        }
        if let Some(v) = get(variables::BROKER_PORT) {
            self.broker_port = v.trim().parse().map_err(|_| ConfigError::Invalid {
                field: "broker_port",
                reason: format!("'{v}' is not a port number"),
            })?;
        }
        if let Some(v) = get(variables::PACKAGEBUILDER_HOME) {
            self.packagebuilder_home = Some(PathBuf::from(v));
        }
        if let Some(v) = get(variables::PACKAGEBUILDER_HOST) {
            self.builder_host = Some(v);
        }
        Ok(())
    }

    /// Check the settings needed to run the message loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_host.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "broker_host",
                reason: "must not be empty".to_string(),
            });
        }
        if self.broker_port == 0 {
            return Err(ConfigError::Invalid {
                field: "broker_port",
                reason: "must not be 0".to_string(),
            });
        }
        self.home()?;
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_jobs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.job_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "job_queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.spawn_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "spawn_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        let topics = [
            ("topics.jobs", &self.topics.jobs),
            ("topics.events", &self.topics.events),
            ("topics.keepalive", &self.topics.keepalive),
            ("topics.keepalive_response", &self.topics.keepalive_response),
        ];
        for (field, topic) in topics {
            if topic.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must not be empty".to_string(),
                });
            }
        }
        if self.topics.jobs == self.topics.keepalive {
            return Err(ConfigError::Invalid {
                field: "topics.keepalive",
                reason: "must differ from topics.jobs".to_string(),
            });
        }
        self.broker_credentials()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ConfigurationStore
// ---------------------------------------------------------------------------

/// Loads and saves `BuilderSettings` as JSON.
pub struct ConfigurationStore {
    config_file_path: PathBuf,
    settings: Mutex<Option<BuilderSettings>>,
}

impl ConfigurationStore {
    pub fn new(config_file_path: impl Into<PathBuf>) -> Self {
        Self {
            config_file_path: config_file_path.into(),
            settings: Mutex::new(None),
        }
    }

    pub fn config_file_path(&self) -> &Path {
        &self.config_file_path
    }

    /// Whether a settings file exists on disk.
    pub fn is_configured(&self) -> bool {
        self.config_file_path.exists()
    }

    /// Load settings from disk, or defaults when no file exists. Cached after first load.
    pub fn get_settings(&self) -> Result<BuilderSettings, ConfigError> {
        let mut guard = self.settings.lock();
        if let Some(ref settings) = *guard {
            return Ok(settings.clone());
        }

        let settings = if self.is_configured() {
            let json = fs::read_to_string(&self.config_file_path).map_err(|source| {
                ConfigError::Read {
                    path: self.config_file_path.clone(),
                    source,
                }
            })?;
            serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
                path: self.config_file_path.clone(),
                source,
            })?
        } else {
            BuilderSettings::default()
        };

        *guard = Some(settings.clone());
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid_settings() -> BuilderSettings {
        BuilderSettings {
            packagebuilder_home: Some(PathBuf::from("/opt/packagebuilder")),
            username: Some("builder".to_string()),
            password: Some("secret".to_string()),
            ..BuilderSettings::default()
        }
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigurationStore::new(dir.path().join(".builder"));
        assert!(!store.is_configured());
        let settings = store.get_settings().unwrap();
        assert_eq!(settings, BuilderSettings::default());
        assert_eq!(settings.topics.jobs, "/topic/buildjobs");
        assert_eq!(settings.broker_port, 61613);
    }

    #[test]
    fn full_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".builder");
        let settings = valid_settings();
        fs::write(&path, serde_json::to_string_pretty(&settings).unwrap()).unwrap();

        let reloaded = ConfigurationStore::new(&path).get_settings().unwrap();
        assert_eq!(reloaded, settings);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".builder");
        fs::write(
            &path,
            r#"{"broker_host": "broker.example.org", "ack_mode": "client-individual"}"#,
        )
        .unwrap();

        let settings = ConfigurationStore::new(&path).get_settings().unwrap();
        assert_eq!(settings.broker_host, "broker.example.org");
        assert_eq!(settings.ack_mode, AckMode::ClientIndividual);
        assert_eq!(settings.max_concurrent_jobs, 4);
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".builder");
        fs::write(&path, "{ not json").unwrap();
        let err = ConfigurationStore::new(&path).get_settings().unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("SPB_ENVIRONMENT", "production"),
            ("BROKER_HOST", "mq.internal"),
            ("BROKER_PORT", "61614"),
            ("PACKAGEBUILDER_HOME", "/srv/spb"),
            ("PACKAGEBUILDER_HOST", "linux1.bioconductor.org"),
            ("ACTIVEMQ_USER", "   "),
        ]
        .into_iter()
        .collect();

        let mut settings = BuilderSettings::default();
        settings
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert!(settings.is_production());
        assert_eq!(settings.broker_host, "mq.internal");
        assert_eq!(settings.broker_port, 61614);
        assert_eq!(settings.packagebuilder_home, Some(PathBuf::from("/srv/spb")));
        assert_eq!(settings.builder_host.as_deref(), Some("linux1.bioconductor.org"));
        assert_eq!(settings.username, None);
    }

    #[test]
    fn bad_port_override_is_invalid() {
        let mut settings = BuilderSettings::default();
        let err = settings
            .apply_env_overrides(|k| (k == "BROKER_PORT").then(|| "abc".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "broker_port", .. }));
    }

    #[test]
    fn production_connects_without_credentials() {
        let settings = BuilderSettings {
            environment: "production".to_string(),
            username: Some("ignored".to_string()),
            ..valid_settings()
        };
        assert_eq!(settings.broker_credentials().unwrap(), None);
    }

    #[test]
    fn non_production_requires_username() {
        let settings = BuilderSettings {
            username: None,
            ..valid_settings()
        };
        assert!(matches!(
            settings.broker_credentials(),
            Err(ConfigError::MissingCredentials)
        ));

        let creds = valid_settings().broker_credentials().unwrap().unwrap();
        assert_eq!(creds.username, "builder");
        assert_eq!(creds.password, "secret");
    }

    #[test]
    fn derived_paths() {
        let settings = valid_settings();
        assert_eq!(
            settings.jobs_root().unwrap(),
            PathBuf::from("/opt/packagebuilder/jobs")
        );
        assert_eq!(
            settings.build_program("linux1", OsPlatform::Linux).unwrap(),
            PathBuf::from("/opt/packagebuilder/linux1.sh")
        );
        assert_eq!(
            settings.build_program("windows1", OsPlatform::Windows).unwrap(),
            PathBuf::from("/opt/packagebuilder/windows1.bat")
        );

        let custom = BuilderSettings {
            jobs_directory: Some(PathBuf::from("/scratch/jobs")),
            build_command: Some(PathBuf::from("/usr/local/bin/spb-build")),
            ..valid_settings()
        };
        assert_eq!(custom.jobs_root().unwrap(), PathBuf::from("/scratch/jobs"));
        assert_eq!(
            custom.build_program("any", OsPlatform::Linux).unwrap(),
            PathBuf::from("/usr/local/bin/spb-build")
        );
    }

    #[test]
    fn validate_catches_bad_values() {
        assert!(valid_settings().validate().is_ok());

        let no_home = BuilderSettings {
            packagebuilder_home: None,
            ..valid_settings()
        };
        assert!(matches!(
            no_home.validate(),
            Err(ConfigError::Invalid { field: "packagebuilder_home", .. })
        ));

        let no_workers = BuilderSettings {
            max_concurrent_jobs: 0,
            ..valid_settings()
        };
        assert!(no_workers.validate().is_err());

        let mut clash = valid_settings();
        clash.topics.keepalive = clash.topics.jobs.clone();
        assert!(matches!(
            clash.validate(),
            Err(ConfigError::Invalid { field: "topics.keepalive", .. })
        ));
    }

    #[test]
    fn ack_mode_headers() {
        assert_eq!(AckMode::Auto.as_header(), "auto");
        assert!(!AckMode::Auto.requires_ack());
        assert_eq!(AckMode::Client.as_header(), "client");
        assert!(AckMode::ClientIndividual.requires_ack());
    }
}
