use serde::Deserialize;
use std::env;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use streamgate_ai::{BackendConfig, ProviderKind};

const CONFIG_PATH_VAR: &str = "STREAMGATE_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "streamgate.toml";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub inference: BackendConfig,
    pub auth: AuthConfig,
    pub transcripts: TranscriptConfig,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// How callers are identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthModule {
    #[default]
    Noop,
    ApiKey,
    Jwt,
}

impl FromStr for AuthModule {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "noop" => Ok(AuthModule::Noop),
            "api_key" => Ok(AuthModule::ApiKey),
            "jwt" => Ok(AuthModule::Jwt),
            other => Err(format!("unknown auth module '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub module: AuthModule,
    /// `owner:key` pairs accepted by the `api_key` module.
    pub api_keys: Vec<String>,
    pub jwt_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TranscriptConfig {
    pub enabled: bool,
    pub storage_path: PathBuf,
    pub store_partial: bool,
    pub anonymization_pepper: Option<String>,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            storage_path: PathBuf::from("transcripts"),
            store_partial: false,
            anonymization_pepper: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    logging: LoggingSection,
    #[serde(default)]
    inference: BackendConfig,
    #[serde(default)]
    auth: AuthConfig,
    #[serde(default)]
    transcripts: TranscriptConfig,
    #[serde(default)]
    streaming: StreamingSection,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct LoggingSection {
    #[serde(default)]
    format: LogFormat,
}

#[derive(Debug, Deserialize)]
struct StreamingSection {
    #[serde(default = "default_channel_capacity")]
    channel_capacity: usize,
}

impl Default for StreamingSection {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_channel_capacity() -> usize {
    streamgate_core::session::DEFAULT_CHANNEL_CAPACITY
}

impl From<FileConfig> for ServerConfig {
    fn from(file: FileConfig) -> Self {
        Self {
            host: file.server.host,
            port: file.server.port,
            log_format: file.logging.format,
            inference: file.inference,
            auth: file.auth,
            transcripts: file.transcripts,
            channel_capacity: file.streaming.channel_capacity,
        }
    }
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        if let Some(config) = load_from_file()? {
            return Ok(config);
        }

        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let parsed: FileConfig = toml::from_str(contents)?;
        let config = Self::from(parsed);
        config.validate()?;
        Ok(config)
    }

    /// Build the configuration from `STREAMGATE_*` variables served by `lookup`.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let inference = BackendConfig {
            provider: parse_var::<ProviderKind>(&var, "STREAMGATE_PROVIDER")?.unwrap_or_default(),
            model: var("STREAMGATE_MODEL"),
            base_url: var("STREAMGATE_BASE_URL"),
            api_key: var("STREAMGATE_INFERENCE_API_KEY"),
            system_prompt: var("STREAMGATE_SYSTEM_PROMPT"),
            mock_token_delay_ms: parse_var(&var, "STREAMGATE_MOCK_TOKEN_DELAY_MS")?
                .unwrap_or_default(),
        };

        let auth = AuthConfig {
            module: parse_var(&var, "STREAMGATE_AUTH_MODULE")?.unwrap_or_default(),
            api_keys: var("STREAMGATE_API_KEYS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            jwt_secret: var("STREAMGATE_JWT_SECRET"),
        };

        let transcript_defaults = TranscriptConfig::default();
        let transcripts = TranscriptConfig {
            enabled: parse_flag(&var, "STREAMGATE_TRANSCRIPTS_ENABLED")?.unwrap_or(false),
            storage_path: var("STREAMGATE_TRANSCRIPTS_PATH")
                .map(PathBuf::from)
                .unwrap_or(transcript_defaults.storage_path),
            store_partial: parse_flag(&var, "STREAMGATE_TRANSCRIPTS_STORE_PARTIAL")?
                .unwrap_or(false),
            anonymization_pepper: var("STREAMGATE_TRANSCRIPTS_PEPPER"),
        };

        let config = Self {
            host: var("STREAMGATE_HOST").unwrap_or_else(default_host),
            port: parse_var(&var, "STREAMGATE_PORT")?.unwrap_or_else(default_port),
            log_format: parse_var(&var, "STREAMGATE_LOG_FORMAT")?.unwrap_or_default(),
            inference,
            auth,
            transcripts,
            channel_capacity: parse_var(&var, "STREAMGATE_CHANNEL_CAPACITY")?
                .unwrap_or_else(default_channel_capacity),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.channel_capacity == 0 {
            anyhow::bail!("streaming.channel_capacity must be at least 1");
        }

        match self.auth.module {
            AuthModule::Noop => {}
            AuthModule::ApiKey => {
                if self.auth.api_keys.is_empty() {
                    anyhow::bail!("auth module 'api_key' requires at least one api key");
                }
                if let Some(entry) = self
                    .auth
                    .api_keys
                    .iter()
                    .find(|entry| split_api_key(entry).is_none())
                {
                    anyhow::bail!("api key entry '{}' is not in owner:key form", redact(entry));
                }
            }
            AuthModule::Jwt => {
                if self.auth.jwt_secret.as_deref().is_none_or(str::is_empty) {
                    anyhow::bail!("auth module 'jwt' requires jwt_secret");
                }
            }
        }
        Ok(())
    }
}

/// Split an `owner:key` entry.
pub fn split_api_key(entry: &str) -> Option<(&str, &str)> {
    let (owner, key) = entry.split_once(':')?;
    let (owner, key) = (owner.trim(), key.trim());
    if owner.is_empty() || key.is_empty() {
        return None;
    }
    Some((owner, key))
}

fn redact(entry: &str) -> String {
    match entry.split_once(':') {
        Some((owner, _)) => format!("{}:***", owner),
        None => "***".to_string(),
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    var(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|err| anyhow::anyhow!("Invalid value for {}: {}", name, err))
        })
        .transpose()
}

fn parse_flag(var: &impl Fn(&str) -> Option<String>, name: &str) -> anyhow::Result<Option<bool>> {
    var(name)
        .map(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(anyhow::anyhow!("Invalid value for {}: {}", name, other)),
        })
        .transpose()
}

fn load_from_file() -> anyhow::Result<Option<ServerConfig>> {
    let config_path = env::var(CONFIG_PATH_VAR).ok();
    let path = if let Some(path) = config_path {
        Some(path)
    } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
        Some(DEFAULT_CONFIG_FILE.to_string())
    } else {
        None
    };

    let Some(path) = path else {
        return Ok(None);
    };

    let contents = fs::read_to_string(&path)
        .map_err(|err| anyhow::anyhow!("Failed to read config {}: {}", path, err))?;
    let parsed = ServerConfig::from_toml_str(&contents)
        .map_err(|err| anyhow::anyhow!("Failed to parse config {}: {}", path, err))?;
    Ok(Some(parsed))
}
