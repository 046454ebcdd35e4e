use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::duration::{
    deserialize_duration, deserialize_duration_list, serialize_duration, serialize_duration_list,
};

/// Connection-level settings for the portal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// Scheme + host of the portal, without a trailing slash.
    pub base_url: String,

    pub user_agent: String,

    /// Per-request timeout. Every remote call carries its own.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub request_timeout: Duration,

    /// Hops followed in `RedirectMode::Follow` before giving up.
    pub max_redirects: usize,

    /// Page requested to decide whether a stored cookie is still authenticated.
    pub home_path: String,

    /// Element id holding the logged-in user's name on authenticated pages.
    pub user_marker_id: String,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: "https://mebbis.meb.gov.tr".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string(),
            request_timeout: Duration::from_secs(15),
            max_redirects: 5,
            home_path: "/main.aspx".to_string(),
            user_marker_id: "lblKullaniciAdi".to_string(),
        }
    }
}

/// Credential and manual-code step settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    pub login_path: String,
    pub username_field: String,
    pub password_field: String,
    pub submit_field: String,
    pub submit_value: String,

    /// The only redirect target that means "credentials accepted".
    pub success_redirect_path: String,

    /// Element whose text explains a rejected login.
    pub error_element_id: String,
    pub default_error_message: String,

    /// Page carrying the confirmation iframe and the manual code form.
    pub confirmation_path: String,
    pub code_field: String,
    pub code_event_target: String,

    /// Substring of the redirect location that means "code accepted".
    pub code_success_fragment: String,
    pub code_error_element_id: String,
    pub default_code_error_message: String,
    pub max_code_attempts: u32,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            login_path: "/default.aspx".to_string(),
            username_field: "txtKullaniciAd".to_string(),
            password_field: "txtSifre".to_string(),
            submit_field: "btnGiris".to_string(),
            submit_value: "Giriş".to_string(),
            success_redirect_path: "/giris_onay.aspx".to_string(),
            error_element_id: "lblHata".to_string(),
            default_error_message: "Giriş yapılamadı".to_string(),
            confirmation_path: "/giris_onay.aspx".to_string(),
            code_field: "txtDogrulamaKodu".to_string(),
            code_event_target: "dogrula".to_string(),
            code_success_fragment: "main.aspx".to_string(),
            code_error_element_id: "lblOnayHata".to_string(),
            default_code_error_message: "Doğrulama kodu hatalı".to_string(),
            max_code_attempts: 3,
        }
    }
}

/// Out-of-band confirmation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    /// How long a pending confirmation waits for the push event.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,

    /// Absolute endpoint receiving `{token, verify}`.
    pub verify_url: String,

    /// Finalization path; `{param}` is the pushed parameter, `{peer}` the
    /// masked peer id.
    pub finalize_path: String,

    pub request_event: String,
    pub proceed_event: String,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(150),
            verify_url: "https://mebbis.meb.gov.tr/onay/dogrula.ashx".to_string(),
            finalize_path: "/giris_onay.aspx?onay={param}&kimlik={peer}".to_string(),
            request_event: "onayIste".to_string(),
            proceed_event: "devamEt".to_string(),
        }
    }
}

/// One record category on the records page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryConfig {
    /// Option text in the category dropdown.
    pub label: String,
    /// Fallback option value when the dropdown doesn't list `label`.
    pub option_value: String,
    pub table_id: String,
}

/// Records page settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordsConfig {
    pub page_path: String,
    pub selector_field: String,
    pub vehicles: CategoryConfig,
    pub simulators: CategoryConfig,

    /// Redirect locations containing any of these mean the session expired.
    pub expiry_location_markers: Vec<String>,

    /// Bodies containing any of these are the login form, not data.
    pub expiry_body_markers: Vec<String>,
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            page_path: "/SKT/skt02006.aspx".to_string(),
            selector_field: "cmbListeTuru".to_string(),
            vehicles: CategoryConfig {
                label: "Araç".to_string(),
                option_value: "1".to_string(),
                table_id: "dgAracListesi".to_string(),
            },
            simulators: CategoryConfig {
                label: "Simülatör".to_string(),
                option_value: "2".to_string(),
                table_id: "dgSimulatorListesi".to_string(),
            },
            expiry_location_markers: vec!["default.aspx".to_string(), "login".to_string()],
            expiry_body_markers: vec![
                "txtKullaniciAd".to_string(),
                "Oturum süreniz dolmuştur".to_string(),
                "Session Timeout".to_string(),
            ],
        }
    }
}

/// Keep-alive scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub refresh_interval: Duration,

    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub rescan_interval: Duration,

    /// Consecutive failed pings before a session is evicted.
    pub failure_threshold: u32,

    /// Delays between retries of a connection-class error within one ping.
    #[serde(
        deserialize_with = "deserialize_duration_list",
        serialize_with = "serialize_duration_list"
    )]
    pub retry_delays: Vec<Duration>,

    /// Pause between validating sessions during bootstrap and rescans.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub validation_delay: Duration,

    /// Sessions loaded when nobody logged in today.
    pub bootstrap_limit: usize,

    /// Pages visited in rotation, one per ping.
    pub pages: Vec<String>,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10 * 60),
            rescan_interval: Duration::from_secs(30 * 60),
            failure_threshold: 3,
            retry_delays: vec![
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(10),
            ],
            validation_delay: Duration::from_secs(1),
            bootstrap_limit: 20,
            pages: vec![
                "/main.aspx".to_string(),
                "/SKT/skt00001.aspx".to_string(),
                "/SKT/skt02006.aspx".to_string(),
            ],
        }
    }
}

/// Captured-response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub capacity: usize,

    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub ttl: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            ttl: Duration::from_secs(10 * 60),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to data directory. If relative, resolved from config file location.
    /// If not specified, defaults to the config file's directory.
    pub data_dir: Option<PathBuf>,

    pub portal: PortalConfig,
    pub login: LoginConfig,
    pub confirmation: ConfirmationConfig,
    pub records: RecordsConfig,
    pub keepalive: KeepAliveConfig,
    pub capture: CaptureConfig,
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load config from a file, or return default config if file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// If `data_dir` is set and relative, it's resolved relative to `config_dir`.
    /// If `data_dir` is not set, returns `config_dir`.
    pub fn resolve_data_dir(&self, config_dir: &Path) -> PathBuf {
        match &self.data_dir {
            Some(data_dir) if data_dir.is_absolute() => data_dir.clone(),
            Some(data_dir) => config_dir.join(data_dir),
            None => config_dir.to_path_buf(),
        }
    }
}

/// Loaded configuration with resolved paths.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub data_dir: PathBuf,
    pub portal: PortalConfig,
    pub login: LoginConfig,
    pub confirmation: ConfirmationConfig,
    pub records: RecordsConfig,
    pub keepalive: KeepAliveConfig,
    pub capture: CaptureConfig,
}

/// Returns the default config file path.
///
/// Resolution order:
/// 1. `./portalkeep.toml` if it exists in current directory
/// 2. `~/.config/portalkeep/portalkeep.toml`
pub fn default_config_path() -> PathBuf {
    let local_config = PathBuf::from("portalkeep.toml");
    if local_config.exists() {
        return local_config;
    }

    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("portalkeep").join("portalkeep.toml");
    }

    local_config
}

impl ResolvedConfig {
    fn from_config(config: Config, config_dir: &Path) -> Self {
        let data_dir = config.resolve_data_dir(config_dir);
        Self {
            data_dir,
            portal: config.portal,
            login: config.login,
            confirmation: config.confirmation,
            records: config.records,
            keepalive: config.keepalive,
            capture: config.capture,
        }
    }

    /// The sections as a [`Config`] whose data dir is already resolved.
    pub fn engine_config(&self) -> Config {
        Config {
            data_dir: Some(self.data_dir.clone()),
            portal: self.portal.clone(),
            login: self.login.clone(),
            confirmation: self.confirmation.clone(),
            records: self.records.clone(),
            keepalive: self.keepalive.clone(),
            capture: self.capture.clone(),
        }
    }

    /// Load and resolve config from a file path.
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_path = config_path
            .canonicalize()
            .with_context(|| format!("Config file not found: {}", config_path.display()))?;

        let config_dir = config_path
            .parent()
            .context("Config file has no parent directory")?;

        let config = Config::load(&config_path)?;
        Ok(Self::from_config(config, config_dir))
    }

    /// Load config, falling back to defaults when the file doesn't exist.
    ///
    /// The intended parent directory of the config file becomes the data dir.
    pub fn load_or_default(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            return Self::load(config_path);
        }

        let config_path = if config_path.is_relative() {
            std::env::current_dir()
                .context("Failed to get current directory")?
                .join(config_path)
        } else {
            config_path.to_path_buf()
        };

        let config_dir = config_path
            .parent()
            .context("Config path has no parent directory")?;

        Ok(Self::from_config(Config::default(), config_dir))
    }
}
