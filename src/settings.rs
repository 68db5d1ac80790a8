use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::SettingsError;
use crate::platform::{prefabs, PlatformRegistration, SuccessCriteria};

/// Environment variable naming a directory with an overriding `Settings.toml`
pub const CONFIG_DIR_ENV: &str = "USTB_SSO_CONFIG_DIR";

/// Default settings file name
pub const SETTINGS_FILE: &str = "Settings.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SsoSettings {
    pub provider: ProviderSettings,
    pub polling: PollingSettings,
    pub sms: SmsSettings,
    pub http: HttpSettings,
    pub logging: LoggingSettings,
    pub platforms: Vec<PlatformSettings>,
}

/// Identity provider endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Base URL of the identity provider (login, catalog, SMS, ticket endpoints)
    pub base_url: String,
    /// Base URL of the QR service (page, image, status endpoints)
    pub qr_base_url: String,
    pub authenticate_path: String,
    pub query_auth_methods_path: String,
    pub micro_qr_path: String,
    pub qr_page_path: String,
    pub qr_image_path: String,
    pub qr_state_path: String,
    pub sms_check_path: String,
    pub sms_send_path: String,
    pub auth_execute_path: String,
    pub authn_engine_path: String,
    /// Locale passed to the ticket endpoint
    pub locale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    /// Default interval between QR status polls
    pub interval_ms: u64,
    /// Floor applied to both the caller's and the provider's interval
    pub min_interval_ms: u64,
    /// Default wall-clock limit for one QR challenge
    pub timeout_secs: u64,
    /// How long the provider keeps a QR challenge alive
    pub challenge_lifetime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsSettings {
    /// Minimum time between two sends to the same number
    pub resend_interval_secs: u64,
    /// Wrong codes accepted before the challenge is exhausted
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub max_redirects: usize,
    /// Script or meta-refresh redirects followed after the HTTP chain ends
    pub max_client_redirects: usize,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

/// A platform registration declared in `Settings.toml`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PlatformSettings {
    pub name: String,
    pub service_id: String,
    pub entry_url: String,
    pub extra_params: BTreeMap<String, String>,
    pub url_contains: Option<String>,
    pub required_cookies: Vec<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "https://sso.ustb.edu.cn".to_string(),
            qr_base_url: "https://sis.ustb.edu.cn".to_string(),
            authenticate_path: "/idp/authCenter/authenticate".to_string(),
            query_auth_methods_path: "/idp/authn/queryAuthMethods".to_string(),
            micro_qr_path: "/idp/authn/getMicroQr".to_string(),
            qr_page_path: "/connect/qrpage".to_string(),
            qr_image_path: "/connect/qrimg".to_string(),
            qr_state_path: "/connect/state".to_string(),
            sms_check_path: "/idp/authn/checkSmsPhone".to_string(),
            sms_send_path: "/idp/authn/sendSmsMsg".to_string(),
            auth_execute_path: "/idp/authn/authExecute".to_string(),
            authn_engine_path: "/idp/authCenter/authnEngine".to_string(),
            locale: "zh-CN".to_string(),
        }
    }
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            min_interval_ms: 500,
            timeout_secs: 180,
            challenge_lifetime_secs: 300,
        }
    }
}

impl Default for SmsSettings {
    fn default() -> Self {
        Self {
            resend_interval_secs: 60,
            max_attempts: 3,
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            // The QR status endpoint long-polls for a few seconds
            timeout_secs: 30,
            max_redirects: 10,
            max_client_redirects: 3,
            user_agent: concat!("ustb-sso/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ProviderSettings {
    /// Join a path onto the identity provider base URL
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL or the joined URL is invalid
    pub fn idp_url(&self, path: &str) -> Result<Url, url::ParseError> {
        Url::parse(&self.base_url)?.join(path)
    }

    /// Join a path onto the QR service base URL
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL or the joined URL is invalid
    pub fn qr_url(&self, path: &str) -> Result<Url, url::ParseError> {
        Url::parse(&self.qr_base_url)?.join(path)
    }

    /// Hosts of the identity provider and the QR service, used to recognise
    /// provider pages
    #[must_use]
    pub fn hosts(&self) -> Vec<String> {
        [&self.base_url, &self.qr_base_url]
            .into_iter()
            .filter_map(|base| Url::parse(base).ok())
            .filter_map(|url| url.host_str().map(str::to_string))
            .collect()
    }
}

impl PollingSettings {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub fn challenge_lifetime(&self) -> Duration {
        Duration::from_secs(self.challenge_lifetime_secs)
    }
}

impl SmsSettings {
    #[must_use]
    pub fn resend_interval(&self) -> Duration {
        Duration::from_secs(self.resend_interval_secs)
    }
}

impl PlatformSettings {
    /// Convert into an immutable registration
    ///
    /// # Errors
    ///
    /// Returns an error if `entry_url` is not a valid URL or `service_id` is empty
    pub fn to_registration(&self) -> Result<PlatformRegistration, SettingsError> {
        if self.service_id.is_empty() {
            return Err(SettingsError::Invalid(format!(
                "platform '{}' has no service_id",
                self.name
            )));
        }
        let entry_url = Url::parse(&self.entry_url).map_err(|e| {
            SettingsError::Invalid(format!(
                "platform '{}' has invalid entry_url '{}': {e}",
                self.name, self.entry_url
            ))
        })?;

        Ok(PlatformRegistration::new(
            &self.name,
            entry_url,
            &self.service_id,
            self.extra_params.clone(),
            SuccessCriteria {
                url_contains: self.url_contains.clone(),
                required_cookies: self.required_cookies.clone(),
            },
        ))
    }
}

impl SsoSettings {
    /// Load settings from configuration files and environment variables
    ///
    /// Settings are loaded with the following priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Settings.toml in `USTB_SSO_CONFIG_DIR` (if specified and exists)
    /// 3. Settings.toml in current directory (if exists)
    /// 4. Default settings
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A settings file cannot be read
    /// - TOML parsing fails
    /// - The resulting settings are invalid
    pub fn load() -> Result<Self, SettingsError> {
        let mut settings = Self::default();

        let default_path = PathBuf::from(SETTINGS_FILE);
        if default_path.exists() {
            settings = Self::load_from_path(&default_path)?;
            info!("Loaded base settings from {}", default_path.display());
        }

        if let Ok(config_dir) = std::env::var(CONFIG_DIR_ENV) {
            let override_path = Path::new(&config_dir).join(SETTINGS_FILE);
            if override_path.exists() {
                settings = Self::load_from_path(&override_path)?;
                info!("Overriding settings from {}", override_path.display());
            } else {
                info!(
                    "{CONFIG_DIR_ENV} set but no {SETTINGS_FILE} found at: {}",
                    override_path.display()
                );
            }
        }

        Self::apply_env_overrides(&mut settings);
        settings.validate()?;
        Ok(settings)
    }

    /// Parse one settings file without applying environment overrides
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid TOML
    pub fn load_from_path(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        basic_toml::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply environment variable overrides to settings
    pub fn apply_env_overrides(settings: &mut Self) {
        if let Ok(base_url) = std::env::var("SSO_BASE_URL") {
            settings.provider.base_url = base_url;
        }
        if let Ok(qr_base_url) = std::env::var("SSO_QR_BASE_URL") {
            settings.provider.qr_base_url = qr_base_url;
        }

        Self::apply_numeric_env_override("SSO_POLL_INTERVAL_MS", &mut settings.polling.interval_ms);
        Self::apply_numeric_env_override(
            "SSO_POLL_MIN_INTERVAL_MS",
            &mut settings.polling.min_interval_ms,
        );
        Self::apply_numeric_env_override("SSO_POLL_TIMEOUT_SECS", &mut settings.polling.timeout_secs);
        Self::apply_numeric_env_override(
            "SSO_SMS_RESEND_SECS",
            &mut settings.sms.resend_interval_secs,
        );
        Self::apply_numeric_env_override("SSO_HTTP_TIMEOUT_SECS", &mut settings.http.timeout_secs);

        if let Ok(value) = std::env::var("SSO_SMS_MAX_ATTEMPTS") {
            if let Ok(max_attempts) = value.parse::<u32>() {
                settings.sms.max_attempts = max_attempts;
            }
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            settings.logging.level = log_level;
        }
    }

    /// Helper function to apply numeric environment variable overrides
    fn apply_numeric_env_override(env_var: &str, target: &mut u64) {
        if let Ok(value_str) = std::env::var(env_var) {
            if let Ok(value) = value_str.parse::<u64>() {
                *target = value;
            }
        }
    }

    /// Reject settings the procedure cannot run with
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value found
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.polling.min_interval_ms == 0 {
            return Err(SettingsError::Invalid(
                "polling.min_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.polling.interval_ms == 0 {
            return Err(SettingsError::Invalid(
                "polling.interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.sms.max_attempts == 0 {
            return Err(SettingsError::Invalid(
                "sms.max_attempts must be greater than zero".to_string(),
            ));
        }
        for url in [&self.provider.base_url, &self.provider.qr_base_url] {
            Url::parse(url)
                .map_err(|e| SettingsError::Invalid(format!("invalid provider URL '{url}': {e}")))?;
        }
        for platform in &self.platforms {
            platform.to_registration()?;
        }
        Ok(())
    }

    /// Resolve a platform by name: configured platforms first, then prefabs
    ///
    /// # Errors
    ///
    /// Returns an error if the configured entry is invalid
    pub fn platform(&self, name: &str) -> Result<Option<PlatformRegistration>, SettingsError> {
        if let Some(configured) = self
            .platforms
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
        {
            return configured.to_registration().map(Some);
        }
        Ok(prefabs::by_name(name))
    }
}
