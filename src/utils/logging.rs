// Centralized logging utilities to keep procedure code free of verbose log blocks
use log::{debug, info, warn};
use url::Url;

use crate::catalog::{AuthMethodCatalog, AuthMethodDescriptor};
use crate::procedure::qr::QrStatus;
use crate::settings::LoggingSettings;

/// Initialize `env_logger` with the configured level as default filter
///
/// # Errors
///
/// Returns an error if a logger was already installed
pub fn init_logging(settings: &LoggingSettings) -> Result<(), log::SetLoggerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&settings.level))
        .try_init()
}

/// Keep the first characters of a secret and hide the rest
#[must_use]
pub fn mask(secret: &str) -> String {
    let visible: String = secret.chars().take(3).collect();
    if secret.chars().count() <= 3 {
        "***".to_string()
    } else {
        format!("{visible}***")
    }
}

pub struct LoggingHelper;

impl LoggingHelper {
    /// Log the provider login context established by `open`
    pub fn log_login_context(platform: &str, lck: &str, entry_page: &Url) {
        info!(
            "🔐 {} login context established (lck={}, page={})",
            platform,
            mask(lck),
            entry_page.path()
        );
    }

    /// Log summary of the discovered auth methods
    pub fn log_catalog_summary(platform: &str, catalog: &AuthMethodCatalog) {
        info!(
            "🎯 {} offers {} authentication method(s)",
            platform,
            catalog.len()
        );
        for descriptor in catalog.iter() {
            debug!(
                "  - {} ({}) [{}]{}",
                descriptor.chain_name,
                descriptor.module_code,
                descriptor.module_name,
                if descriptor.enabled { "" } else { " disabled" }
            );
        }
    }

    /// Log a duplicate module code dropped from the catalog
    pub fn log_duplicate_module(module_code: &str) {
        warn!("Provider listed module {module_code} more than once, keeping the first entry");
    }

    /// Log the selected method
    pub fn log_method_selected(platform: &str, descriptor: &AuthMethodDescriptor) {
        info!(
            "✅ {} using {} ({})",
            platform, descriptor.chain_name, descriptor.module_code
        );
    }

    /// Log a freshly issued QR challenge
    pub fn log_qr_challenge_issued(challenge_id: &str, image_len: usize, lifetime_secs: i64) {
        info!(
            "📷 QR challenge {} issued ({} byte image, valid for {}s)",
            mask(challenge_id),
            image_len,
            lifetime_secs
        );
    }

    /// Log a QR status transition observed while polling
    pub fn log_qr_transition(poll_count: u32, from: QrStatus, to: QrStatus) {
        info!("🔄 QR challenge {from} -> {to} after {poll_count} poll(s)");
    }

    /// Log an out-of-order QR status that was ignored
    pub fn log_qr_status_ignored(current: QrStatus, reported: QrStatus) {
        debug!("Ignoring QR status {reported} reported while challenge is {current}");
    }

    /// Log SMS dispatch
    pub fn log_sms_sent(phone_number: &str) {
        info!("📨 SMS code sent to {}", mask(phone_number));
    }

    /// Log a rejected SMS code
    pub fn log_sms_code_rejected(attempts: u32, max_attempts: u32) {
        warn!("SMS code rejected (attempt {attempts} of {max_attempts})");
    }

    /// Log the start of the ticket exchange
    pub fn log_ticket_exchange_start(platform: &str, endpoint: &Url) {
        info!("🔄 Exchanging verification token for {} ticket at {}", platform, endpoint);
    }

    /// Log a followed client-side redirect
    pub fn log_client_redirect(hop: usize, target: &Url) {
        debug!("Following client-side redirect #{hop} to {target}");
    }

    /// Log successful completion
    pub fn log_completion(platform: &str, final_url: &Url, cookie_names: &[&String]) {
        info!(
            "🎉 {} authentication complete at {} (cookies: {:?})",
            platform, final_url, cookie_names
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_hides_secret_tail() {
        assert_eq!(mask("13800001111"), "138***");
        assert_eq!(mask("abc"), "***");
        assert_eq!(mask(""), "***");
    }
}
