//! Authentication method catalog
//!
//! The provider lists the challenge methods it enables for a platform
//! registration. The catalog keeps the provider's order for display and a
//! module-code index for constant-time lookups. It is built once per `open`
//! and never changes afterwards.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use log::debug;
use serde::Deserialize;

use crate::errors::{AuthError, TransportError};
use crate::http::{HttpRequest, HttpSession};
use crate::platform::PlatformRegistration;
use crate::procedure::LoginContext;
use crate::protocol::Envelope;
use crate::settings::ProviderSettings;
use crate::utils::logging::LoggingHelper;

/// Challenge methods the procedure can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    Qr,
    Sms,
}

impl MethodKind {
    /// Provider module code implementing this method
    #[must_use]
    pub const fn module_code(self) -> &'static str {
        match self {
            MethodKind::Qr => "microQr",
            MethodKind::Sms => "userAndSms",
        }
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodKind::Qr => write!(f, "QR"),
            MethodKind::Sms => write!(f, "SMS"),
        }
    }
}

impl FromStr for MethodKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "qr" => Ok(MethodKind::Qr),
            "sms" => Ok(MethodKind::Sms),
            other => Err(format!("unknown authentication method '{other}'")),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// One method entry as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMethodDescriptor {
    pub module_code: String,
    #[serde(default)]
    pub chain_name: String,
    /// Chain identifier required when executing the method
    #[serde(default, rename = "authChainCode")]
    pub chain_code: Option<String>,
    #[serde(default)]
    pub module_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Methods offered for one platform, in provider order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthMethodCatalog {
    descriptors: Vec<AuthMethodDescriptor>,
    index: HashMap<String, usize>,
}

impl AuthMethodCatalog {
    /// Build a catalog; later duplicates of a module code are dropped
    #[must_use]
    pub fn from_descriptors(descriptors: Vec<AuthMethodDescriptor>) -> Self {
        let mut catalog = Self::default();
        for descriptor in descriptors {
            if catalog.index.contains_key(&descriptor.module_code) {
                LoggingHelper::log_duplicate_module(&descriptor.module_code);
                continue;
            }
            catalog
                .index
                .insert(descriptor.module_code.clone(), catalog.descriptors.len());
            catalog.descriptors.push(descriptor);
        }
        catalog
    }

    /// Exact-match lookup; a missing method is a normal outcome
    #[must_use]
    pub fn lookup(&self, module_code: &str) -> Option<&AuthMethodDescriptor> {
        self.index.get(module_code).map(|&i| &self.descriptors[i])
    }

    /// The enabled descriptor implementing `kind`, if any
    #[must_use]
    pub fn find_enabled(&self, kind: MethodKind) -> Option<&AuthMethodDescriptor> {
        self.lookup(kind.module_code()).filter(|d| d.enabled)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AuthMethodDescriptor> {
        self.descriptors.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Ask the provider which methods it enables for `platform`
///
/// # Errors
///
/// Returns `CatalogUnavailable` if the provider answers with a malformed body
/// or a failure code (unknown platform), and `Transport` on network failure
pub async fn discover<S: HttpSession + ?Sized>(
    session: &S,
    provider: &ProviderSettings,
    platform: &PlatformRegistration,
    context: &LoginContext,
) -> Result<AuthMethodCatalog, AuthError> {
    let url = provider
        .idp_url(&provider.query_auth_methods_path)
        .map_err(TransportError::from)?;
    let body = serde_json::json!({
        "entityId": platform.service_id,
        "lck": context.lck,
    });

    let response = session.execute(HttpRequest::post_json(url, body)).await?;
    if !response.is_success() {
        return Err(AuthError::CatalogUnavailable(format!(
            "method listing returned HTTP {}",
            response.status
        )));
    }

    let envelope: Envelope<Vec<AuthMethodDescriptor>> = response.json().map_err(|e| {
        debug!("Malformed method listing: {}", response.text());
        AuthError::CatalogUnavailable(format!("malformed method listing: {e}"))
    })?;
    if !envelope.code.is_success() {
        return Err(AuthError::CatalogUnavailable(format!(
            "provider refused platform {}: {}",
            platform.service_id,
            envelope.describe()
        )));
    }
    let descriptors = envelope.data.ok_or_else(|| {
        AuthError::CatalogUnavailable("method listing carried no data".to_string())
    })?;

    let catalog = AuthMethodCatalog::from_descriptors(descriptors);
    LoggingHelper::log_catalog_summary(&platform.name, &catalog);
    Ok(catalog)
}
