//! Wire types of the identity provider and QR service
//!
//! The provider wraps most JSON answers in `{ code, message, data }` with a
//! `code` that is sometimes a string and sometimes a number.

use serde::Deserialize;

/// Provider result code, string or number on the wire
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ProviderCode {
    Number(i64),
    Text(String),
}

impl ProviderCode {
    /// Numeric value, if the code is numeric at all
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ProviderCode::Number(n) => Some(*n),
            ProviderCode::Text(s) => s.trim().parse().ok(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.as_i64() == Some(200)
    }
}

impl std::fmt::Display for ProviderCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderCode::Number(n) => write!(f, "{n}"),
            ProviderCode::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Standard provider response envelope
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub code: ProviderCode,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    /// Provider message, or the code when no message was sent
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.message {
            Some(message) if !message.is_empty() => format!("{message} (code {})", self.code),
            _ => format!("code {}", self.code),
        }
    }
}

/// `data` of the QR bootstrap response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroQrData {
    pub app_id: String,
    pub return_url: String,
    pub random_token: String,
}

/// Raw QR status poll answer
#[derive(Debug, Clone, Deserialize)]
pub struct QrStateResponse {
    pub code: ProviderCode,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Provider-suggested seconds until the next poll
    #[serde(default)]
    pub interval: Option<u64>,
}

/// `data` of the SMS eligibility check
#[derive(Debug, Clone, Deserialize)]
pub struct SmsCheckData {
    pub available: bool,
}

/// SMS verification answer; the token sits at the top level or under `data`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthExecuteResponse {
    pub code: ProviderCode,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub login_token: Option<String>,
    #[serde(default)]
    pub data: Option<AuthExecuteData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthExecuteData {
    #[serde(default)]
    pub login_token: Option<String>,
}

impl AuthExecuteResponse {
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.login_token
            .as_deref()
            .or_else(|| self.data.as_ref().and_then(|d| d.login_token.as_deref()))
            .filter(|t| !t.is_empty())
    }
}

/// Provider code for "too many SMS requests"
pub const CODE_RATE_LIMITED: i64 = 429;

/// Provider code for "verification attempts exhausted"
pub const CODE_ATTEMPTS_EXHAUSTED: i64 = 403;
