//! Pre-built settings, platforms, and a scripted provider
//!
//! [`TestFixtures::provider`] answers every endpoint of the happy path for
//! both QR and SMS logins. Tests override single routes to exercise failures.

use std::collections::BTreeMap;

use serde_json::json;
use url::Url;

use super::constants::{paths, IDP_BASE, QR_BASE};
use super::mock::{ScriptedHttpSession, StubResponse};
use crate::http::HttpMethod;
use crate::platform::{PlatformRegistration, SuccessCriteria};
use crate::procedure::AuthProcedure;
use crate::settings::SsoSettings;

/// Central fixture provider for all test data
pub struct TestFixtures;

impl TestFixtures {
    pub const SERVICE_ID: &'static str = "TEST001";
    pub const PLATFORM_ENTRY: &'static str = "https://platform.test/cas/callback";
    pub const PLATFORM_HOME: &'static str = "https://platform.test/home";
    pub const LCK: &'static str = "lck-123";
    pub const SID: &'static str = "sid-789";
    pub const APP_ID: &'static str = "app-1";
    pub const RANDOM_TOKEN: &'static str = "rand-1";
    pub const QR_RETURN: &'static str = "https://sso.test/idp/authCenter/qrReturn";
    pub const PASS_CODE: &'static str = "pass-456";
    pub const LOGIN_TOKEN: &'static str = "login-token-1";
    pub const PHONE: &'static str = "13800001111";
    pub const SESSION_COOKIE: &'static str = "PLATFORM_SESSION";
    pub const SESSION_VALUE: &'static str = "sess-42";
    pub const QR_IMAGE: &'static [u8] = b"\x89PNG\r\n\x1a\nqr";

    /// Settings pointing at the test hosts
    #[must_use]
    pub fn settings() -> SsoSettings {
        let mut settings = SsoSettings::default();
        settings.provider.base_url = IDP_BASE.to_string();
        settings.provider.qr_base_url = QR_BASE.to_string();
        settings.polling.interval_ms = 1000;
        settings.polling.min_interval_ms = 500;
        settings.polling.timeout_secs = 60;
        settings.polling.challenge_lifetime_secs = 300;
        settings.sms.resend_interval_secs = 60;
        settings.sms.max_attempts = 3;
        settings
    }

    /// # Panics
    ///
    /// Never; the entry URL is a valid constant.
    #[must_use]
    pub fn platform() -> PlatformRegistration {
        PlatformRegistration::new(
            "TEST",
            Url::parse(Self::PLATFORM_ENTRY).unwrap(),
            Self::SERVICE_ID,
            BTreeMap::from([("state".to_string(), "test-state".to_string())]),
            SuccessCriteria {
                url_contains: Some("/home".to_string()),
                required_cookies: vec![Self::SESSION_COOKIE.to_string()],
            },
        )
    }

    #[must_use]
    pub fn procedure(provider: ScriptedHttpSession) -> AuthProcedure<ScriptedHttpSession> {
        AuthProcedure::new(provider, Self::platform(), Self::settings())
    }

    /// Method listing with `(module_code, chain_name, enabled)` entries
    #[must_use]
    pub fn catalog(entries: &[(&str, &str, bool)]) -> StubResponse {
        let data: Vec<_> = entries
            .iter()
            .map(|(module_code, chain_name, enabled)| {
                json!({
                    "moduleCode": module_code,
                    "chainName": chain_name,
                    "authChainCode": format!("{module_code}-chain"),
                    "moduleName": module_code,
                    "enabled": enabled,
                })
            })
            .collect();
        StubResponse::json(&json!({ "code": "200", "message": "ok", "data": data }))
    }

    /// QR status answer with the provider's numeric code
    #[must_use]
    pub fn qr_state(code: i64) -> StubResponse {
        StubResponse::json(&json!({ "code": code, "data": null }))
    }

    #[must_use]
    pub fn qr_pending() -> StubResponse {
        Self::qr_state(0)
    }

    #[must_use]
    pub fn qr_scanned() -> StubResponse {
        Self::qr_state(2)
    }

    #[must_use]
    pub fn qr_confirmed() -> StubResponse {
        StubResponse::json(&json!({ "code": 1, "data": Self::PASS_CODE }))
    }

    #[must_use]
    pub fn sms_rejected() -> StubResponse {
        StubResponse::json(&json!({ "code": "400", "message": "验证码错误" }))
    }

    /// Scripted provider answering the happy path of both methods
    #[must_use]
    pub fn provider() -> ScriptedHttpSession {
        let session = ScriptedHttpSession::new();
        let platform_home = StubResponse::html("<html>home</html>")
            .redirected_to(Self::PLATFORM_HOME)
            .with_cookie(Self::SESSION_COOKIE, Self::SESSION_VALUE);

        session
            .on(
                HttpMethod::Get,
                paths::AUTHENTICATE,
                StubResponse::html("<html><div id=\"app\"></div></html>").redirected_to(&format!(
                    "{IDP_BASE}/ac/index?lck={}&entityId={}",
                    Self::LCK,
                    Self::SERVICE_ID
                )),
            )
            .on(
                HttpMethod::Post,
                paths::QUERY_AUTH_METHODS,
                Self::catalog(&[("microQr", "微信扫码", true), ("userAndSms", "短信验证", true)]),
            )
            .on(
                HttpMethod::Post,
                paths::MICRO_QR,
                StubResponse::json(&json!({
                    "code": 200,
                    "data": {
                        "appId": Self::APP_ID,
                        "returnUrl": Self::QR_RETURN,
                        "randomToken": Self::RANDOM_TOKEN,
                    }
                })),
            )
            .on(
                HttpMethod::Get,
                paths::QR_PAGE,
                StubResponse::html(&format!(
                    "<html><script>var sid = \"{}\";</script></html>",
                    Self::SID
                )),
            )
            .on(HttpMethod::Get, paths::QR_IMAGE, StubResponse::bytes(Self::QR_IMAGE))
            .on(HttpMethod::Get, paths::QR_STATE, Self::qr_confirmed())
            .on(HttpMethod::Get, paths::QR_RETURN, platform_home.clone())
            .on(
                HttpMethod::Post,
                paths::SMS_CHECK,
                StubResponse::json(&json!({ "code": "200", "data": { "available": true } })),
            )
            .on(
                HttpMethod::Post,
                paths::SMS_SEND,
                StubResponse::json(&json!({ "code": "200", "message": "sent" })),
            )
            .on(
                HttpMethod::Post,
                paths::AUTH_EXECUTE,
                StubResponse::json(&json!({ "code": "200", "loginToken": Self::LOGIN_TOKEN })),
            )
            .on(
                HttpMethod::Post,
                paths::AUTHN_ENGINE,
                StubResponse::html(&format!(
                    "<html><script>window.location.href = '{}?ticket=ST-1';</script></html>",
                    Self::PLATFORM_ENTRY
                )),
            )
            .on(HttpMethod::Get, paths::PLATFORM_CALLBACK, platform_home);
        session
    }
}
