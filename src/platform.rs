//! Platform registrations
//!
//! A [`PlatformRegistration`] describes one application that relies on the
//! identity provider: where the provider must send the user back to, the
//! service identifier it was registered under, and any extra parameters the
//! platform expects on the initial login request. Registrations are plain
//! immutable values; the known USTB platforms live in [`prefabs`].

use std::collections::BTreeMap;

use url::Url;

use crate::session::AuthResult;

/// Immutable description of one SSO-protected application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformRegistration {
    pub name: String,
    /// Platform callback the provider redirects to after login
    pub entry_url: Url,
    /// Identifier the platform is registered under at the provider
    pub service_id: String,
    /// Echoed verbatim into the initial login request
    pub extra_params: BTreeMap<String, String>,
    pub success: SuccessCriteria,
}

/// How a platform recognises a successful login
///
/// This is platform-side validation carried as data; the procedure itself only
/// checks that the redirect chain ends on the platform host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuccessCriteria {
    /// Substring the final URL must contain
    pub url_contains: Option<String>,
    /// Cookies that must be present after login
    pub required_cookies: Vec<String>,
}

impl PlatformRegistration {
    #[must_use]
    pub fn new(
        name: &str,
        entry_url: Url,
        service_id: &str,
        extra_params: BTreeMap<String, String>,
        success: SuccessCriteria,
    ) -> Self {
        Self {
            name: name.to_string(),
            entry_url,
            service_id: service_id.to_string(),
            extra_params,
            success,
        }
    }

    /// Host the redirect chain must end on
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.entry_url.host_str()
    }

    /// Query parameters of the login entry request
    #[must_use]
    pub fn login_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("client_id".to_string(), self.service_id.clone()),
            ("redirect_uri".to_string(), self.entry_url.to_string()),
            ("login_return".to_string(), "true".to_string()),
            ("response_type".to_string(), "code".to_string()),
        ];
        params.extend(
            self.extra_params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        params
    }
}

impl SuccessCriteria {
    /// Check an authentication result against this platform's expectations
    #[must_use]
    pub fn is_satisfied(&self, result: &AuthResult) -> bool {
        let url_ok = self
            .url_contains
            .as_deref()
            .map_or(true, |needle| result.final_url.as_str().contains(needle));
        let cookies_ok = self
            .required_cookies
            .iter()
            .all(|name| result.cookies.contains_key(name));
        url_ok && cookies_ok
    }
}

/// Built-in registrations for known USTB platforms
pub mod prefabs {
    use std::collections::BTreeMap;

    use url::Url;

    use super::{PlatformRegistration, SuccessCriteria};

    const JWGL_ENTRY: &str = "https://jwgl.ustb.edu.cn/glht/Logon.do?method=weCharLogin";
    const CHAT_ENTRY: &str = "http://chat.ustb.edu.cn/common/actionCasLogin?redirect_url=http%3A%2F%2Fchat.ustb.edu.cn%2Fpage%2Fsite%2FnewPc%3Flogin_return%3Dtrue";
    const BYYT_ENTRY: &str = "https://byyt.ustb.edu.cn/oauth/login/code";

    fn entry(url: &str) -> Url {
        Url::parse(url).expect("prefab entry URLs are valid")
    }

    fn state(value: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("state".to_string(), value.to_string())])
    }

    /// Academic affairs system (jwgl.ustb.edu.cn)
    #[must_use]
    pub fn jwgl() -> PlatformRegistration {
        PlatformRegistration::new(
            "JWGL",
            entry(JWGL_ENTRY),
            "NS2022062",
            state("test"),
            SuccessCriteria {
                url_contains: Some("//jwgl.ustb.edu.cn/framework".to_string()),
                required_cookies: Vec::new(),
            },
        )
    }

    /// Campus chat assistant (chat.ustb.edu.cn)
    #[must_use]
    pub fn chat() -> PlatformRegistration {
        PlatformRegistration::new(
            "CHAT",
            entry(CHAT_ENTRY),
            "YW2025007",
            state("ustb"),
            SuccessCriteria {
                url_contains: None,
                required_cookies: vec!["cookie_vjuid_login".to_string()],
            },
        )
    }

    /// Undergraduate services portal (byyt.ustb.edu.cn)
    #[must_use]
    pub fn byyt() -> PlatformRegistration {
        PlatformRegistration::new(
            "BYYT",
            entry(BYYT_ENTRY),
            "YW2025006",
            BTreeMap::new(),
            SuccessCriteria {
                url_contains: Some("//byyt.ustb.edu.cn/".to_string()),
                required_cookies: vec!["INCO".to_string(), "SESSION".to_string()],
            },
        )
    }

    /// All prefabs, sorted by name
    #[must_use]
    pub fn all() -> Vec<PlatformRegistration> {
        vec![byyt(), chat(), jwgl()]
    }

    /// Find a prefab by name, ignoring case
    #[must_use]
    pub fn by_name(name: &str) -> Option<PlatformRegistration> {
        all()
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn result(url: &str, cookies: &[&str]) -> AuthResult {
        AuthResult {
            final_url: Url::parse(url).unwrap(),
            status: 200,
            cookies: cookies
                .iter()
                .map(|name| ((*name).to_string(), "v".to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn test_prefabs_parse_and_are_unique() {
        let all = prefabs::all();
        assert_eq!(all.len(), 3);
        for platform in &all {
            assert!(platform.host().is_some(), "{} has no host", platform.name);
            assert!(!platform.service_id.is_empty());
        }
        assert_eq!(prefabs::by_name("chat").unwrap().service_id, "YW2025007");
        assert!(prefabs::by_name("unknown").is_none());
    }

    #[test]
    fn test_login_params_echo_extra_params() {
        let params = prefabs::jwgl().login_params();
        assert!(params.contains(&("client_id".to_string(), "NS2022062".to_string())));
        assert!(params.contains(&("state".to_string(), "test".to_string())));
        assert!(params
            .iter()
            .any(|(k, v)| k == "redirect_uri" && v.starts_with("https://jwgl.ustb.edu.cn/")));
    }

    #[test]
    fn test_jwgl_success_requires_framework_url() {
        let jwgl = prefabs::jwgl();
        assert!(jwgl
            .success
            .is_satisfied(&result("https://jwgl.ustb.edu.cn/framework/main.jsp", &[])));
        assert!(!jwgl
            .success
            .is_satisfied(&result("https://jwgl.ustb.edu.cn/glht/Logon.do", &[])));
    }

    #[test]
    fn test_byyt_success_requires_url_and_cookies() {
        let byyt = prefabs::byyt();
        let url = "https://byyt.ustb.edu.cn/index";
        assert!(byyt.success.is_satisfied(&result(url, &["INCO", "SESSION"])));
        assert!(!byyt.success.is_satisfied(&result(url, &["SESSION"])));
    }

    #[test]
    fn test_chat_success_requires_cookie_only() {
        let chat = prefabs::chat();
        assert!(chat
            .success
            .is_satisfied(&result("http://chat.ustb.edu.cn/page", &["cookie_vjuid_login"])));
        assert!(!chat.success.is_satisfied(&result("http://chat.ustb.edu.cn/page", &[])));
    }
}
