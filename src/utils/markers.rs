//! Extraction of provider markers from URLs and HTML pages
//!
//! The provider hands out its session marker (`lck`), the QR challenge id
//! (`sid`) and some final redirects inside pages rather than JSON. These
//! helpers pull them out with a few narrow patterns.

use base64::{engine::general_purpose, Engine as _};
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

// `lck` travels in the query or in the SPA fragment of the login page URL
static LCK_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[?&#/]lck=([^&#\s'"]+)"#).unwrap());

static SID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bsid\s*[:=]\s*["']([A-Za-z0-9_\-]+)["']"#).unwrap());

static SCRIPT_REDIRECT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\blocation(?:\.href)?\s*=\s*["']([^"']+)["']|\blocation\.(?:replace|assign)\(\s*["']([^"']+)["']\s*\)"#)
        .unwrap()
});

static META_REFRESH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<meta[^>]+http-equiv\s*=\s*["']?refresh["']?[^>]*content\s*=\s*["'][^"']*?url\s*=\s*([^"'>\s]+)"#)
        .unwrap()
});

static FORM_ACTION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<form[^>]*\baction\s*=\s*["']([^"']+)["']"#).unwrap());

static INPUT_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<input\b").unwrap());

/// Find the provider login-context marker in a URL or page body
#[must_use]
pub fn extract_lck(text: &str) -> Option<String> {
    let raw = LCK_PATTERN.captures(text)?.get(1)?.as_str();
    let decoded = urlencoding::decode(raw).map_or_else(|_| raw.to_string(), |v| v.into_owned());
    (!decoded.is_empty()).then_some(decoded)
}

/// Find the QR challenge id in the QR page
#[must_use]
pub fn extract_sid(html: &str) -> Option<String> {
    SID_PATTERN
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Find a client-side redirect (script assignment, meta refresh, or a bare
/// auto-submitting form) and resolve it against the page URL
#[must_use]
pub fn extract_client_redirect(html: &str, page_url: &Url) -> Option<Url> {
    let target = SCRIPT_REDIRECT_PATTERN
        .captures(html)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
        .or_else(|| META_REFRESH_PATTERN.captures(html).and_then(|caps| caps.get(1)))
        .or_else(|| {
            // A form carrying fields needs a POST we cannot reproduce faithfully
            if INPUT_PATTERN.is_match(html) {
                None
            } else {
                FORM_ACTION_PATTERN.captures(html).and_then(|caps| caps.get(1))
            }
        })?
        .as_str()
        .replace("&amp;", "&");

    match page_url.join(&target) {
        Ok(url) => Some(url),
        Err(e) => {
            debug!("Ignoring unparsable client redirect '{target}': {e}");
            None
        }
    }
}

/// Return raw image bytes, decoding a `data:image/...;base64,` body if needed
///
/// # Errors
///
/// Returns an error if the body is a data URL with invalid base64 content
pub fn decode_image(body: Vec<u8>) -> Result<Vec<u8>, base64::DecodeError> {
    if !body.starts_with(b"data:image") {
        return Ok(body);
    }
    let payload = body
        .iter()
        .position(|b| *b == b',')
        .map_or(&body[..0], |comma| &body[comma + 1..]);
    let trimmed: Vec<u8> = payload
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace() && *b != b'"')
        .collect();
    general_purpose::STANDARD.decode(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_lck_from_fragment_and_query() {
        assert_eq!(
            extract_lck("https://sso.ustb.edu.cn/ac/#/index?lck=abc123&entityId=NS2022062")
                .as_deref(),
            Some("abc123")
        );
        assert_eq!(
            extract_lck("https://sso.ustb.edu.cn/login?lck=a%2Bb").as_deref(),
            Some("a+b")
        );
        assert_eq!(extract_lck("https://sso.ustb.edu.cn/login?block=1"), None);
    }

    #[test]
    fn test_extract_sid() {
        let html = r#"<script>var sid = "f3a9-77_b"; var appid = 'x';</script>"#;
        assert_eq!(extract_sid(html).as_deref(), Some("f3a9-77_b"));
        assert_eq!(extract_sid("<html>no challenge</html>"), None);
    }

    #[test]
    fn test_extract_script_redirect() {
        let page = Url::parse("https://sso.ustb.edu.cn/idp/authCenter/authnEngine").unwrap();
        let html = r#"<script>window.location.href = 'https://byyt.ustb.edu.cn/oauth/login/code?code=1&amp;state=2';</script>"#;
        assert_eq!(
            extract_client_redirect(html, &page).unwrap().as_str(),
            "https://byyt.ustb.edu.cn/oauth/login/code?code=1&state=2"
        );
    }

    #[test]
    fn test_extract_meta_refresh_relative() {
        let page = Url::parse("https://jwgl.ustb.edu.cn/glht/Logon.do").unwrap();
        let html = r#"<meta http-equiv="refresh" content="0;url=/framework/main.jsp">"#;
        assert_eq!(
            extract_client_redirect(html, &page).unwrap().as_str(),
            "https://jwgl.ustb.edu.cn/framework/main.jsp"
        );
    }

    #[test]
    fn test_form_with_fields_is_not_followed() {
        let page = Url::parse("https://sso.ustb.edu.cn/").unwrap();
        let bare = r#"<form id="f" action="https://chat.ustb.edu.cn/cb"></form>"#;
        assert!(extract_client_redirect(bare, &page).is_some());

        let with_fields =
            r#"<form action="https://chat.ustb.edu.cn/cb"><input name="ticket" value="t"></form>"#;
        assert!(extract_client_redirect(with_fields, &page).is_none());
    }

    #[test]
    fn test_decode_image() {
        let raw = vec![0x89, b'P', b'N', b'G'];
        assert_eq!(decode_image(raw.clone()).unwrap(), raw);

        let data_url = format!(
            "data:image/png;base64,{}",
            general_purpose::STANDARD.encode(&raw)
        );
        assert_eq!(decode_image(data_url.into_bytes()).unwrap(), raw);

        assert!(decode_image(b"data:image/png;base64,@@@".to_vec()).is_err());
    }
}
