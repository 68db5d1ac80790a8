//! Testing utilities for ustb-sso
//!
//! - [`fixtures`] - Settings, platform registration, and a scripted provider
//!   that answers the happy path of both login methods
//! - [`mock`] - [`mock::ScriptedHttpSession`], an in-memory `HttpSession`
//!
//! ## Usage
//!
//! ```ignore
//! use ustb_sso::http::HttpMethod;
//! use ustb_sso::testing::{constants::paths, fixtures::TestFixtures};
//!
//! let provider = TestFixtures::provider();
//! provider.replace(HttpMethod::Get, paths::QR_STATE, vec![TestFixtures::qr_pending()]);
//! let procedure = TestFixtures::procedure(provider);
//! ```

pub mod fixtures;
pub mod mock;

pub use fixtures::TestFixtures;
pub use mock::{ScriptedHttpSession, StubReply, StubResponse};

/// Common test constants
pub mod constants {
    /// Identity provider base URL used by the fixtures
    pub const IDP_BASE: &str = "https://sso.test";

    /// QR service base URL used by the fixtures
    pub const QR_BASE: &str = "https://sis.test";

    /// Endpoint paths as configured by default
    pub mod paths {
        pub const AUTHENTICATE: &str = "/idp/authCenter/authenticate";
        pub const QUERY_AUTH_METHODS: &str = "/idp/authn/queryAuthMethods";
        pub const MICRO_QR: &str = "/idp/authn/getMicroQr";
        pub const QR_PAGE: &str = "/connect/qrpage";
        pub const QR_IMAGE: &str = "/connect/qrimg";
        pub const QR_STATE: &str = "/connect/state";
        pub const QR_RETURN: &str = "/idp/authCenter/qrReturn";
        pub const SMS_CHECK: &str = "/idp/authn/checkSmsPhone";
        pub const SMS_SEND: &str = "/idp/authn/sendSmsMsg";
        pub const AUTH_EXECUTE: &str = "/idp/authn/authExecute";
        pub const AUTHN_ENGINE: &str = "/idp/authCenter/authnEngine";
        pub const PLATFORM_CALLBACK: &str = "/cas/callback";
    }
}
