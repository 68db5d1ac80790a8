//! Authenticated session facade
//!
//! [`AuthSession`] owns one [`AuthProcedure`] and the HTTP session it logs
//! in with. Once the procedure completes, the same HTTP session carries the
//! platform cookies and can be handed to whatever talks to the platform next.

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::catalog::MethodKind;
use crate::errors::{AuthError, Result};
use crate::http::HttpSession;
use crate::platform::PlatformRegistration;
use crate::procedure::qr::QrChallenge;
use crate::procedure::{AuthProcedure, ProcedureState};
use crate::settings::SsoSettings;

/// Outcome of a completed login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    /// Page the redirect chain ended on
    pub final_url: Url,
    pub status: u16,
    /// Cookies the platform set for the session
    pub cookies: HashMap<String, String>,
}

impl AuthResult {
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Whether the result meets the platform's success criteria
    #[must_use]
    pub fn satisfies(&self, platform: &PlatformRegistration) -> bool {
        platform.success.is_satisfied(self)
    }
}

pub struct AuthSession<S: HttpSession> {
    procedure: AuthProcedure<S>,
}

impl<S: HttpSession> AuthSession<S> {
    #[must_use]
    pub fn new(http: S, platform: PlatformRegistration, settings: SsoSettings) -> Self {
        Self {
            procedure: AuthProcedure::new(http, platform, settings),
        }
    }

    #[must_use]
    pub fn with_cancellation(self, cancel: CancellationToken) -> Self {
        Self {
            procedure: self.procedure.with_cancellation(cancel),
        }
    }

    #[must_use]
    pub fn procedure(&self) -> &AuthProcedure<S> {
        &self.procedure
    }

    /// Drive the procedure step by step, e.g. for SMS input
    pub fn procedure_mut(&mut self) -> &mut AuthProcedure<S> {
        &mut self.procedure
    }

    #[must_use]
    pub fn state(&self) -> ProcedureState {
        self.procedure.state()
    }

    /// Run the whole QR flow
    ///
    /// Opens the procedure unless that already happened, so a caller can
    /// inspect the catalog first. `on_challenge` receives the QR code to
    /// display before polling starts.
    ///
    /// # Errors
    ///
    /// Any error of the individual procedure operations
    pub async fn login_with_qr<F>(
        &mut self,
        on_challenge: F,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<AuthResult>
    where
        F: FnOnce(&QrChallenge),
    {
        if self.procedure.state() == ProcedureState::Unopened {
            self.procedure.open().await?;
        }
        self.procedure.select_method(MethodKind::Qr)?;
        let challenge = self.procedure.request_challenge().await?;
        on_challenge(&challenge);
        let pass_code = self
            .procedure
            .poll_until_resolved(&challenge, poll_interval, timeout)
            .await?;
        self.procedure.complete(pass_code).await
    }

    /// Cookies the platform set during the login
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` until the procedure has completed
    pub fn cookies(&self) -> Result<HashMap<String, String>> {
        self.procedure
            .result()
            .map(|result| result.cookies.clone())
            .ok_or(AuthError::InvalidState {
                operation: "cookies",
                state: self.procedure.state(),
            })
    }

    /// Hand over the authenticated HTTP session
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the procedure completed; the session is
    /// dropped in that case
    pub fn into_http(self) -> Result<S> {
        let state = self.procedure.state();
        if state == ProcedureState::Completed {
            Ok(self.procedure.into_http())
        } else {
            Err(AuthError::InvalidState {
                operation: "into_http",
                state,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpMethod;
    use crate::testing::constants::paths;
    use crate::testing::fixtures::TestFixtures;
    use crate::testing::mock::StubResponse;

    #[tokio::test]
    async fn test_login_with_qr_happy_path() {
        let mut session = AuthSession::new(
            TestFixtures::provider(),
            TestFixtures::platform(),
            TestFixtures::settings(),
        );
        assert!(matches!(
            session.cookies(),
            Err(AuthError::InvalidState { operation: "cookies", .. })
        ));

        let mut shown = Vec::new();
        let result = session
            .login_with_qr(
                |challenge| shown = challenge.image_bytes.clone(),
                Duration::from_secs(1),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(shown, TestFixtures::QR_IMAGE.to_vec());
        assert!(result.satisfies(&TestFixtures::platform()));
        assert_eq!(
            result.cookie(TestFixtures::SESSION_COOKIE),
            Some(TestFixtures::SESSION_VALUE)
        );
        assert_eq!(
            session.cookies().unwrap().get(TestFixtures::SESSION_COOKIE),
            Some(&TestFixtures::SESSION_VALUE.to_string())
        );
        assert!(session.into_http().is_ok());
    }

    #[tokio::test]
    async fn test_login_with_qr_after_manual_open() {
        let mut session = AuthSession::new(
            TestFixtures::provider(),
            TestFixtures::platform(),
            TestFixtures::settings(),
        );
        session.procedure_mut().open().await.unwrap();
        let result = session
            .login_with_qr(|_| {}, Duration::from_secs(1), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(result.final_url.as_str(), TestFixtures::PLATFORM_HOME);
        assert_eq!(session.state(), ProcedureState::Completed);
    }

    #[tokio::test]
    async fn test_cookies_refused_after_failed_login() {
        let provider = TestFixtures::provider();
        provider.replace(
            HttpMethod::Get,
            paths::QR_RETURN,
            vec![StubResponse::json(&serde_json::json!({
                "code": "401",
                "message": "ticket expired"
            }))
            .with_status(401)],
        );
        let mut session =
            AuthSession::new(provider, TestFixtures::platform(), TestFixtures::settings());

        let err = session
            .login_with_qr(|_| {}, Duration::from_secs(1), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TicketRejected(_)));
        assert_eq!(session.state(), ProcedureState::Failed);
        assert!(matches!(
            session.cookies(),
            Err(AuthError::InvalidState { operation: "cookies", state: ProcedureState::Failed })
        ));
        assert!(session.into_http().is_err());
    }

    #[tokio::test]
    async fn test_into_http_requires_completion() {
        let session = AuthSession::new(
            TestFixtures::provider(),
            TestFixtures::platform(),
            TestFixtures::settings(),
        );
        assert!(matches!(
            session.into_http(),
            Err(AuthError::InvalidState { operation: "into_http", state: ProcedureState::Unopened })
        ));
    }
}
