//! Authentication procedure state machine
//!
//! ```text
//! Unopened -> Opened -> MethodSelected -> Challenged -> Verified -> Completed
//!                                \____________________________/
//!                                  any terminal error -> Failed
//! ```
//!
//! The base transitions (`open`, `select_method`, `complete`) live here. The
//! QR and SMS sub-flows are implemented in [`qr`] and [`sms`] as further
//! `impl` blocks on the same [`AuthProcedure`], so both converge on the same
//! `complete` transition.

pub mod qr;
pub mod sms;
mod ticket;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use log::{error, info};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::catalog::{self, AuthMethodCatalog, MethodKind};
use crate::errors::{AuthError, Result, TransportError};
use crate::http::{HttpRequest, HttpResponse, HttpSession};
use crate::platform::PlatformRegistration;
use crate::session::AuthResult;
use crate::settings::SsoSettings;
use crate::utils::logging::{mask, LoggingHelper};
use crate::utils::markers::extract_lck;

use self::qr::{QrGrant, QrSession};
use self::sms::SmsSession;

/// Procedure lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcedureState {
    Unopened,
    Opened,
    MethodSelected,
    Challenged,
    Verified,
    Completed,
    Failed,
}

impl ProcedureState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcedureState::Completed | ProcedureState::Failed)
    }
}

impl fmt::Display for ProcedureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcedureState::Unopened => "unopened",
            ProcedureState::Opened => "opened",
            ProcedureState::MethodSelected => "method-selected",
            ProcedureState::Challenged => "challenged",
            ProcedureState::Verified => "verified",
            ProcedureState::Completed => "completed",
            ProcedureState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Provider session marker obtained from the login entry page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginContext {
    pub lck: String,
    /// Page the login entry request ended on
    pub entry_page: Url,
}

/// One-time code produced by a confirmed QR challenge
#[derive(Clone, PartialEq, Eq)]
pub struct PassCode(String);

/// Token produced by a verified SMS code
#[derive(Clone, PartialEq, Eq)]
pub struct SmsToken(String);

macro_rules! secret_newtype {
    ($name:ident) => {
        impl $name {
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), mask(&self.0))
            }
        }
    };
}

secret_newtype!(PassCode);
secret_newtype!(SmsToken);

/// Token accepted by [`AuthProcedure::complete`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationToken {
    Qr(PassCode),
    Sms(SmsToken),
}

impl From<PassCode> for VerificationToken {
    fn from(code: PassCode) -> Self {
        VerificationToken::Qr(code)
    }
}

impl From<SmsToken> for VerificationToken {
    fn from(token: SmsToken) -> Self {
        VerificationToken::Sms(token)
    }
}

/// The single challenge a procedure may have in flight
#[derive(Debug)]
pub(crate) enum ActiveChallenge {
    Qr(QrSession),
    Sms(SmsSession),
}

/// What a resolved challenge left behind for the ticket exchange
#[derive(Debug)]
pub(crate) enum Verified {
    Qr { pass_code: PassCode, grant: QrGrant },
    Sms { token: SmsToken },
}

impl Verified {
    fn matches(&self, token: &VerificationToken) -> bool {
        match (self, token) {
            (Verified::Qr { pass_code, .. }, VerificationToken::Qr(given)) => pass_code == given,
            (Verified::Sms { token }, VerificationToken::Sms(given)) => token == given,
            _ => false,
        }
    }
}

/// Outcome of racing a future against cancellation and a deadline
pub(crate) enum Race<T> {
    Cancelled,
    DeadlineReached,
    Ready(T),
}

/// Single-use SSO login state machine
///
/// Operations take `&mut self`; one procedure serves exactly one login and is
/// never driven from two tasks at once.
pub struct AuthProcedure<S: HttpSession> {
    http: S,
    platform: PlatformRegistration,
    settings: SsoSettings,
    cancel: CancellationToken,
    state: ProcedureState,
    context: Option<LoginContext>,
    catalog: Option<AuthMethodCatalog>,
    method: Option<MethodKind>,
    challenge: Option<ActiveChallenge>,
    verified: Option<Verified>,
    /// Last SMS dispatch per phone number, kept across challenges
    sms_sent: HashMap<String, Instant>,
    result: Option<AuthResult>,
}

impl<S: HttpSession> AuthProcedure<S> {
    #[must_use]
    pub fn new(http: S, platform: PlatformRegistration, settings: SsoSettings) -> Self {
        Self {
            http,
            platform,
            settings,
            cancel: CancellationToken::new(),
            state: ProcedureState::Unopened,
            context: None,
            catalog: None,
            method: None,
            challenge: None,
            verified: None,
            sms_sent: HashMap::new(),
            result: None,
        }
    }

    /// Use a caller-owned cancellation token
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts any in-flight request or poll when cancelled
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn state(&self) -> ProcedureState {
        self.state
    }

    #[must_use]
    pub fn platform(&self) -> &PlatformRegistration {
        &self.platform
    }

    #[must_use]
    pub fn settings(&self) -> &SsoSettings {
        &self.settings
    }

    #[must_use]
    pub fn context(&self) -> Option<&LoginContext> {
        self.context.as_ref()
    }

    /// Methods discovered by `open`
    #[must_use]
    pub fn catalog(&self) -> Option<&AuthMethodCatalog> {
        self.catalog.as_ref()
    }

    #[must_use]
    pub fn selected_method(&self) -> Option<MethodKind> {
        self.method
    }

    /// Result of a completed procedure
    #[must_use]
    pub fn result(&self) -> Option<&AuthResult> {
        self.result.as_ref()
    }

    #[must_use]
    pub fn http(&self) -> &S {
        &self.http
    }

    pub fn into_http(self) -> S {
        self.http
    }

    /// Establish the provider login context and discover the method catalog
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the procedure was already opened
    /// - `CatalogUnavailable` if the login page carries no session marker or
    ///   the provider does not list methods for this platform
    /// - `Transport` / `Cancelled` on network failure or cancellation
    pub async fn open(&mut self) -> Result<&AuthMethodCatalog> {
        let outcome = self.open_inner().await;
        self.settle(outcome)?;
        self.catalog
            .as_ref()
            .ok_or_else(|| self.invalid_state("open"))
    }

    async fn open_inner(&mut self) -> Result<()> {
        self.require("open", &[ProcedureState::Unopened])?;

        let provider = &self.settings.provider;
        let url = provider
            .idp_url(&provider.authenticate_path)
            .map_err(TransportError::from)?;
        let request = HttpRequest::get(url).with_query(self.platform.login_params());
        let response = self.send(request).await?;
        if !response.is_success() {
            return Err(AuthError::CatalogUnavailable(format!(
                "login entry returned HTTP {}",
                response.status
            )));
        }

        let lck = extract_lck(response.url.as_str())
            .or_else(|| extract_lck(&response.text()))
            .ok_or_else(|| {
                AuthError::CatalogUnavailable("login page carried no lck marker".to_string())
            })?;
        let context = LoginContext {
            lck,
            entry_page: response.url,
        };
        LoggingHelper::log_login_context(&self.platform.name, &context.lck, &context.entry_page);

        let catalog = self
            .guarded(catalog::discover(
                &self.http,
                &self.settings.provider,
                &self.platform,
                &context,
            ))
            .await?;

        self.context = Some(context);
        self.catalog = Some(catalog);
        self.state = ProcedureState::Opened;
        Ok(())
    }

    /// Choose the challenge method
    ///
    /// Allowed after `open` and again after a challenge was abandoned, so a
    /// caller can switch methods. A missing method leaves the state unchanged.
    ///
    /// # Errors
    ///
    /// - `InvalidState` before `open`, while a challenge is pending, or later
    /// - `MethodUnavailable` if the catalog has no enabled descriptor for `kind`
    pub fn select_method(&mut self, kind: MethodKind) -> Result<()> {
        self.require(
            "select_method",
            &[ProcedureState::Opened, ProcedureState::MethodSelected],
        )?;

        let descriptor = self
            .catalog
            .as_ref()
            .and_then(|catalog| catalog.find_enabled(kind))
            .ok_or(AuthError::MethodUnavailable(kind))?;
        LoggingHelper::log_method_selected(&self.platform.name, descriptor);

        self.method = Some(kind);
        self.state = ProcedureState::MethodSelected;
        Ok(())
    }

    /// Fail fast unless the procedure is in one of `allowed`
    pub(crate) fn require(
        &self,
        operation: &'static str,
        allowed: &[ProcedureState],
    ) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.invalid_state(operation))
        }
    }

    /// Fail fast unless `kind` is the selected method
    pub(crate) fn require_method(&self, operation: &'static str, kind: MethodKind) -> Result<()> {
        if self.method == Some(kind) {
            Ok(())
        } else {
            Err(self.invalid_state(operation))
        }
    }

    pub(crate) fn invalid_state(&self, operation: &'static str) -> AuthError {
        AuthError::InvalidState {
            operation,
            state: self.state,
        }
    }

    pub(crate) fn login_context(&self, operation: &'static str) -> Result<LoginContext> {
        self.context
            .clone()
            .ok_or_else(|| self.invalid_state(operation))
    }

    /// Record a terminal error as the procedure's final state
    pub(crate) fn settle<T>(&mut self, outcome: Result<T>) -> Result<T> {
        if let Err(err) = &outcome {
            if err.is_terminal() && self.state != ProcedureState::Failed {
                error!(
                    "{} authentication failed while {}: {}",
                    self.platform.name, self.state, err
                );
                self.state = ProcedureState::Failed;
                self.challenge = None;
                self.verified = None;
            }
        }
        outcome
    }

    /// Drop the pending challenge and return to method selection
    pub(crate) fn abandon_challenge(&mut self, err: AuthError) -> AuthError {
        info!("{} challenge abandoned: {}", self.platform.name, err);
        self.challenge = None;
        self.state = ProcedureState::MethodSelected;
        err
    }

    /// Send one request, aborting promptly on cancellation
    pub(crate) async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.guarded(async { self.http.execute(request).await.map_err(AuthError::from) })
            .await
    }

    /// Run a future unless the procedure gets cancelled first
    pub(crate) async fn guarded<T, F>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(AuthError::Cancelled);
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(AuthError::Cancelled),
            outcome = future => outcome,
        }
    }

    /// Run a future against cancellation and a deadline
    pub(crate) async fn race<T, F>(&self, deadline: Instant, future: F) -> Race<T>
    where
        F: Future<Output = T>,
    {
        if self.cancel.is_cancelled() {
            return Race::Cancelled;
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Race::Cancelled,
            () = sleep_until(deadline) => Race::DeadlineReached,
            value = future => Race::Ready(value),
        }
    }
}

impl<S: HttpSession> fmt::Debug for AuthProcedure<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthProcedure")
            .field("platform", &self.platform.name)
            .field("state", &self.state)
            .field("method", &self.method)
            .field("challenge", &self.challenge)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::TestFixtures;
    use crate::testing::mock::StubResponse;
    use crate::http::HttpMethod;

    #[tokio::test]
    async fn test_open_populates_catalog_once() {
        let mut procedure = TestFixtures::procedure(TestFixtures::provider());

        let catalog = procedure.open().await.unwrap();
        assert!(catalog.lookup("microQr").is_some());
        assert!(catalog.lookup("userAndSms").is_some());
        assert_eq!(procedure.state(), ProcedureState::Opened);
        assert_eq!(
            procedure.context().map(|c| c.lck.as_str()),
            Some(TestFixtures::LCK)
        );

        let err = procedure.open().await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::InvalidState { operation: "open", state: ProcedureState::Opened }
        ));
        assert_eq!(procedure.state(), ProcedureState::Opened);
    }

    #[tokio::test]
    async fn test_open_echoes_platform_params() {
        let provider = TestFixtures::provider();
        let mut procedure = TestFixtures::procedure(provider);
        procedure.open().await.unwrap();

        let requests = procedure.http().requests();
        let login = requests
            .iter()
            .find(|r| r.url.path() == "/idp/authCenter/authenticate")
            .unwrap();
        assert_eq!(login.query_value("client_id").as_deref(), Some(TestFixtures::SERVICE_ID));
        assert_eq!(login.query_value("state").as_deref(), Some("test-state"));

        let listing = requests
            .iter()
            .find(|r| r.url.path() == "/idp/authn/queryAuthMethods")
            .unwrap();
        assert_eq!(listing.body_value("lck").as_deref(), Some(TestFixtures::LCK));
        assert_eq!(
            listing.body_value("entityId").as_deref(),
            Some(TestFixtures::SERVICE_ID)
        );
    }

    #[tokio::test]
    async fn test_missing_lck_fails_procedure() {
        let provider = TestFixtures::provider();
        provider.replace(
            HttpMethod::Get,
            "/idp/authCenter/authenticate",
            vec![StubResponse::html("<html>maintenance</html>")],
        );
        let mut procedure = TestFixtures::procedure(provider);

        let err = procedure.open().await.unwrap_err();
        assert!(matches!(err, AuthError::CatalogUnavailable(_)));
        assert_eq!(procedure.state(), ProcedureState::Failed);
        assert!(matches!(
            procedure.select_method(MethodKind::Qr),
            Err(AuthError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_select_before_open_is_invalid() {
        let mut procedure = TestFixtures::procedure(TestFixtures::provider());
        let err = procedure.select_method(MethodKind::Sms).unwrap_err();
        assert!(matches!(
            err,
            AuthError::InvalidState { operation: "select_method", state: ProcedureState::Unopened }
        ));
        assert!(procedure.http().requests().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_open() {
        let mut procedure = TestFixtures::procedure(TestFixtures::provider());
        procedure.cancellation_token().cancel();

        let err = procedure.open().await.unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
        assert_eq!(procedure.state(), ProcedureState::Failed);
        assert!(procedure.http().requests().is_empty());
    }

    #[test]
    fn test_secret_debug_is_masked() {
        let code = PassCode::new("123456789");
        assert_eq!(format!("{code:?}"), "PassCode(123***)");
        assert_eq!(code.as_str(), "123456789");
    }

    #[test]
    fn test_verified_matches_only_same_token() {
        let verified = Verified::Sms {
            token: SmsToken::new("tok"),
        };
        assert!(verified.matches(&SmsToken::new("tok").into()));
        assert!(!verified.matches(&SmsToken::new("other").into()));
        assert!(!verified.matches(&PassCode::new("tok").into()));
    }
}
