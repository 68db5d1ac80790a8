//! Ticket exchange shared by both challenge methods
//!
//! A verified challenge is redeemed at the provider, which answers with a
//! redirect chain towards the platform. HTTP redirects are followed by the
//! session; pages that redirect from script or meta refresh are followed
//! here, up to a configured number of hops.

use std::collections::HashMap;

use log::debug;
use url::Url;

use super::{AuthProcedure, ProcedureState, Verified, VerificationToken};
use crate::errors::{AuthError, Result, TransportError};
use crate::http::{HttpRequest, HttpResponse, HttpSession};
use crate::protocol::Envelope;
use crate::session::AuthResult;
use crate::utils::logging::LoggingHelper;
use crate::utils::markers::extract_client_redirect;

/// Where a redirect chain came to rest
#[derive(Debug, PartialEq, Eq)]
enum Landing {
    Platform,
    Provider,
    Elsewhere,
}

impl<S: HttpSession> AuthProcedure<S> {
    /// Exchange the verification token for the platform session
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless a challenge was verified and `token` is the
    ///   token it produced
    /// - `TicketRejected` if the provider refuses the exchange
    /// - `RedirectIncomplete` if the chain ends off the platform
    /// - `Transport` / `Cancelled` on network failure or cancellation
    pub async fn complete(&mut self, token: impl Into<VerificationToken>) -> Result<AuthResult> {
        let token = token.into();
        let outcome = self.complete_inner(&token).await;
        self.settle(outcome)
    }

    async fn complete_inner(&mut self, token: &VerificationToken) -> Result<AuthResult> {
        const OPERATION: &str = "complete";
        self.require(OPERATION, &[ProcedureState::Verified])?;
        let request = match &self.verified {
            Some(verified) if verified.matches(token) => self.exchange_request(verified)?,
            _ => return Err(self.invalid_state(OPERATION)),
        };
        LoggingHelper::log_ticket_exchange_start(&self.platform.name, &request.url);

        let mut response = self.send(request).await?;
        for hop in 1..=self.settings.http.max_client_redirects {
            if self.landing(&response.url) == Landing::Platform || !response.is_success() {
                break;
            }
            let Some(target) = extract_client_redirect(&response.text(), &response.url) else {
                break;
            };
            LoggingHelper::log_client_redirect(hop, &target);
            response = self.send(HttpRequest::get(target)).await?;
        }

        let result = self.classify(response)?;
        let mut cookie_names: Vec<&String> = result.cookies.keys().collect();
        cookie_names.sort();
        LoggingHelper::log_completion(&self.platform.name, &result.final_url, &cookie_names);

        self.verified = None;
        self.result = Some(result.clone());
        self.state = ProcedureState::Completed;
        Ok(result)
    }

    fn exchange_request(&self, verified: &Verified) -> Result<HttpRequest> {
        match verified {
            Verified::Qr { pass_code, grant } => Ok(HttpRequest::get(grant.return_url.clone())
                .with_query([
                    ("appid", grant.app_id.as_str()),
                    ("auth_code", pass_code.as_str()),
                    ("rand_token", grant.random_token.as_str()),
                ])),
            Verified::Sms { token } => {
                let provider = &self.settings.provider;
                let url = provider
                    .idp_url(&provider.authn_engine_path)
                    .map_err(TransportError::from)?;
                Ok(HttpRequest::post_form(
                    url,
                    vec![("loginToken".to_string(), token.as_str().to_string())],
                )
                .with_query([("locale", provider.locale.as_str())]))
            }
        }
    }

    fn landing(&self, url: &Url) -> Landing {
        let host = url.host_str();
        if host.is_some() && host == self.platform.host() {
            return Landing::Platform;
        }
        let on_provider = host.is_some_and(|host| {
            self.settings
                .provider
                .hosts()
                .iter()
                .any(|provider_host| provider_host == host)
        });
        if on_provider {
            Landing::Provider
        } else {
            Landing::Elsewhere
        }
    }

    fn classify(&self, response: HttpResponse) -> Result<AuthResult> {
        match self.landing(&response.url) {
            Landing::Platform if response.status < 400 => {
                let mut cookies: HashMap<String, String> =
                    self.http.cookies(&self.platform.entry_url);
                cookies.extend(self.http.cookies(&response.url));
                Ok(AuthResult {
                    final_url: response.url,
                    status: response.status,
                    cookies,
                })
            }
            Landing::Provider => Err(AuthError::TicketRejected(Self::rejection_reason(&response))),
            Landing::Platform | Landing::Elsewhere => {
                debug!(
                    "Redirect chain ended at {} with HTTP {}",
                    response.url, response.status
                );
                Err(AuthError::RedirectIncomplete {
                    final_url: response.url.to_string(),
                })
            }
        }
    }

    fn rejection_reason(response: &HttpResponse) -> String {
        if let Ok(envelope) = response.json::<Envelope<serde_json::Value>>() {
            if !envelope.code.is_success() {
                return envelope.describe();
            }
        }
        if response.is_client_error() {
            format!("HTTP {} at {}", response.status, response.url.path())
        } else {
            format!("chain stopped at provider page {}", response.url.path())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::TestFixtures;

    #[test]
    fn test_landing_classification() {
        let procedure = TestFixtures::procedure(TestFixtures::provider());
        let at = |s: &str| procedure.landing(&Url::parse(s).unwrap());

        assert_eq!(at(TestFixtures::PLATFORM_HOME), Landing::Platform);
        assert_eq!(at("https://sso.test/idp/authCenter/authenticate"), Landing::Provider);
        assert_eq!(at("https://sis.test/connect/qrpage"), Landing::Provider);
        assert_eq!(at("https://elsewhere.test/"), Landing::Elsewhere);
    }
}
