//! SMS challenge sub-flow
//!
//! Eligibility check, code dispatch with a per-number resend interval, and
//! code verification with a bounded number of attempts.

use chrono::{DateTime, Utc};
use log::info;
use tokio::time::Instant;

use super::{ActiveChallenge, AuthProcedure, ProcedureState, SmsToken, Verified};
use crate::catalog::MethodKind;
use crate::errors::{AuthError, Result, TransportError};
use crate::http::{HttpRequest, HttpSession};
use crate::protocol::{
    AuthExecuteResponse, Envelope, SmsCheckData, CODE_ATTEMPTS_EXHAUSTED, CODE_RATE_LIMITED,
};
use crate::utils::logging::{mask, LoggingHelper};

/// A code sent to a phone number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsChallenge {
    pub phone_number: String,
    pub sent_at: DateTime<Utc>,
    /// Codes submitted so far
    pub attempts: u32,
    /// Set once, when a submitted code is accepted
    pub verification_token: Option<SmsToken>,
}

#[derive(Debug)]
pub(crate) struct SmsSession {
    challenge: SmsChallenge,
}

impl<S: HttpSession> AuthProcedure<S> {
    /// Ask the provider whether `phone_number` can receive a login code
    ///
    /// A number the provider does not know is reported as `Ok(false)`.
    ///
    /// # Errors
    ///
    /// - `MethodUnavailable` if the catalog offers no enabled SMS method
    /// - `InvalidState` before `open`, after the procedure ended, or once a
    ///   method other than SMS was selected
    /// - `Transport` / `Cancelled` on network failure or cancellation
    pub async fn check_eligible(&mut self, phone_number: &str) -> Result<bool> {
        let outcome = self.check_eligible_inner(phone_number).await;
        self.settle(outcome)
    }

    async fn check_eligible_inner(&mut self, phone_number: &str) -> Result<bool> {
        const OPERATION: &str = "check_eligible";
        self.require(
            OPERATION,
            &[
                ProcedureState::Opened,
                ProcedureState::MethodSelected,
                ProcedureState::Challenged,
            ],
        )?;
        self.sms_descriptor_code()?;
        if self.state != ProcedureState::Opened {
            self.require_method(OPERATION, MethodKind::Sms)?;
        }
        let context = self.login_context(OPERATION)?;
        let provider = &self.settings.provider;

        let url = provider
            .idp_url(&provider.sms_check_path)
            .map_err(TransportError::from)?;
        let body = serde_json::json!({
            "entityId": self.platform.service_id,
            "lck": context.lck,
            "loginName": phone_number,
        });
        let response = self.send(HttpRequest::post_json(url, body)).await?;
        let envelope: Envelope<SmsCheckData> = response
            .json()
            .map_err(|e| TransportError::unexpected(&provider.sms_check_path, e.to_string()))?;

        if !envelope.code.is_success() {
            info!(
                "Provider declined SMS for {}: {}",
                mask(phone_number),
                envelope.describe()
            );
            return Ok(false);
        }
        Ok(envelope.data.is_some_and(|data| data.available))
    }

    /// Send a login code to `phone_number`
    ///
    /// Sending again to the same number replaces the pending challenge once
    /// the resend interval has passed.
    ///
    /// # Errors
    ///
    /// - `RateLimited` within the resend interval or when the provider
    ///   throttles, with the state unchanged
    /// - `InvalidState` unless SMS was selected, or if a challenge for a
    ///   different number is pending
    /// - `Transport` / `Cancelled` on network failure or cancellation
    pub async fn send_code(&mut self, phone_number: &str) -> Result<SmsChallenge> {
        let outcome = self.send_code_inner(phone_number).await;
        self.settle(outcome)
    }

    async fn send_code_inner(&mut self, phone_number: &str) -> Result<SmsChallenge> {
        const OPERATION: &str = "send_code";
        self.require(
            OPERATION,
            &[ProcedureState::MethodSelected, ProcedureState::Challenged],
        )?;
        self.require_method(OPERATION, MethodKind::Sms)?;
        if let Some(ActiveChallenge::Sms(session)) = &self.challenge {
            if session.challenge.phone_number != phone_number {
                return Err(self.invalid_state(OPERATION));
            }
        }

        let resend_interval = self.settings.sms.resend_interval();
        if let Some(sent) = self.sms_sent.get(phone_number) {
            let elapsed = sent.elapsed();
            if elapsed < resend_interval {
                return Err(AuthError::RateLimited {
                    retry_after: resend_interval - elapsed,
                });
            }
        }

        let context = self.login_context(OPERATION)?;
        let provider = &self.settings.provider;
        let url = provider
            .idp_url(&provider.sms_send_path)
            .map_err(TransportError::from)?;
        let body = serde_json::json!({
            "entityId": self.platform.service_id,
            "lck": context.lck,
            "loginName": phone_number,
        });
        let response = self.send(HttpRequest::post_json(url, body)).await?;
        if response.status == 429 {
            return Err(AuthError::RateLimited {
                retry_after: resend_interval,
            });
        }
        let envelope: Envelope<serde_json::Value> = response
            .json()
            .map_err(|e| TransportError::unexpected(&provider.sms_send_path, e.to_string()))?;
        if envelope.code.as_i64() == Some(CODE_RATE_LIMITED) {
            return Err(AuthError::RateLimited {
                retry_after: resend_interval,
            });
        }
        if !envelope.code.is_success() {
            return Err(
                TransportError::unexpected(&provider.sms_send_path, envelope.describe()).into(),
            );
        }

        let challenge = SmsChallenge {
            phone_number: phone_number.to_string(),
            sent_at: Utc::now(),
            attempts: 0,
            verification_token: None,
        };
        LoggingHelper::log_sms_sent(phone_number);

        self.sms_sent.insert(phone_number.to_string(), Instant::now());
        self.challenge = Some(ActiveChallenge::Sms(SmsSession {
            challenge: challenge.clone(),
        }));
        self.state = ProcedureState::Challenged;
        Ok(challenge)
    }

    /// The pending SMS challenge with its current attempt count
    #[must_use]
    pub fn sms_challenge(&self) -> Option<&SmsChallenge> {
        match &self.challenge {
            Some(ActiveChallenge::Sms(session)) => Some(&session.challenge),
            _ => None,
        }
    }

    /// Submit the code the user received
    ///
    /// # Errors
    ///
    /// - `CodeIncorrect` if the provider rejects the code; the challenge stays
    ///   pending and the attempt is counted
    /// - `CodeExhausted` once the attempt limit is reached; the challenge is
    ///   discarded and a new code must be sent
    /// - `InvalidState` if `challenge` is not the pending challenge
    /// - `Transport` / `Cancelled` on network failure or cancellation
    pub async fn submit_code(&mut self, challenge: &SmsChallenge, code: &str) -> Result<SmsToken> {
        let outcome = self.submit_code_inner(challenge, code).await;
        self.settle(outcome)
    }

    async fn submit_code_inner(&mut self, challenge: &SmsChallenge, code: &str) -> Result<SmsToken> {
        const OPERATION: &str = "submit_code";
        self.require(OPERATION, &[ProcedureState::Challenged])?;
        let max_attempts = self.settings.sms.max_attempts;

        let attempts = match &self.challenge {
            Some(ActiveChallenge::Sms(session))
                if session.challenge.phone_number == challenge.phone_number
                    && session.challenge.sent_at == challenge.sent_at =>
            {
                session.challenge.attempts
            }
            _ => return Err(self.invalid_state(OPERATION)),
        };
        if attempts >= max_attempts {
            return Err(self.abandon_challenge(AuthError::CodeExhausted { attempts }));
        }
        let attempts = attempts + 1;
        self.record_sms_attempt(attempts);

        let chain_code = self.sms_descriptor_code()?;
        let context = self.login_context(OPERATION)?;
        let provider = &self.settings.provider;
        let url = provider
            .idp_url(&provider.auth_execute_path)
            .map_err(TransportError::from)?;
        let body = serde_json::json!({
            "authModuleCode": MethodKind::Sms.module_code(),
            "authChainCode": chain_code,
            "entityId": self.platform.service_id,
            "requestType": "chain_type",
            "lck": context.lck,
            "authPara": {
                "loginName": challenge.phone_number,
                "smsCode": code,
                "verifyCode": "",
            },
        });
        let response = self.send(HttpRequest::post_json(url, body)).await?;
        let verdict: AuthExecuteResponse = response
            .json()
            .map_err(|e| TransportError::unexpected(&provider.auth_execute_path, e.to_string()))?;

        if verdict.code.is_success() {
            if let Some(token) = verdict.token() {
                return Ok(self.accept_sms_token(SmsToken::new(token)));
            }
            return Err(TransportError::unexpected(
                &provider.auth_execute_path,
                "accepted code without login token",
            )
            .into());
        }
        if verdict.code.as_i64() == Some(CODE_ATTEMPTS_EXHAUSTED) {
            return Err(self.abandon_challenge(AuthError::CodeExhausted { attempts }));
        }

        LoggingHelper::log_sms_code_rejected(attempts, max_attempts);
        Err(AuthError::CodeIncorrect {
            attempts,
            max_attempts,
        })
    }

    /// Chain code of the enabled SMS method
    fn sms_descriptor_code(&self) -> Result<String> {
        self.catalog
            .as_ref()
            .and_then(|catalog| catalog.find_enabled(MethodKind::Sms))
            .map(|descriptor| descriptor.chain_code.clone().unwrap_or_default())
            .ok_or(AuthError::MethodUnavailable(MethodKind::Sms))
    }

    fn record_sms_attempt(&mut self, attempts: u32) {
        if let Some(ActiveChallenge::Sms(session)) = &mut self.challenge {
            session.challenge.attempts = attempts;
        }
    }

    fn accept_sms_token(&mut self, token: SmsToken) -> SmsToken {
        if let Some(ActiveChallenge::Sms(mut session)) = self.challenge.take() {
            session.challenge.verification_token = Some(token.clone());
            info!(
                "SMS code for {} accepted after {} attempt(s)",
                mask(&session.challenge.phone_number),
                session.challenge.attempts
            );
        }
        self.verified = Some(Verified::Sms {
            token: token.clone(),
        });
        self.state = ProcedureState::Verified;
        token
    }
}
