//! QR challenge sub-flow
//!
//! The provider bootstraps a micro-QR session, the QR service renders the
//! code and reports its status. Polling follows the provider's suggested
//! interval, never faster than the configured floor, and stops on
//! confirmation, rejection, expiry, timeout, or cancellation.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::time::{sleep, Instant};
use url::Url;

use super::{ActiveChallenge, AuthProcedure, PassCode, ProcedureState, Race, Verified};
use crate::catalog::MethodKind;
use crate::errors::{AuthError, Result, TransportError};
use crate::http::{HttpRequest, HttpSession};
use crate::protocol::{Envelope, MicroQrData, QrStateResponse};
use crate::utils::logging::LoggingHelper;
use crate::utils::markers::{decode_image, extract_sid};

/// Upper bound on a challenge's lifetime, whatever the settings say
const MAX_CHALLENGE_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Status of a QR challenge as last observed
///
/// Statuses only move forward: `Pending -> Scanned -> Confirmed`, with
/// `Expired` reachable from either of the first two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QrStatus {
    Pending,
    Scanned,
    Confirmed,
    Expired,
}

impl QrStatus {
    fn rank(self) -> u8 {
        match self {
            QrStatus::Pending => 0,
            QrStatus::Scanned => 1,
            QrStatus::Confirmed | QrStatus::Expired => 2,
        }
    }
}

impl fmt::Display for QrStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QrStatus::Pending => "pending",
            QrStatus::Scanned => "scanned",
            QrStatus::Confirmed => "confirmed",
            QrStatus::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// A QR code to show to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrChallenge {
    /// QR service session id (`sid`)
    pub challenge_id: String,
    pub image_bytes: Vec<u8>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: QrStatus,
}

/// Bootstrap data needed to redeem the pass code
#[derive(Debug, Clone)]
pub(crate) struct QrGrant {
    pub(crate) app_id: String,
    pub(crate) return_url: Url,
    pub(crate) random_token: String,
}

/// Procedure-side state of the pending QR challenge
#[derive(Debug)]
pub(crate) struct QrSession {
    challenge: QrChallenge,
    grant: QrGrant,
    expires: Instant,
    polls: u32,
}

/// One status poll, interpreted
#[derive(Debug, PartialEq, Eq)]
enum QrReport {
    Pending,
    Scanned,
    Confirmed(String),
    Expired,
    Rejected,
    Unknown(String),
}

impl QrReport {
    fn from_response(response: &QrStateResponse) -> Self {
        match response.code.as_i64() {
            Some(0) => QrReport::Pending,
            Some(2) => QrReport::Scanned,
            Some(3) => QrReport::Expired,
            Some(4) => QrReport::Rejected,
            Some(1) => match response.data.as_deref().filter(|d| !d.is_empty()) {
                Some(code) => QrReport::Confirmed(code.to_string()),
                None => QrReport::Unknown("confirmation without pass code".to_string()),
            },
            _ => QrReport::Unknown(response.code.to_string()),
        }
    }
}

impl<S: HttpSession> AuthProcedure<S> {
    /// Issue a fresh QR challenge
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless QR was selected and no challenge is pending
    /// - `Transport` / `Cancelled` if the bootstrap, page, or image request
    ///   fails or the provider answers out of protocol
    pub async fn request_challenge(&mut self) -> Result<QrChallenge> {
        let outcome = self.request_challenge_inner().await;
        self.settle(outcome)
    }

    async fn request_challenge_inner(&mut self) -> Result<QrChallenge> {
        const OPERATION: &str = "request_challenge";
        self.require(OPERATION, &[ProcedureState::MethodSelected])?;
        self.require_method(OPERATION, MethodKind::Qr)?;
        let context = self.login_context(OPERATION)?;
        let provider = &self.settings.provider;

        let bootstrap_url = provider
            .idp_url(&provider.micro_qr_path)
            .map_err(TransportError::from)?;
        let body = serde_json::json!({
            "entityId": self.platform.service_id,
            "lck": context.lck,
        });
        let response = self.send(HttpRequest::post_json(bootstrap_url, body)).await?;
        let envelope: Envelope<MicroQrData> = response
            .json()
            .map_err(|e| TransportError::unexpected(&provider.micro_qr_path, e.to_string()))?;
        if !envelope.code.is_success() {
            return Err(TransportError::unexpected(&provider.micro_qr_path, envelope.describe()).into());
        }
        let data = envelope.data.ok_or_else(|| {
            TransportError::unexpected(&provider.micro_qr_path, "bootstrap carried no data")
        })?;
        let grant = QrGrant {
            return_url: Url::parse(&data.return_url).map_err(TransportError::from)?,
            app_id: data.app_id,
            random_token: data.random_token,
        };

        let page_url = provider
            .qr_url(&provider.qr_page_path)
            .map_err(TransportError::from)?;
        let page_request = HttpRequest::get(page_url).with_query([
            ("appid", grant.app_id.as_str()),
            ("return_url", grant.return_url.as_str()),
            ("rand_token", grant.random_token.as_str()),
            ("embed_flag", "1"),
        ]);
        let page = self.send(page_request).await?;
        let challenge_id = extract_sid(&page.text()).ok_or_else(|| {
            TransportError::unexpected(&provider.qr_page_path, "QR page carried no sid")
        })?;

        let image_url = provider
            .qr_url(&provider.qr_image_path)
            .map_err(TransportError::from)?;
        let image = self
            .send(HttpRequest::get(image_url).with_query([("sid", challenge_id.as_str())]))
            .await?;
        if !image.is_success() {
            return Err(TransportError::unexpected(
                &provider.qr_image_path,
                format!("HTTP {}", image.status),
            )
            .into());
        }
        let image_bytes = decode_image(image.body)
            .map_err(|e| TransportError::unexpected(&provider.qr_image_path, e.to_string()))?;

        let lifetime = self
            .settings
            .polling
            .challenge_lifetime()
            .min(MAX_CHALLENGE_LIFETIME);
        let issued_at = Utc::now();
        let expires_at = issued_at
            + chrono::Duration::from_std(lifetime).unwrap_or_else(|_| chrono::Duration::days(1));
        let challenge = QrChallenge {
            challenge_id,
            image_bytes,
            issued_at,
            expires_at,
            status: QrStatus::Pending,
        };
        LoggingHelper::log_qr_challenge_issued(
            &challenge.challenge_id,
            challenge.image_bytes.len(),
            (expires_at - issued_at).num_seconds(),
        );

        self.challenge = Some(ActiveChallenge::Qr(QrSession {
            challenge: challenge.clone(),
            grant,
            expires: Instant::now() + lifetime,
            polls: 0,
        }));
        self.state = ProcedureState::Challenged;
        Ok(challenge)
    }

    /// The pending QR challenge with its latest observed status
    #[must_use]
    pub fn qr_challenge(&self) -> Option<&QrChallenge> {
        match &self.challenge {
            Some(ActiveChallenge::Qr(session)) => Some(&session.challenge),
            _ => None,
        }
    }

    /// Poll the QR service until the challenge resolves
    ///
    /// Waits `poll_interval` between polls unless the provider suggests its
    /// own interval, and never less than the configured minimum. Gives up at
    /// `timeout` or when the challenge lifetime ends, whichever comes first.
    ///
    /// # Errors
    ///
    /// - `ChallengeExpired` on provider expiry or local timeout
    /// - `ChallengeRejected` if the user declined on the device
    /// - `InvalidState` if `challenge` is not the pending challenge
    /// - `Transport` / `Cancelled` on network failure or cancellation
    pub async fn poll_until_resolved(
        &mut self,
        challenge: &QrChallenge,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<PassCode> {
        let outcome = self.poll_inner(challenge, poll_interval, timeout).await;
        self.settle(outcome)
    }

    async fn poll_inner(
        &mut self,
        challenge: &QrChallenge,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<PassCode> {
        const OPERATION: &str = "poll_until_resolved";
        self.require(OPERATION, &[ProcedureState::Challenged])?;
        let expires = match &self.challenge {
            Some(ActiveChallenge::Qr(session))
                if session.challenge.challenge_id == challenge.challenge_id =>
            {
                session.expires
            }
            _ => return Err(self.invalid_state(OPERATION)),
        };

        let deadline = Instant::now()
            .checked_add(timeout)
            .map_or(expires, |local| local.min(expires));
        let floor = self.settings.polling.min_interval();
        let provider = &self.settings.provider;
        let state_url = provider
            .qr_url(&provider.qr_state_path)
            .map_err(TransportError::from)?;

        loop {
            let request = HttpRequest::get(state_url.clone())
                .with_query([("sid", challenge.challenge_id.as_str())]);
            let response = match self.race(deadline, self.http.execute(request)).await {
                Race::Cancelled => return Err(AuthError::Cancelled),
                Race::DeadlineReached => {
                    return Err(self.abandon_challenge(AuthError::ChallengeExpired))
                }
                Race::Ready(response) => response?,
            };

            let mut suggested = None;
            let report = if response.is_success() {
                match response.json::<QrStateResponse>() {
                    Ok(state) => {
                        suggested = state.interval.map(Duration::from_secs);
                        QrReport::from_response(&state)
                    }
                    Err(e) => QrReport::Unknown(format!("malformed status: {e}")),
                }
            } else {
                QrReport::Unknown(format!("HTTP {}", response.status))
            };

            match report {
                QrReport::Pending => self.observe_qr_status(QrStatus::Pending),
                QrReport::Scanned => self.observe_qr_status(QrStatus::Scanned),
                QrReport::Confirmed(code) => {
                    self.observe_qr_status(QrStatus::Confirmed);
                    return self.confirm_qr(PassCode::new(code));
                }
                QrReport::Expired => {
                    self.observe_qr_status(QrStatus::Expired);
                    return Err(self.abandon_challenge(AuthError::ChallengeExpired));
                }
                QrReport::Rejected => {
                    return Err(self.abandon_challenge(AuthError::ChallengeRejected));
                }
                QrReport::Unknown(reason) => {
                    self.observe_qr_poll();
                    warn!("Unrecognised QR status ({reason}), continuing to poll");
                }
            }

            let wait = suggested.unwrap_or(poll_interval).max(floor);
            debug!("Next QR poll in {wait:?}");
            match self.race(deadline, sleep(wait)).await {
                Race::Cancelled => return Err(AuthError::Cancelled),
                Race::DeadlineReached => {
                    return Err(self.abandon_challenge(AuthError::ChallengeExpired))
                }
                Race::Ready(()) => {}
            }
        }
    }

    fn observe_qr_poll(&mut self) -> u32 {
        match &mut self.challenge {
            Some(ActiveChallenge::Qr(session)) => {
                session.polls += 1;
                session.polls
            }
            _ => 0,
        }
    }

    /// Apply a reported status, ignoring anything that would move backwards
    fn observe_qr_status(&mut self, reported: QrStatus) {
        let polls = self.observe_qr_poll();
        if let Some(ActiveChallenge::Qr(session)) = &mut self.challenge {
            let current = session.challenge.status;
            if reported.rank() > current.rank() {
                LoggingHelper::log_qr_transition(polls, current, reported);
                session.challenge.status = reported;
            } else if reported != current {
                LoggingHelper::log_qr_status_ignored(current, reported);
            }
        }
    }

    fn confirm_qr(&mut self, pass_code: PassCode) -> Result<PassCode> {
        match self.challenge.take() {
            Some(ActiveChallenge::Qr(session)) => {
                self.verified = Some(Verified::Qr {
                    pass_code: pass_code.clone(),
                    grant: session.grant,
                });
                self.state = ProcedureState::Verified;
                Ok(pass_code)
            }
            other => {
                self.challenge = other;
                Err(self.invalid_state("poll_until_resolved"))
            }
        }
    }
}
