//! SMS login flow against the scripted provider

use std::time::Duration;

use serde_json::json;
use ustb_sso::http::{HttpMethod, RequestBody};
use ustb_sso::testing::constants::paths;
use ustb_sso::testing::{ScriptedHttpSession, StubResponse, TestFixtures};
use ustb_sso::{AuthError, AuthProcedure, MethodKind, ProcedureState, SmsToken};

const PHONE: &str = TestFixtures::PHONE;

async fn sms_selected(provider: ScriptedHttpSession) -> AuthProcedure<ScriptedHttpSession> {
    let mut procedure = TestFixtures::procedure(provider);
    procedure.open().await.unwrap();
    procedure.select_method(MethodKind::Sms).unwrap();
    procedure
}

fn rejecting_codes() -> ScriptedHttpSession {
    let provider = TestFixtures::provider();
    provider.replace(
        HttpMethod::Post,
        paths::AUTH_EXECUTE,
        vec![TestFixtures::sms_rejected()],
    );
    provider
}

#[tokio::test(start_paused = true)]
async fn test_sms_login_end_to_end() {
    let mut procedure = sms_selected(TestFixtures::provider()).await;

    assert!(procedure.check_eligible(PHONE).await.unwrap());
    let challenge = procedure.send_code(PHONE).await.unwrap();
    assert_eq!(challenge.phone_number, PHONE);
    assert_eq!(challenge.attempts, 0);
    assert!(challenge.verification_token.is_none());
    assert_eq!(procedure.state(), ProcedureState::Challenged);

    let token = procedure.submit_code(&challenge, "123456").await.unwrap();
    assert_eq!(token.as_str(), TestFixtures::LOGIN_TOKEN);
    assert_eq!(procedure.state(), ProcedureState::Verified);
    assert!(procedure.sms_challenge().is_none());

    let result = procedure.complete(token).await.unwrap();
    assert_eq!(procedure.state(), ProcedureState::Completed);
    assert_eq!(result.final_url.as_str(), TestFixtures::PLATFORM_HOME);
    assert!(result.satisfies(procedure.platform()));

    // The provider page redirected from script to the platform callback
    let callback = procedure
        .http()
        .last_request(HttpMethod::Get, paths::PLATFORM_CALLBACK)
        .unwrap();
    assert_eq!(callback.query_value("ticket").as_deref(), Some("ST-1"));

    let engine = procedure
        .http()
        .last_request(HttpMethod::Post, paths::AUTHN_ENGINE)
        .unwrap();
    assert_eq!(
        engine.body_value("loginToken").as_deref(),
        Some(TestFixtures::LOGIN_TOKEN)
    );
}

#[tokio::test(start_paused = true)]
async fn test_submit_code_request_shape() {
    let mut procedure = sms_selected(TestFixtures::provider()).await;
    let challenge = procedure.send_code(PHONE).await.unwrap();
    procedure.submit_code(&challenge, "654321").await.unwrap();

    let request = procedure
        .http()
        .last_request(HttpMethod::Post, paths::AUTH_EXECUTE)
        .unwrap();
    let RequestBody::Json(body) = request.body else {
        panic!("authExecute must send JSON");
    };
    assert_eq!(body["authModuleCode"], "userAndSms");
    assert_eq!(body["authChainCode"], "userAndSms-chain");
    assert_eq!(body["entityId"], TestFixtures::SERVICE_ID);
    assert_eq!(body["requestType"], "chain_type");
    assert_eq!(body["lck"], TestFixtures::LCK);
    assert_eq!(body["authPara"]["loginName"], PHONE);
    assert_eq!(body["authPara"]["smsCode"], "654321");
}

#[tokio::test]
async fn test_unknown_number_is_not_eligible() {
    let provider = TestFixtures::provider();
    provider.replace(
        HttpMethod::Post,
        paths::SMS_CHECK,
        vec![StubResponse::json(
            &json!({ "code": "E1002", "message": "user not found" }),
        )],
    );
    let mut procedure = TestFixtures::procedure(provider);
    procedure.open().await.unwrap();

    assert!(!procedure.check_eligible("10000000000").await.unwrap());
    assert_eq!(procedure.state(), ProcedureState::Opened);
}

#[tokio::test]
async fn test_unavailable_number_is_not_eligible() {
    let provider = TestFixtures::provider();
    provider.replace(
        HttpMethod::Post,
        paths::SMS_CHECK,
        vec![StubResponse::json(
            &json!({ "code": "200", "data": { "available": false } }),
        )],
    );
    let mut procedure = TestFixtures::procedure(provider);
    procedure.open().await.unwrap();

    assert!(!procedure.check_eligible(PHONE).await.unwrap());
}

#[tokio::test]
async fn test_eligibility_without_sms_method() {
    let provider = TestFixtures::provider();
    provider.replace(
        HttpMethod::Post,
        paths::QUERY_AUTH_METHODS,
        vec![TestFixtures::catalog(&[("microQr", "微信扫码", true)])],
    );
    let mut procedure = TestFixtures::procedure(provider);
    procedure.open().await.unwrap();

    let err = procedure.check_eligible(PHONE).await.unwrap_err();
    assert!(matches!(err, AuthError::MethodUnavailable(MethodKind::Sms)));
    assert_eq!(procedure.state(), ProcedureState::Opened);
    assert_eq!(procedure.http().count(HttpMethod::Post, paths::SMS_CHECK), 0);
}

#[tokio::test(start_paused = true)]
async fn test_eligibility_with_qr_selected_and_no_sms_offered() {
    let provider = TestFixtures::provider();
    provider.replace(
        HttpMethod::Post,
        paths::QUERY_AUTH_METHODS,
        vec![TestFixtures::catalog(&[("microQr", "微信扫码", true)])],
    );
    let mut procedure = TestFixtures::procedure(provider);
    procedure.open().await.unwrap();
    procedure.select_method(MethodKind::Qr).unwrap();

    let err = procedure.check_eligible(PHONE).await.unwrap_err();
    assert!(matches!(err, AuthError::MethodUnavailable(MethodKind::Sms)));
    assert_eq!(procedure.state(), ProcedureState::MethodSelected);
    assert_eq!(procedure.http().count(HttpMethod::Post, paths::SMS_CHECK), 0);
}

#[tokio::test(start_paused = true)]
async fn test_resend_within_interval_is_rate_limited() {
    let mut procedure = sms_selected(TestFixtures::provider()).await;
    procedure.send_code(PHONE).await.unwrap();

    tokio::time::advance(Duration::from_secs(10)).await;
    let err = procedure.send_code(PHONE).await.unwrap_err();
    match err {
        AuthError::RateLimited { retry_after } => {
            assert!(retry_after <= Duration::from_secs(50));
            assert!(retry_after > Duration::from_secs(49));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(procedure.state(), ProcedureState::Challenged);
    assert_eq!(procedure.http().count(HttpMethod::Post, paths::SMS_SEND), 1);

    tokio::time::advance(Duration::from_secs(51)).await;
    let resent = procedure.send_code(PHONE).await.unwrap();
    assert_eq!(resent.attempts, 0);
    assert_eq!(procedure.http().count(HttpMethod::Post, paths::SMS_SEND), 2);
}

#[tokio::test(start_paused = true)]
async fn test_resend_interval_is_tracked_per_number() {
    const OTHER_PHONE: &str = "13900002222";
    let mut procedure = sms_selected(rejecting_codes()).await;

    for phone in [PHONE, OTHER_PHONE] {
        let challenge = procedure.send_code(phone).await.unwrap();
        for _ in 0..3 {
            procedure.submit_code(&challenge, "000000").await.unwrap_err();
        }
        let err = procedure.submit_code(&challenge, "000000").await.unwrap_err();
        assert!(matches!(err, AuthError::CodeExhausted { .. }));
        assert_eq!(procedure.state(), ProcedureState::MethodSelected);
    }

    // Sending to the second number must not reset the first number's window
    let err = procedure.send_code(PHONE).await.unwrap_err();
    assert!(matches!(err, AuthError::RateLimited { .. }));
    assert_eq!(procedure.state(), ProcedureState::MethodSelected);
    assert_eq!(procedure.http().count(HttpMethod::Post, paths::SMS_SEND), 2);

    tokio::time::advance(Duration::from_secs(61)).await;
    let resent = procedure.send_code(PHONE).await.unwrap();
    assert_eq!(resent.phone_number, PHONE);
    assert_eq!(procedure.http().count(HttpMethod::Post, paths::SMS_SEND), 3);
}

#[tokio::test(start_paused = true)]
async fn test_provider_throttling_is_rate_limited() {
    let provider = TestFixtures::provider();
    provider.replace(
        HttpMethod::Post,
        paths::SMS_SEND,
        vec![StubResponse::json(&json!({ "code": 429, "message": "too many requests" }))],
    );
    let mut procedure = sms_selected(provider).await;

    let err = procedure.send_code(PHONE).await.unwrap_err();
    assert!(matches!(err, AuthError::RateLimited { .. }));
    assert_eq!(procedure.state(), ProcedureState::MethodSelected);
}

#[tokio::test(start_paused = true)]
async fn test_different_number_while_pending_is_invalid() {
    let mut procedure = sms_selected(TestFixtures::provider()).await;
    procedure.send_code(PHONE).await.unwrap();

    let err = procedure.send_code("13900002222").await.unwrap_err();
    assert!(matches!(
        err,
        AuthError::InvalidState { operation: "send_code", state: ProcedureState::Challenged }
    ));
    assert_eq!(procedure.http().count(HttpMethod::Post, paths::SMS_SEND), 1);
}

#[tokio::test(start_paused = true)]
async fn test_wrong_codes_exhaust_attempts() {
    let mut procedure = sms_selected(rejecting_codes()).await;
    let challenge = procedure.send_code(PHONE).await.unwrap();

    for expected in 1..=3 {
        let err = procedure.submit_code(&challenge, "000000").await.unwrap_err();
        match err {
            AuthError::CodeIncorrect {
                attempts,
                max_attempts,
            } => {
                assert_eq!(attempts, expected);
                assert_eq!(max_attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(procedure.state(), ProcedureState::Challenged);
        assert_eq!(procedure.sms_challenge().unwrap().attempts, expected);
    }

    let err = procedure.submit_code(&challenge, "000000").await.unwrap_err();
    assert!(matches!(err, AuthError::CodeExhausted { attempts: 3 }));
    assert_eq!(procedure.state(), ProcedureState::MethodSelected);
    assert!(procedure.sms_challenge().is_none());
    assert_eq!(procedure.http().count(HttpMethod::Post, paths::AUTH_EXECUTE), 3);

    // The old challenge is gone; a new code must be sent
    let err = procedure.submit_code(&challenge, "123456").await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidState { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_provider_exhaustion_discards_challenge() {
    let provider = TestFixtures::provider();
    provider.replace(
        HttpMethod::Post,
        paths::AUTH_EXECUTE,
        vec![StubResponse::json(&json!({ "code": "403", "message": "locked" }))],
    );
    let mut procedure = sms_selected(provider).await;
    let challenge = procedure.send_code(PHONE).await.unwrap();

    let err = procedure.submit_code(&challenge, "000000").await.unwrap_err();
    assert!(matches!(err, AuthError::CodeExhausted { attempts: 1 }));
    assert_eq!(procedure.state(), ProcedureState::MethodSelected);
}

#[tokio::test(start_paused = true)]
async fn test_code_accepted_after_wrong_attempt() {
    let provider = TestFixtures::provider();
    provider.replace(
        HttpMethod::Post,
        paths::AUTH_EXECUTE,
        vec![
            TestFixtures::sms_rejected(),
            StubResponse::json(&json!({
                "code": "200",
                "data": { "loginToken": TestFixtures::LOGIN_TOKEN }
            })),
        ],
    );
    let mut procedure = sms_selected(provider).await;
    let challenge = procedure.send_code(PHONE).await.unwrap();

    assert!(matches!(
        procedure.submit_code(&challenge, "111111").await,
        Err(AuthError::CodeIncorrect { attempts: 1, .. })
    ));
    let token = procedure.submit_code(&challenge, "222222").await.unwrap();
    assert_eq!(token, SmsToken::new(TestFixtures::LOGIN_TOKEN));
}

#[tokio::test(start_paused = true)]
async fn test_stale_challenge_after_resend_is_invalid() {
    let mut procedure = sms_selected(TestFixtures::provider()).await;
    let first = procedure.send_code(PHONE).await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    let second = procedure.send_code(PHONE).await.unwrap();

    let err = procedure.submit_code(&first, "123456").await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidState { operation: "submit_code", .. }));
    assert!(procedure.submit_code(&second, "123456").await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_send_code_requires_sms_selection() {
    let mut procedure = TestFixtures::procedure(TestFixtures::provider());
    procedure.open().await.unwrap();
    procedure.select_method(MethodKind::Qr).unwrap();

    let err = procedure.send_code(PHONE).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidState { operation: "send_code", .. }));

    // Switching methods is allowed before any challenge is issued
    procedure.select_method(MethodKind::Sms).unwrap();
    assert!(procedure.send_code(PHONE).await.is_ok());
    assert!(matches!(
        procedure.select_method(MethodKind::Qr),
        Err(AuthError::InvalidState { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_sms_send_transport_failure_fails_procedure() {
    let provider = TestFixtures::provider();
    provider.fail(
        HttpMethod::Post,
        paths::SMS_SEND,
        std::io::ErrorKind::TimedOut,
    );
    let mut procedure = sms_selected(provider).await;

    let err = procedure.send_code(PHONE).await.unwrap_err();
    assert!(matches!(err, AuthError::Transport(_)));
    assert!(err.is_terminal());
    assert_eq!(procedure.state(), ProcedureState::Failed);
    assert!(matches!(
        procedure.check_eligible(PHONE).await,
        Err(AuthError::InvalidState { state: ProcedureState::Failed, .. })
    ));
}
