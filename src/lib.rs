#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

/// Version of the ustb-sso library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod catalog;
pub mod errors;
pub mod http;
pub mod platform;
pub mod procedure;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod utils;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Re-export commonly used items
pub use catalog::{AuthMethodCatalog, AuthMethodDescriptor, MethodKind};
pub use errors::{AuthError, TransportError};
pub use http::{HttpSession, ReqwestSession};
pub use platform::{prefabs, PlatformRegistration, SuccessCriteria};
pub use procedure::qr::{QrChallenge, QrStatus};
pub use procedure::sms::SmsChallenge;
pub use procedure::{AuthProcedure, PassCode, ProcedureState, SmsToken, VerificationToken};
pub use session::{AuthResult, AuthSession};
pub use settings::SsoSettings;
