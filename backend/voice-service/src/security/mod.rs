pub mod identity;
pub mod keyring;
pub mod session;

pub use identity::{unverified_email_claim, AppleIdentityVerifier, VerifiedIdentity};
pub use keyring::{KeyRing, SigningKey, SigningKeyStatus, KEY_UPDATES_CHANNEL};
pub use session::SessionTokenService;
