pub mod quota;
pub mod subscription;

pub use quota::QuotaGate;
pub use subscription::{Entitlement, EntitlementChecker, HttpEntitlementChecker};
