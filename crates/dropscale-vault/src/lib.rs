//! dropscale-vault — secure introduction for new workers.
//!
//! Each new worker receives a wrapped credential: a token redeemable
//! exactly once, only from the worker's own IP addresses, within a
//! short TTL. [`issuer`] talks to the credential service;
//! [`binder`] decides how the credential reaches the worker (baked
//! into user-data when the address is known before boot, delivered
//! through a provider tag otherwise).

pub mod binder;
pub mod issuer;

pub use binder::{BindError, IntroductionBinder, IntroductionConfig};
pub use issuer::{IssueError, MockIssuer, SecretIssuer, VaultIssuer};

/// Replace every character outside the provider's tag alphabet
/// (`[A-Za-z0-9_:-]`) with an underscore.
///
/// Wrapped tokens are minted by an external service and may contain
/// characters the provider rejects in tag names; both the mock issuer
/// and the tag-channel binder squash them before use.
pub fn tag_safe(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
