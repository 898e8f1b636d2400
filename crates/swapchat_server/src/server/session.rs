#![forbid(unsafe_code)]

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use swapchat_domain::{ChatError, Principal, SecretString};

use crate::util::time::unix_secs_now;

const TOKEN_VERSION: &str = "v1";

/// Default lifetime of issued tokens.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// Resolves a credential into an authenticated principal.
#[async_trait::async_trait]
pub trait SessionResolver: Send + Sync {
	async fn resolve(&self, credential: &SecretString) -> Result<Principal, ChatError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &SecretString) -> HmacSha256 {
	HmacSha256::new_from_slice(secret.expose().as_bytes()).expect("hmac accepts keys of any length")
}

/// Mint `v1.<claims>.<sig>` for `principal`, valid for `ttl` from `now_secs`.
pub fn issue_token(principal: &Principal, ttl: Duration, secret: &SecretString, now_secs: u64) -> String {
	let claims = AuthClaims {
		sub: principal.as_str().to_string(),
		exp: now_secs.saturating_add(ttl.as_secs()),
	};
	let payload = serde_json::to_vec(&claims).unwrap_or_default();
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);

	let mut mac = mac(secret);
	mac.update(payload_b64.as_bytes());
	let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

	format!("{TOKEN_VERSION}.{payload_b64}.{sig_b64}")
}

/// Verify signature and expiry.
pub fn verify_token(token: &str, secret: &SecretString, now_secs: u64) -> Result<AuthClaims, ChatError> {
	let auth = |msg: &str| ChatError::Authentication(msg.to_string());

	let mut parts = token.trim().split('.');
	let (Some(version), Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next(), parts.next())
	else {
		return Err(auth("invalid token format"));
	};
	if version != TOKEN_VERSION {
		return Err(auth("unsupported token version"));
	}

	let provided_sig = URL_SAFE_NO_PAD
		.decode(sig_b64)
		.map_err(|_| auth("malformed token signature"))?;

	let mut mac = mac(secret);
	mac.update(payload_b64.as_bytes());
	mac.verify_slice(&provided_sig)
		.map_err(|_| auth("invalid token signature"))?;

	let payload = URL_SAFE_NO_PAD
		.decode(payload_b64)
		.map_err(|_| auth("malformed token payload"))?;
	let claims: AuthClaims = serde_json::from_slice(&payload).map_err(|_| auth("malformed token claims"))?;

	if claims.exp <= now_secs {
		return Err(auth("token expired"));
	}

	Ok(claims)
}

/// Stateless HMAC-SHA256 session tokens.
#[derive(Debug, Clone)]
pub struct HmacSessionResolver {
	secret: SecretString,
}

impl HmacSessionResolver {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}

	pub fn issue(&self, principal: &Principal, ttl: Duration) -> String {
		issue_token(principal, ttl, &self.secret, unix_secs_now())
	}
}

#[async_trait::async_trait]
impl SessionResolver for HmacSessionResolver {
	async fn resolve(&self, credential: &SecretString) -> Result<Principal, ChatError> {
		let claims = verify_token(credential.expose(), &self.secret, unix_secs_now())?;
		Principal::new(claims.sub).map_err(|e| ChatError::Authentication(format!("invalid subject: {e}")))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const NOW: u64 = 1_700_000_000;

	fn secret() -> SecretString {
		SecretString::new("test-secret")
	}

	fn alice() -> Principal {
		Principal::new("alice").expect("principal")
	}

	#[test]
	fn issued_token_verifies_until_expiry() {
		let token = issue_token(&alice(), Duration::from_secs(60), &secret(), NOW);

		let claims = verify_token(&token, &secret(), NOW + 59).expect("valid");
		assert_eq!(claims.sub, "alice");

		let err = verify_token(&token, &secret(), NOW + 60).unwrap_err();
		assert_eq!(err, ChatError::Authentication("token expired".to_string()));
	}

	#[test]
	fn token_signed_with_another_secret_is_rejected() {
		let token = issue_token(&alice(), Duration::from_secs(60), &SecretString::new("other"), NOW);
		let err = verify_token(&token, &secret(), NOW).unwrap_err();
		assert_eq!(err.code(), "AUTHENTICATION");
	}

	#[test]
	fn tampered_claims_are_rejected() {
		let token = issue_token(&alice(), Duration::from_secs(60), &secret(), NOW);
		let forged = URL_SAFE_NO_PAD.encode(br#"{"sub":"mallory","exp":9999999999}"#);
		let mut parts: Vec<&str> = token.split('.').collect();
		parts[1] = &forged;

		assert!(verify_token(&parts.join("."), &secret(), NOW).is_err());
	}

	#[test]
	fn malformed_tokens_are_rejected() {
		for bad in ["", "v1", "v1.a", "v1.a.b.c", "v2.a.b", "v1.!!!.???"] {
			assert!(verify_token(bad, &secret(), NOW).is_err(), "accepted {bad:?}");
		}
	}

	#[tokio::test]
	async fn resolver_maps_subject_to_principal() {
		let resolver = HmacSessionResolver::new(secret());
		let token = resolver.issue(&alice(), DEFAULT_TOKEN_TTL);
		let principal = resolver.resolve(&SecretString::new(token)).await.expect("resolve");
		assert_eq!(principal, alice());
	}
}
