//! Worker authentication: pre-shared token or HMAC challenge/response,
//! plus per-worker token issuance for reconnects.

use cyxmake_protocol::auth::{compute_hmac, constant_time_eq, generate_nonce, generate_token};
use cyxmake_protocol::AuthMethod;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use uuid::Uuid;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub method: AuthMethod,
    /// Pre-shared secret: the token itself in token mode, the HMAC key in
    /// challenge mode.
    pub secret: String,
    /// Lifetime of issued per-worker tokens; `None` means no expiry.
    pub token_ttl_secs: Option<u64>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            method: AuthMethod::Token,
            secret: String::new(),
            token_ttl_secs: None,
        }
    }
}

struct IssuedToken {
    worker_id: Uuid,
    expires_at_ms: Option<u64>,
}

pub struct Authenticator {
    config: AuthConfig,
    issued: Mutex<HashMap<String, IssuedToken>>,
}

impl Authenticator {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            issued: Mutex::new(HashMap::new()),
        }
    }

    pub fn method(&self) -> AuthMethod {
        self.config.method
    }

    /// Pre-shared token check. An empty configured secret disables auth
    /// entirely (development mode).
    pub fn verify_preshared(&self, presented: Option<&str>) -> bool {
        if self.config.secret.is_empty() {
            return true;
        }
        match presented {
            Some(token) => {
                constant_time_eq(token, &self.config.secret) || self.validate_issued(token)
            }
            None => false,
        }
    }

    pub fn new_challenge(&self) -> String {
        generate_nonce()
    }

    /// Validate an AUTH_RESPONSE against the nonce we issued.
    pub fn verify_challenge(&self, nonce: &str, hmac_hex: Option<&str>) -> bool {
        match hmac_hex {
            Some(presented) => {
                let expected = compute_hmac(&self.config.secret, nonce);
                constant_time_eq(presented, &expected)
            }
            None => false,
        }
    }

    /// Issue a bearer token the worker may present on reconnect.
    pub fn issue_token(&self, worker_id: Uuid) -> (String, Option<u64>) {
        let token = generate_token();
        let expires_at_ms = self.config.token_ttl_secs.map(|ttl| now_ms() + ttl * 1000);
        self.issued.lock().unwrap().insert(
            token.clone(),
            IssuedToken {
                worker_id,
                expires_at_ms,
            },
        );
        debug!("issued token for worker {}", worker_id);
        (token, expires_at_ms)
    }

    /// True when `token` was issued by us and has not expired. Expired
    /// tokens are dropped on sight.
    pub fn validate_issued(&self, token: &str) -> bool {
        let mut issued = self.issued.lock().unwrap();
        match issued.get(token) {
            Some(record) => {
                let expired = record
                    .expires_at_ms
                    .map(|at| now_ms() >= at)
                    .unwrap_or(false);
                if expired {
                    issued.remove(token);
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    pub fn revoke_worker(&self, worker_id: Uuid) {
        self.issued
            .lock()
            .unwrap()
            .retain(|_, record| record.worker_id != worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator(method: AuthMethod, secret: &str) -> Authenticator {
        Authenticator::new(AuthConfig {
            method,
            secret: secret.to_string(),
            token_ttl_secs: None,
        })
    }

    #[test]
    fn test_preshared_token() {
        let auth = authenticator(AuthMethod::Token, "s3cret");
        assert!(auth.verify_preshared(Some("s3cret")));
        assert!(!auth.verify_preshared(Some("wrong")));
        assert!(!auth.verify_preshared(None));
    }

    #[test]
    fn test_empty_secret_accepts_anyone() {
        let auth = authenticator(AuthMethod::Token, "");
        assert!(auth.verify_preshared(None));
        assert!(auth.verify_preshared(Some("anything")));
    }

    #[test]
    fn test_challenge_roundtrip() {
        let auth = authenticator(AuthMethod::Challenge, "hmac-key");
        let nonce = auth.new_challenge();
        let answer = compute_hmac("hmac-key", &nonce);
        assert!(auth.verify_challenge(&nonce, Some(&answer)));
        assert!(!auth.verify_challenge(&nonce, Some("deadbeef")));
        assert!(!auth.verify_challenge(&nonce, None));

        // Answer computed with the wrong key fails.
        let wrong = compute_hmac("other-key", &nonce);
        assert!(!auth.verify_challenge(&nonce, Some(&wrong)));
    }

    #[test]
    fn test_issued_tokens_validate_and_revoke() {
        let auth = authenticator(AuthMethod::Token, "s3cret");
        let worker = Uuid::new_v4();
        let (token, expires) = auth.issue_token(worker);
        assert!(expires.is_none());
        assert!(auth.validate_issued(&token));
        // Issued tokens also pass the pre-shared gate on reconnect.
        assert!(auth.verify_preshared(Some(&token)));

        auth.revoke_worker(worker);
        assert!(!auth.validate_issued(&token));
    }

    #[test]
    fn test_token_ttl_expiry() {
        let auth = Authenticator::new(AuthConfig {
            method: AuthMethod::Token,
            secret: "s".to_string(),
            token_ttl_secs: Some(0),
        });
        let (token, expires) = auth.issue_token(Uuid::new_v4());
        assert!(expires.is_some());
        assert!(!auth.validate_issued(&token));
    }
}
