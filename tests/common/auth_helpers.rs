//! JWT helpers
//!
//! Tokens are unsigned: the client only reads the `exp` claim.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

pub fn token_expiring_at(exp: i64, subject: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload =
        URL_SAFE_NO_PAD.encode(serde_json::json!({ "sub": subject, "exp": exp }).to_string());
    format!("{}.{}.test-signature", header, payload)
}

/// Valid for an hour
pub fn valid_token(subject: &str) -> String {
    token_expiring_at(chrono::Utc::now().timestamp() + 3600, subject)
}

pub fn expired_token(subject: &str) -> String {
    token_expiring_at(chrono::Utc::now().timestamp() - 60, subject)
}
