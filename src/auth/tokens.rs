use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::auth::Role;

type HmacSha256 = Hmac<Sha256>;

/// Clock skew tolerated when checking expiry.
const EXPIRY_LEEWAY_SECONDS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub role: Role,
    pub kind: TokenKind,
    pub iat: i64,
    pub exp: i64,
}

/// HMAC-SHA256 signed bearer tokens: `base64url(claims_json).base64url(mac)`.
/// Tokens are stateless; a token stays valid until its embedded expiry.
#[derive(Debug, Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
    access_ttl: ChronoDuration,
    refresh_ttl: ChronoDuration,
}

impl TokenSigner {
    pub fn new(secret: &str, access_token_minutes: i64, refresh_token_days: i64) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            access_ttl: ChronoDuration::minutes(access_token_minutes),
            refresh_ttl: ChronoDuration::days(refresh_token_days),
        }
    }

    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl.num_seconds()
    }

    pub fn issue(&self, sub: Uuid, username: &str, role: Role, kind: TokenKind) -> String {
        self.issue_at(sub, username, role, kind, Utc::now())
    }

    fn issue_at(
        &self,
        sub: Uuid,
        username: &str,
        role: Role,
        kind: TokenKind,
        now: DateTime<Utc>,
    ) -> String {
        let ttl = match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };
        let claims = Claims {
            sub,
            username: username.to_string(),
            role,
            kind,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        self.sign(&claims)
    }

    fn sign(&self, claims: &Claims) -> String {
        let payload = serde_json::to_vec(claims).expect("claims serialize");
        let encoded = URL_SAFE_NO_PAD.encode(&payload);
        let mac = self.mac(encoded.as_bytes());
        format!("{encoded}.{}", URL_SAFE_NO_PAD.encode(mac))
    }

    pub fn verify(&self, token: &str) -> Option<Claims> {
        self.verify_at(token, Utc::now())
    }

    fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Option<Claims> {
        let (payload_b64, sig_b64) = token.trim().split_once('.')?;
        let presented = URL_SAFE_NO_PAD.decode(sig_b64).ok()?;
        let expected = self.mac(payload_b64.as_bytes());
        if !bool::from(expected.ct_eq(presented.as_slice())) {
            return None;
        }
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let claims: Claims = serde_json::from_slice(&payload).ok()?;
        if claims.exp + EXPIRY_LEEWAY_SECONDS <= now.timestamp() {
            return None;
        }
        Some(claims)
    }

    fn mac(&self, data: &[u8]) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new("0123456789abcdef0123456789abcdef", 30, 7)
    }

    #[test]
    fn round_trip_preserves_claims() {
        let signer = signer();
        let sub = Uuid::new_v4();
        let token = signer.issue(sub, "admin", Role::Admin, TokenKind::Access);
        let claims = signer.verify(&token).expect("valid token");
        assert_eq!(claims.sub, sub);
        assert_eq!(claims.username, "admin");
        assert_eq!(claims.role, Role::Admin);
        assert_eq!(claims.kind, TokenKind::Access);
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let signer = signer();
        let token = signer.issue(Uuid::new_v4(), "viewer", Role::Viewer, TokenKind::Access);
        let (payload, sig) = token.split_once('.').unwrap();
        let mut forged_claims: Claims = serde_json::from_slice(
            &URL_SAFE_NO_PAD.decode(payload).unwrap(),
        )
        .unwrap();
        forged_claims.role = Role::Admin;
        let forged_payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap());
        assert!(signer.verify(&format!("{forged_payload}.{sig}")).is_none());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = signer().issue(Uuid::new_v4(), "eng", Role::Engineer, TokenKind::Refresh);
        let other = TokenSigner::new("ffffffffffffffffffffffffffffffff", 30, 7);
        assert!(other.verify(&token).is_none());
    }

    #[test]
    fn expired_token_is_rejected_but_leeway_holds() {
        let signer = signer();
        let now = Utc::now();
        let token = signer.issue_at(Uuid::new_v4(), "eng", Role::Engineer, TokenKind::Access, now);

        let just_inside = now + ChronoDuration::minutes(30) + ChronoDuration::seconds(20);
        assert!(signer.verify_at(&token, just_inside).is_some());

        let past_leeway = now + ChronoDuration::minutes(30) + ChronoDuration::seconds(40);
        assert!(signer.verify_at(&token, past_leeway).is_none());
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        let signer = signer();
        assert!(signer.verify("").is_none());
        assert!(signer.verify("abc").is_none());
        assert!(signer.verify("abc.def").is_none());
    }
}
