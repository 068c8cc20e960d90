// Digest authentication for RPC requests
//
// Auth-enabled devices answer an unsigned (or stale) request with a 401
// whose message is a JSON challenge carrying a fresh nonce. The client
// signs the retried request with a SHA-256 digest chain over the shared
// secret and that nonce.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// HTTP-style status code the device uses for an authentication challenge.
pub const AUTH_CHALLENGE_CODE: i64 = 401;

/// Offset applied to the client nonce when no challenge has been seen yet.
const UNCHALLENGED_NONCE_OFFSET: i64 = 1800;

const ALGORITHM: &str = "SHA-256";

/// Lowercase hex SHA-256 of a UTF-8 string.
pub fn hex_hash(message: &str) -> String {
    hex::encode(Sha256::digest(message.as_bytes()))
}

/// The fixed second half of the digest chain. The firmware does not bind
/// signatures to a method or URI over WebSocket, so both are placeholders.
fn ha2() -> String {
    hex_hash("dummy_method:dummy_uri")
}

// ── Challenge ────────────────────────────────────────────────────────

/// A decoded 401 challenge.
///
/// Arrives as a JSON string inside `error.message`, e.g.
/// `{"auth_type":"digest","nonce":1625038762,"nc":1,"realm":"shellypro1-abc","algorithm":"SHA-256"}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthChallenge {
    #[serde(default)]
    pub auth_type: Option<String>,
    pub nonce: i64,
    #[serde(default = "default_nc")]
    pub nc: u32,
    #[serde(default)]
    pub realm: Option<String>,
    #[serde(default)]
    pub algorithm: Option<String>,
}

fn default_nc() -> u32 {
    1
}

impl AuthChallenge {
    /// Parse the `message` field of a 401 error object.
    pub fn parse(message: &str) -> Result<Self, Error> {
        serde_json::from_str(message).map_err(|e| Error::InvalidAuth {
            message: format!("unreadable auth challenge ({e}): {message}"),
        })
    }
}

// ── Signed fields ────────────────────────────────────────────────────

/// The `auth` object attached to an outgoing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthFields {
    pub realm: String,
    pub username: String,
    pub nonce: i64,
    pub cnonce: i64,
    pub response: String,
    pub algorithm: String,
}

// ── AuthData ─────────────────────────────────────────────────────────

/// Credential-derived signing key for one session.
///
/// Only `ha1` is retained; the plaintext password is hashed at
/// construction and never stored.
#[derive(Clone)]
pub struct AuthData {
    realm: String,
    username: String,
    ha1: String,
}

impl std::fmt::Debug for AuthData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthData")
            .field("realm", &self.realm)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl AuthData {
    pub fn new(realm: &str, username: &str, password: &SecretString) -> Self {
        let ha1 = hex_hash(&format!(
            "{username}:{realm}:{}",
            password.expose_secret()
        ));
        Self {
            realm: realm.to_owned(),
            username: username.to_owned(),
            ha1,
        }
    }

    /// Sign with an explicit nonce and client nonce.
    pub fn sign_with(&self, nonce: i64, nc: u32, cnonce: i64) -> AuthFields {
        let response = hex_hash(&format!(
            "{}:{nonce}:{nc}:{cnonce}:auth:{}",
            self.ha1,
            ha2()
        ));
        AuthFields {
            realm: self.realm.clone(),
            username: self.username.clone(),
            nonce,
            cnonce,
            response,
            algorithm: ALGORITHM.to_owned(),
        }
    }

    /// Sign in answer to a device challenge, using the current time as cnonce.
    pub fn answer(&self, challenge: &AuthChallenge) -> AuthFields {
        self.sign_with(challenge.nonce, challenge.nc, unix_now())
    }

    /// Pre-sign a request before any challenge has been seen.
    ///
    /// The nonce is deliberately stale so the device replies with a fresh
    /// challenge unless it accepts it outright.
    pub fn presign(&self) -> AuthFields {
        let cnonce = unix_now();
        self.sign_with(cnonce - UNCHALLENGED_NONCE_OFFSET, 1, cnonce)
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_owned())
    }

    #[test]
    fn hex_hash_is_lowercase_sha256() {
        assert_eq!(
            hex_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn response_chains_ha1_and_ha2() {
        let auth = AuthData::new("shellypro1-abc", "admin", &secret("pw"));
        let fields = auth.sign_with(1_625_038_762, 1, 1_625_038_800);

        let ha1 = hex_hash("admin:shellypro1-abc:pw");
        let ha2 = hex_hash("dummy_method:dummy_uri");
        let expected = hex_hash(&format!("{ha1}:1625038762:1:1625038800:auth:{ha2}"));

        assert_eq!(fields.response, expected);
        assert_eq!(fields.realm, "shellypro1-abc");
        assert_eq!(fields.username, "admin");
        assert_eq!(fields.algorithm, "SHA-256");
    }

    #[test]
    fn different_passwords_give_different_responses() {
        let a = AuthData::new("r", "admin", &secret("one")).sign_with(5, 1, 9);
        let b = AuthData::new("r", "admin", &secret("two")).sign_with(5, 1, 9);
        assert_ne!(a.response, b.response);
    }

    #[test]
    fn presign_uses_stale_nonce() {
        let fields = AuthData::new("r", "admin", &secret("pw")).presign();
        assert_eq!(fields.cnonce - fields.nonce, UNCHALLENGED_NONCE_OFFSET);
    }

    #[test]
    fn answer_uses_challenge_nonce() {
        let auth = AuthData::new("r", "admin", &secret("pw"));
        let challenge = AuthChallenge::parse(
            r#"{"auth_type":"digest","nonce":1700000000,"nc":3,"realm":"r","algorithm":"SHA-256"}"#,
        )
        .unwrap();

        let fields = auth.answer(&challenge);
        assert_eq!(fields.nonce, 1_700_000_000);
        assert_eq!(fields.response, auth.sign_with(1_700_000_000, 3, fields.cnonce).response);
    }

    #[test]
    fn challenge_nc_defaults_to_one() {
        let challenge = AuthChallenge::parse(r#"{"nonce":42}"#).unwrap();
        assert_eq!(challenge.nc, 1);
        assert!(challenge.realm.is_none());
    }

    #[test]
    fn garbage_challenge_is_invalid_auth() {
        let err = AuthChallenge::parse("not json").unwrap_err();
        assert!(err.is_auth());
    }

    #[test]
    fn debug_does_not_leak_key() {
        let auth = AuthData::new("r", "admin", &secret("hunter2"));
        let printed = format!("{auth:?}");
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains(&hex_hash("admin:r:hunter2")));
    }
}
