//! Authenticator: evaluates publish/read/API access requests against the
//! configured method (internal rule list, HTTP hook, or JWT).
//!
//! Passwords are verified with argon2 PHC-string hashing (off the hot path,
//! run synchronously) plus constant-time comparison via `subtle::ConstantTimeEq`
//! for every encoding. JWT verification fetches and caches a JWKS document,
//! verifies the token signature and expiry against it, then checks a
//! configured claim key for a permission list shaped like the internal rules.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::{Action, AuthMethod, AuthRule, PathmuxConfig};
use crate::error::{PathmuxError, PathmuxResult};

/// Everything the authorizer needs to know about one access attempt.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub action: Action,
    pub path: String,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub token: Option<String>,
    pub ip: Option<IpAddr>,
}

impl AuthRequest {
    pub fn new(action: Action, path: impl Into<String>) -> Self {
        Self {
            action,
            path: path.into(),
            user: None,
            pass: None,
            token: None,
            ip: None,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.pass = Some(pass.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }
}

/// Hashes a plaintext password into the `argon2:<phc-string>` format stored
/// in `authInternalUsers[].pass`. Mirrors `password.rs`'s parameter
/// choice (m=65536, t=3, p=4) but run synchronously: config loading and the
/// management API are not on a hot path, unlike a login request rate.
pub fn hash_password(plaintext: &str) -> PathmuxResult<String> {
    let salt = SaltString::generate(&mut argon2::password_hash::rand_core::OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(plaintext.as_bytes(), &salt)
        .map_err(|e| PathmuxError::ConfigInvalid(format!("hashing password: {e}")))?;
    Ok(format!("argon2:{hash}"))
}

/// Verifies `plaintext` against one of the three password encodings
/// `authInternalUsers[].pass` allows: a bare plaintext string,
/// `sha256:<base64(sha256(plaintext))>`, or `argon2:<phc-string>`.
pub fn verify_password(stored: &str, plaintext: &str) -> bool {
    if let Some(encoded) = stored.strip_prefix("sha256:") {
        let mut hasher = Sha256::new();
        hasher.update(plaintext.as_bytes());
        let digest = hasher.finalize();
        let expected = BASE64.encode(digest);
        return constant_time_eq(expected.as_bytes(), encoded.as_bytes());
    }
    if let Some(phc) = stored.strip_prefix("argon2:") {
        return match PasswordHash::new(phc) {
            Ok(parsed) => Argon2::default()
                .verify_password(plaintext.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        };
    }
    constant_time_eq(stored.as_bytes(), plaintext.as_bytes())
}

/// Constant-time byte comparison, used for every password and bearer-token
/// match so that verification time does not leak how many leading bytes
/// matched.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// JWKS cache entry: a fetched key set plus the instant it was fetched, so
/// `Authenticator` can refetch it periodically without hitting the network
/// on every request.
struct JwksCache {
    keys: JwkSet,
    fetched_at: Instant,
}

const JWKS_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct JwtClaims {
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// Evaluates access requests against the configured authentication method.
///
/// Built once at startup from a [`PathmuxConfig`] snapshot and shared across
/// every protocol handler; `ConfigWatcher` constructs a fresh instance on
/// every successful reload (cheaper than mutating rule tables in place, and
/// it keeps read access lock-free aside from the JWKS cache).
pub struct Authenticator {
    method: AuthMethod,
    rules: Vec<AuthRule>,
    http_address: Option<String>,
    jwt_jwks: Option<String>,
    jwt_claim_key: String,
    http_client: reqwest::Client,
    jwks_cache: RwLock<Option<JwksCache>>,
}

impl Authenticator {
    pub fn new(config: &PathmuxConfig) -> Self {
        let mut rules = config.auth_internal_users.clone();
        for (name, path) in &config.paths {
            // Synthesized rules are appended after explicit ones so an
            // operator's explicit authInternalUsers entries always win when
            // both match the same request.
            rules.extend(path.deprecated_credentials.synthesize(name));
        }
        Self {
            method: config.auth_method,
            rules,
            http_address: config.auth_http_address.clone(),
            jwt_jwks: config.auth_jwt_jwks.clone(),
            jwt_claim_key: config.auth_jwt_claim_key.clone(),
            http_client: reqwest::Client::new(),
            jwks_cache: RwLock::new(None),
        }
    }

    /// Authorizes one request, returning `Ok(())` on success or
    /// `Err(PathmuxError::AuthFailed)` with a human-readable reason.
    pub async fn authorize(&self, req: &AuthRequest) -> PathmuxResult<()> {
        match self.method {
            AuthMethod::Internal => self.authorize_internal(req),
            AuthMethod::Http => self.authorize_http(req).await,
            AuthMethod::Jwt => self.authorize_jwt(req).await,
        }
    }

    fn authorize_internal(&self, req: &AuthRequest) -> PathmuxResult<()> {
        let path_matcher = crate::path_manager::PathMatcher::new(&req.path);
        for rule in &self.rules {
            if rule.action != req.action {
                continue;
            }
            if !path_matcher.matches_pattern(&rule.path) {
                continue;
            }
            let user_ok = match &req.user {
                Some(user) => rule.user.matches(user),
                None => matches!(rule.user, crate::config::UserMatch::Any),
            };
            if !user_ok {
                continue;
            }
            if let Some(expected_pass) = &rule.pass {
                let given = req.pass.as_deref().unwrap_or("");
                if !verify_password(expected_pass, given) {
                    continue;
                }
            }
            if let Some(ip) = req.ip {
                if !rule.ip_allowed(ip) {
                    continue;
                }
            }
            return Ok(());
        }
        Err(PathmuxError::AuthFailed(format!(
            "no authInternalUsers rule permits {:?} on path {:?}",
            req.action, req.path
        )))
    }

    async fn authorize_http(&self, req: &AuthRequest) -> PathmuxResult<()> {
        let address = self.http_address.as_deref().ok_or_else(|| {
            PathmuxError::ConfigInvalid("authMethod is http but authHttpAddress is unset".into())
        })?;

        #[derive(serde::Serialize)]
        struct Body<'a> {
            ip: Option<String>,
            user: Option<&'a str>,
            password: Option<&'a str>,
            path: &'a str,
            action: &'static str,
        }

        let body = Body {
            ip: req.ip.map(|ip| ip.to_string()),
            user: req.user.as_deref(),
            password: req.pass.as_deref(),
            path: &req.path,
            action: action_name(req.action),
        };

        let response = self
            .http_client
            .post(address)
            .json(&body)
            .send()
            .await
            .map_err(|e| PathmuxError::AuthFailed(format!("auth HTTP hook unreachable: {e}")))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(PathmuxError::AuthFailed(format!(
                "auth HTTP hook rejected request with status {}",
                response.status()
            )))
        }
    }

    async fn authorize_jwt(&self, req: &AuthRequest) -> PathmuxResult<()> {
        let jwks_url = self.jwt_jwks.as_deref().ok_or_else(|| {
            PathmuxError::ConfigInvalid("authMethod is jwt but authJwtJwks is unset".into())
        })?;
        let token = req
            .token
            .as_deref()
            .ok_or_else(|| PathmuxError::AuthFailed("no bearer token supplied".into()))?;

        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| PathmuxError::AuthFailed(format!("malformed JWT header: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| PathmuxError::AuthFailed("JWT header has no kid".into()))?;

        let jwks = self.jwks_for(jwks_url).await?;
        let jwk = jwks
            .find(&kid)
            .ok_or_else(|| PathmuxError::AuthFailed(format!("no JWKS key matches kid {kid}")))?;
        let decoding_key = DecodingKey::from_jwk(jwk)
            .map_err(|e| PathmuxError::AuthFailed(format!("unusable JWKS key: {e}")))?;

        let mut validation = Validation::new(header.alg);
        validation.validate_exp = true;
        let claims = decode::<JwtClaims>(token, &decoding_key, &validation)
            .map_err(|e| PathmuxError::AuthFailed(format!("JWT verification failed: {e}")))?
            .claims;

        self.authorize_jwt_claims(req, &claims.extra)
    }

    fn authorize_jwt_claims(
        &self,
        req: &AuthRequest,
        claims: &serde_json::Map<String, serde_json::Value>,
    ) -> PathmuxResult<()> {
        let permissions = claims
            .get(&self.jwt_claim_key)
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                PathmuxError::AuthFailed(format!(
                    "JWT claims do not contain a {:?} array",
                    self.jwt_claim_key
                ))
            })?;

        let path_matcher = crate::path_manager::PathMatcher::new(&req.path);
        for permission in permissions {
            let Some(obj) = permission.as_object() else {
                continue;
            };
            let Some(action_str) = obj.get("action").and_then(|v| v.as_str()) else {
                continue;
            };
            if action_str != action_name(req.action) {
                continue;
            }
            let pattern = obj
                .get("path")
                .and_then(|v| v.as_str())
                .unwrap_or("~^.*$");
            if path_matcher.matches_pattern(pattern) {
                return Ok(());
            }
        }
        Err(PathmuxError::AuthFailed(format!(
            "no JWT permission entry allows {:?} on path {:?}",
            req.action, req.path
        )))
    }

    async fn jwks_for(&self, url: &str) -> PathmuxResult<JwkSet> {
        if let Some(cache) = self.jwks_cache.read().as_ref() {
            if cache.fetched_at.elapsed() < JWKS_CACHE_TTL {
                return Ok(cache.keys.clone());
            }
        }
        let keys: JwkSet = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| PathmuxError::AuthFailed(format!("fetching JWKS: {e}")))?
            .json()
            .await
            .map_err(|e| PathmuxError::AuthFailed(format!("parsing JWKS: {e}")))?;
        *self.jwks_cache.write() = Some(JwksCache {
            keys: keys.clone(),
            fetched_at: Instant::now(),
        });
        Ok(keys)
    }
}

fn action_name(action: Action) -> &'static str {
    match action {
        Action::Publish => "publish",
        Action::Read => "read",
        Action::Playback => "playback",
        Action::Api => "api",
        Action::Metrics => "metrics",
        Action::Pprof => "pprof",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserMatch;

    #[test]
    fn plaintext_password_matches_exactly() {
        assert!(verify_password("secret", "secret"));
        assert!(!verify_password("secret", "wrong"));
    }

    #[test]
    fn sha256_prefixed_password_verifies() {
        let mut hasher = Sha256::new();
        hasher.update(b"hunter2");
        let encoded = BASE64.encode(hasher.finalize());
        let stored = format!("sha256:{encoded}");
        assert!(verify_password(&stored, "hunter2"));
        assert!(!verify_password(&stored, "hunter3"));
    }

    #[test]
    fn argon2_roundtrips_through_hash_password() {
        let stored = hash_password("correct horse battery staple").unwrap();
        assert!(stored.starts_with("argon2:$argon2id"));
        assert!(verify_password(&stored, "correct horse battery staple"));
        assert!(!verify_password(&stored, "wrong"));
    }

    #[tokio::test]
    async fn internal_authorizer_permits_matching_rule() {
        let mut config = PathmuxConfig::default();
        config.auth_internal_users.push(AuthRule {
            user: UserMatch::Exact("alice".into()),
            pass: Some("secret".into()),
            ips: vec![],
            action: Action::Publish,
            path: "~^.*$".into(),
        });
        let auth = Authenticator::new(&config);
        let req = AuthRequest::new(Action::Publish, "cam1").with_credentials("alice", "secret");
        assert!(auth.authorize(&req).await.is_ok());
    }

    #[tokio::test]
    async fn internal_authorizer_rejects_wrong_password() {
        let mut config = PathmuxConfig::default();
        config.auth_internal_users.push(AuthRule {
            user: UserMatch::Exact("alice".into()),
            pass: Some("secret".into()),
            ips: vec![],
            action: Action::Publish,
            path: "~^.*$".into(),
        });
        let auth = Authenticator::new(&config);
        let req = AuthRequest::new(Action::Publish, "cam1").with_credentials("alice", "nope");
        assert!(auth.authorize(&req).await.is_err());
    }

    #[tokio::test]
    async fn deprecated_credentials_are_synthesized_into_rules() {
        let mut config = PathmuxConfig::default();
        config.paths.insert(
            "cam1".into(),
            crate::config::PathConfig {
                deprecated_credentials: crate::config::DeprecatedCredentials {
                    read_user: Some("bob".into()),
                    read_pass: Some("pw".into()),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let auth = Authenticator::new(&config);
        let req = AuthRequest::new(Action::Read, "cam1").with_credentials("bob", "pw");
        assert!(auth.authorize(&req).await.is_ok());
    }
}
