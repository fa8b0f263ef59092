//! Identity Boundary
//!
//! Binds a connection to a player. With a verification key configured the
//! `auth` message must carry a JWT from an external identity provider and
//! the identity comes from its claims. Without one the server runs in
//! development mode and trusts the asserted id and name.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::game::state::PlayerId;
use crate::network::protocol::{AuthRequest, ErrorCode};

/// Token validation settings.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format.
    pub public_key_pem: Option<String>,
    /// HS256 shared secret.
    pub secret: Option<String>,
    /// Skip expiry checks (tests only).
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Read `QUADPONG_AUTH_*` environment variables.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(format!("QUADPONG_AUTH_{name}")).ok();
        Self {
            issuer: var("ISSUER"),
            audience: var("AUDIENCE"),
            public_key_pem: var("PUBLIC_KEY_PEM"),
            secret: var("SECRET"),
            skip_expiry: var("SKIP_EXPIRY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// Whether tokens are required.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }
}

/// Claims read from identity tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: the player id.
    pub sub: String,
    /// Display name, if the provider includes one.
    #[serde(default)]
    pub name: Option<String>,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
}

/// Who a connection belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerIdentity {
    pub id: PlayerId,
    pub name: String,
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication not configured")]
    NotConfigured,
    #[error("token required")]
    MissingToken,
    #[error("invalid token format")]
    InvalidFormat,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid audience")]
    InvalidAudience,
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    #[error("decode error: {0}")]
    DecodeError(String),
}

impl AuthError {
    /// Wire error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::Expired => ErrorCode::TokenExpired,
            AuthError::InvalidFormat
            | AuthError::InvalidSignature
            | AuthError::InvalidIssuer
            | AuthError::InvalidAudience
            | AuthError::DecodeError(_) => ErrorCode::InvalidToken,
            _ => ErrorCode::AuthFailed,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Validate a JWT and extract its claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let algorithm = if config.public_key_pem.is_some() {
        Algorithm::RS256
    } else if config.secret.is_some() {
        Algorithm::HS256
    } else {
        return Err(AuthError::NotConfigured);
    };

    let mut validation = Validation::new(algorithm);
    validation.required_spec_claims = HashSet::new();

    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }
    if let Some(ref audience) = config.audience {
        validation.set_audience(&[audience]);
    } else {
        validation.validate_aud = false;
    }
    if config.skip_expiry {
        validation.validate_exp = false;
    }

    let key = match (&config.public_key_pem, &config.secret) {
        (Some(pem), _) => DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AuthError::DecodeError(format!("invalid public key: {e}")))?,
        (None, Some(secret)) => DecodingKey::from_secret(secret.as_bytes()),
        (None, None) => return Err(AuthError::NotConfigured),
    };

    let token_data: TokenData<TokenClaims> = decode(token, &key, &validation).map_err(map_jwt_error)?;
    let claims = token_data.claims;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }

    if !config.skip_expiry && claims.exp > 0 && unix_now() > claims.exp {
        return Err(AuthError::Expired);
    }

    Ok(claims)
}

/// Resolve the identity behind an `auth` message.
pub fn authenticate(request: &AuthRequest, config: &AuthConfig) -> Result<PlayerIdentity, AuthError> {
    if config.is_configured() {
        let token = request.token.as_deref().ok_or(AuthError::MissingToken)?;
        let claims = validate_token(token, config)?;
        let name = claims.name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| request.name.clone());
        return Ok(PlayerIdentity { id: PlayerId::new(claims.sub), name });
    }

    if request.player_id.is_empty() {
        return Err(AuthError::MissingClaim("playerId".into()));
    }
    Ok(PlayerIdentity {
        id: PlayerId::new(request.player_id.clone()),
        name: request.name.clone(),
    })
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "quadpong-test-secret-0123456789";

    fn sign(claims: &TokenClaims, secret: &str) -> String {
        encode(&Header::new(Algorithm::HS256), claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn claims(sub: &str, name: Option<&str>) -> TokenClaims {
        let now = unix_now();
        TokenClaims {
            sub: sub.into(),
            name: name.map(Into::into),
            exp: now + 3600,
            iat: now,
            iss: Some("test-issuer".into()),
            aud: None,
        }
    }

    fn secured() -> AuthConfig {
        AuthConfig { secret: Some(SECRET.into()), ..Default::default() }
    }

    fn request(player_id: &str, name: &str, token: Option<String>) -> AuthRequest {
        AuthRequest { player_id: player_id.into(), name: name.into(), token }
    }

    #[test]
    fn test_token_identity_overrides_assertion() {
        let token = sign(&claims("user-1", Some("Ada")), SECRET);
        let identity = authenticate(&request("spoofed", "Mallory", Some(token)), &secured()).unwrap();
        assert_eq!(identity, PlayerIdentity { id: "user-1".into(), name: "Ada".into() });
    }

    #[test]
    fn test_name_falls_back_to_request() {
        let token = sign(&claims("user-2", None), SECRET);
        let identity = authenticate(&request("", "Bob", Some(token)), &secured()).unwrap();
        assert_eq!(identity.name, "Bob");
    }

    #[test]
    fn test_token_required_when_configured() {
        let result = authenticate(&request("user-1", "Ada", None), &secured());
        assert!(matches!(result, Err(AuthError::MissingToken)));
    }

    #[test]
    fn test_dev_mode_trusts_assertion() {
        let identity = authenticate(&request("p1", "Ada", None), &AuthConfig::default()).unwrap();
        assert_eq!(identity.id, PlayerId::from("p1"));

        let result = authenticate(&request("", "Ada", None), &AuthConfig::default());
        assert!(matches!(result, Err(AuthError::MissingClaim(_))));
    }

    #[test]
    fn test_expired_token_rejected() {
        let mut c = claims("user-1", None);
        c.exp = 1;
        let result = validate_token(&sign(&c, SECRET), &secured());
        assert!(matches!(result, Err(AuthError::Expired)));
        assert_eq!(AuthError::Expired.code(), ErrorCode::TokenExpired);
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let token = sign(&claims("user-1", None), "some-other-secret-0123456789");
        let result = validate_token(&token, &secured());
        assert!(matches!(result, Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn test_issuer_validation() {
        let token = sign(&claims("user-1", None), SECRET);
        let config = AuthConfig { issuer: Some("wrong-issuer".into()), ..secured() };
        assert!(matches!(validate_token(&token, &config), Err(AuthError::InvalidIssuer)));
    }

    #[test]
    fn test_missing_sub_rejected() {
        let token = sign(&claims("", None), SECRET);
        assert!(matches!(validate_token(&token, &secured()), Err(AuthError::MissingClaim(_))));
    }

    #[test]
    fn test_not_configured_error() {
        let result = validate_token("some.jwt.token", &AuthConfig::default());
        assert!(matches!(result, Err(AuthError::NotConfigured)));
    }
}
