use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use crate::{
    account::repo::UserStore, auth::claims::Claims, config::JwtConfig, error::AppError,
    state::AppState,
};

/// HS256 signing and verification keys derived from the configured secret.
#[derive(Clone)]
pub struct JwtKeys {
    pub encoding: EncodingKey,
    pub decoding: DecodingKey,
    pub ttl: Duration,
}

impl FromRef<AppState> for JwtKeys {
    fn from_ref(state: &AppState) -> Self {
        Self::new(&state.config.jwt)
    }
}

impl JwtKeys {
    pub fn new(cfg: &JwtConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            ttl: Duration::days(cfg.ttl_days),
        }
    }

    pub fn sign(&self, claims: &Claims) -> anyhow::Result<String> {
        let token = encode(&Header::new(Algorithm::HS256), claims, &self.encoding)?;
        debug!(user_id = %claims.sub, exp = claims.exp, "jwt signed");
        Ok(token)
    }

    /// Checks signature and lifetime. Issuer and audience are not validated.
    pub fn verify(&self, token: &str) -> anyhow::Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.validate_nbf = true;
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        debug!(user_id = %data.claims.sub, "jwt verified");
        Ok(data.claims)
    }

    /// Builds and signs a token for the named user from their roles and claims.
    pub async fn issue_token(&self, users: &dyn UserStore, user_name: &str) -> anyhow::Result<String> {
        let user = users
            .find_by_user_name(user_name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no user named {user_name:?}"))?;
        let roles = users.roles(user.id).await?;
        let user_claims = users.claims(user.id).await?;

        let claims = Claims::new(&user, roles, &user_claims, OffsetDateTime::now_utc(), self.ttl)?;
        self.sign(&claims)
    }
}

/// Identity of the caller, taken from a valid bearer token.
pub struct AuthUser {
    pub claims: Claims,
    /// The raw token as presented.
    pub token: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    JwtKeys: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                debug!("missing Authorization header");
                AppError::Unauthorized
            })?;

        let token = match auth_header.split_once(' ') {
            Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
            _ => {
                warn!("invalid auth scheme");
                return Err(AppError::Unauthorized);
            }
        };

        let keys = JwtKeys::from_ref(state);
        let claims = keys.verify(token).map_err(|e| {
            warn!(error = %e, "invalid or expired token");
            AppError::Unauthorized
        })?;

        Ok(AuthUser {
            claims,
            token: token.to_string(),
        })
    }
}
