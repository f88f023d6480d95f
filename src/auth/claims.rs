use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime};
use tracing::warn;
use uuid::Uuid;

use crate::account::repo_types::{User, UserClaim};

pub const ROLE_CLAIM: &str = "role";

/// Names owned by the token itself; user claims may not override them.
const RESERVED: &[&str] = &[
    "sub",
    "unique_name",
    "email",
    "display_name",
    "iat",
    "nbf",
    "exp",
    "iss",
    "aud",
    "jti",
];

/// JWT payload issued to an account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: Uuid,           // user ID
    pub unique_name: String, // user name
    pub email: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub role: Vec<String>,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    /// Custom user claims, keyed by claim type.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Claims {
    pub fn new(
        user: &User,
        mut roles: Vec<String>,
        user_claims: &[UserClaim],
        issued_at: OffsetDateTime,
        ttl: Duration,
    ) -> anyhow::Result<Self> {
        let mut extra = Map::new();
        for claim in user_claims {
            let key = claim.claim_type.as_str();
            if key == ROLE_CLAIM {
                if !roles.contains(&claim.claim_value) {
                    roles.push(claim.claim_value.clone());
                }
                continue;
            }
            if RESERVED.contains(&key) {
                warn!(user_id = %user.id, claim_type = key, "skipping reserved claim type");
                continue;
            }
            let value = Value::String(claim.claim_value.clone());
            match extra.get_mut(key) {
                None => {
                    extra.insert(key.to_string(), value);
                }
                Some(Value::Array(values)) => values.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
            }
        }

        let expires_at = issued_at
            .checked_add(ttl)
            .ok_or_else(|| anyhow::anyhow!("token lifetime {ttl} overflows the expiry time"))?;
        let iat = issued_at.unix_timestamp();
        Ok(Self {
            sub: user.id,
            unique_name: user.user_name.clone(),
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            role: roles,
            iat,
            nbf: iat,
            exp: expires_at.unix_timestamp(),
            extra,
        })
    }
}
