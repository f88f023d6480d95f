use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::account::repo_types::{normalize, NewUser, User, UserClaim};

/// Postgres SQLSTATE for a unique constraint violation.
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Error)]
pub enum CreateUserError {
    #[error("email or user name already taken")]
    Duplicate,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Persistence for accounts, their roles and their claims.
///
/// Email and user name lookups are case-insensitive.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;
    async fn find_by_user_name(&self, user_name: &str) -> anyhow::Result<Option<User>>;
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>>;
    async fn email_exists(&self, email: &str) -> anyhow::Result<bool>;
    async fn user_name_exists(&self, user_name: &str) -> anyhow::Result<bool>;
    async fn create(&self, user: NewUser<'_>) -> Result<User, CreateUserError>;
    async fn add_to_role(&self, user_id: Uuid, role: &str) -> anyhow::Result<()>;
    async fn roles(&self, user_id: Uuid) -> anyhow::Result<Vec<String>>;
    async fn claims(&self, user_id: Uuid) -> anyhow::Result<Vec<UserClaim>>;
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, user_name, email, display_name, password_hash, created_at
            FROM users
            WHERE normalized_email = $1
            "#,
        )
        .bind(normalize(email))
        .fetch_optional(&self.db)
        .await
        .context("find user by email")?;
        Ok(user)
    }

    async fn find_by_user_name(&self, user_name: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, user_name, email, display_name, password_hash, created_at
            FROM users
            WHERE normalized_user_name = $1
            "#,
        )
        .bind(normalize(user_name))
        .fetch_optional(&self.db)
        .await
        .context("find user by user name")?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, user_name, email, display_name, password_hash, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context("find user by id")?;
        Ok(user)
    }

    async fn email_exists(&self, email: &str) -> anyhow::Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM users WHERE normalized_email = $1)",
        )
        .bind(normalize(email))
        .fetch_one(&self.db)
        .await
        .context("check email exists")?;
        Ok(exists)
    }

    async fn user_name_exists(&self, user_name: &str) -> anyhow::Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM users WHERE normalized_user_name = $1)",
        )
        .bind(normalize(user_name))
        .fetch_one(&self.db)
        .await
        .context("check user name exists")?;
        Ok(exists)
    }

    async fn create(&self, user: NewUser<'_>) -> Result<User, CreateUserError> {
        let res = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users
                (user_name, normalized_user_name, email, normalized_email, display_name, password_hash)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, user_name, email, display_name, password_hash, created_at
            "#,
        )
        .bind(user.user_name.trim())
        .bind(normalize(user.user_name))
        .bind(user.email.trim())
        .bind(normalize(user.email))
        .bind(user.display_name.trim())
        .bind(user.password_hash)
        .fetch_one(&self.db)
        .await;

        match res {
            Ok(created) => Ok(created),
            // Lost the race against a concurrent registration.
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(CreateUserError::Duplicate)
            }
            Err(e) => Err(anyhow::Error::new(e).context("insert user").into()),
        }
    }

    async fn add_to_role(&self, user_id: Uuid, role: &str) -> anyhow::Result<()> {
        let mut tx = self.db.begin().await.context("begin tx")?;
        sqlx::query("INSERT INTO roles (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(role)
            .execute(&mut *tx)
            .await
            .context("upsert role")?;
        sqlx::query(
            r#"
            INSERT INTO user_roles (user_id, role_id)
            SELECT $1, id FROM roles WHERE name = $2
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(role)
        .execute(&mut *tx)
        .await
        .context("link user role")?;
        tx.commit().await.context("commit tx")?;
        Ok(())
    }

    async fn roles(&self, user_id: Uuid) -> anyhow::Result<Vec<String>> {
        let roles = sqlx::query_scalar::<_, String>(
            r#"
            SELECT r.name
              FROM roles r
              JOIN user_roles ur ON ur.role_id = r.id
             WHERE ur.user_id = $1
             ORDER BY r.name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await
        .context("list user roles")?;
        Ok(roles)
    }

    async fn claims(&self, user_id: Uuid) -> anyhow::Result<Vec<UserClaim>> {
        let claims = sqlx::query_as::<_, UserClaim>(
            r#"
            SELECT claim_type, claim_value
              FROM user_claims
             WHERE user_id = $1
             ORDER BY id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await
        .context("list user claims")?;
        Ok(claims)
    }
}

#[cfg(test)]
pub use memory::MemoryUserStore;

#[cfg(test)]
mod memory {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use time::OffsetDateTime;
    use tokio::sync::RwLock;
    use uuid::Uuid;

    use super::{CreateUserError, UserStore};
    use crate::account::repo_types::{normalize, NewUser, User, UserClaim};

    #[derive(Default)]
    struct Inner {
        users: Vec<User>,
        roles: HashMap<Uuid, Vec<String>>,
        claims: HashMap<Uuid, Vec<UserClaim>>,
    }

    /// Store kept in process memory, for handler tests.
    #[derive(Default)]
    pub struct MemoryUserStore {
        inner: RwLock<Inner>,
    }

    impl MemoryUserStore {
        pub async fn add_claim(&self, user_id: Uuid, claim_type: &str, claim_value: &str) {
            self.inner
                .write()
                .await
                .claims
                .entry(user_id)
                .or_default()
                .push(UserClaim {
                    claim_type: claim_type.into(),
                    claim_value: claim_value.into(),
                });
        }
    }

    #[async_trait]
    impl UserStore for MemoryUserStore {
        async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
            let key = normalize(email);
            let inner = self.inner.read().await;
            Ok(inner.users.iter().find(|u| normalize(&u.email) == key).cloned())
        }

        async fn find_by_user_name(&self, user_name: &str) -> anyhow::Result<Option<User>> {
            let key = normalize(user_name);
            let inner = self.inner.read().await;
            Ok(inner
                .users
                .iter()
                .find(|u| normalize(&u.user_name) == key)
                .cloned())
        }

        async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
            let inner = self.inner.read().await;
            Ok(inner.users.iter().find(|u| u.id == id).cloned())
        }

        async fn email_exists(&self, email: &str) -> anyhow::Result<bool> {
            Ok(self.find_by_email(email).await?.is_some())
        }

        async fn user_name_exists(&self, user_name: &str) -> anyhow::Result<bool> {
            Ok(self.find_by_user_name(user_name).await?.is_some())
        }

        async fn create(&self, user: NewUser<'_>) -> Result<User, CreateUserError> {
            let mut inner = self.inner.write().await;
            let (email_key, name_key) = (normalize(user.email), normalize(user.user_name));
            if inner
                .users
                .iter()
                .any(|u| normalize(&u.email) == email_key || normalize(&u.user_name) == name_key)
            {
                return Err(CreateUserError::Duplicate);
            }
            let created = User {
                id: Uuid::new_v4(),
                user_name: user.user_name.trim().into(),
                email: user.email.trim().into(),
                display_name: user.display_name.trim().into(),
                password_hash: user.password_hash.into(),
                created_at: OffsetDateTime::now_utc(),
            };
            inner.users.push(created.clone());
            Ok(created)
        }

        async fn add_to_role(&self, user_id: Uuid, role: &str) -> anyhow::Result<()> {
            let mut inner = self.inner.write().await;
            let roles = inner.roles.entry(user_id).or_default();
            if !roles.iter().any(|r| r == role) {
                roles.push(role.to_string());
                roles.sort();
            }
            Ok(())
        }

        async fn roles(&self, user_id: Uuid) -> anyhow::Result<Vec<String>> {
            let inner = self.inner.read().await;
            Ok(inner.roles.get(&user_id).cloned().unwrap_or_default())
        }

        async fn claims(&self, user_id: Uuid) -> anyhow::Result<Vec<UserClaim>> {
            let inner = self.inner.read().await;
            Ok(inner.claims.get(&user_id).cloned().unwrap_or_default())
        }
    }

    mod tests {
        use super::*;

        fn new_user<'a>(name: &'a str, email: &'a str) -> NewUser<'a> {
            NewUser {
                user_name: name,
                email,
                display_name: "Bob",
                password_hash: "hash",
            }
        }

        #[tokio::test]
        async fn lookups_ignore_case() {
            let store = MemoryUserStore::default();
            let user = store
                .create(new_user("Bob", "Bob@Example.com"))
                .await
                .expect("create");
            assert!(store.email_exists("bob@example.COM").await.unwrap());
            assert!(store.user_name_exists("BOB").await.unwrap());
            let found = store.find_by_user_name("bob").await.unwrap().expect("found");
            assert_eq!(found.id, user.id);
        }

        #[tokio::test]
        async fn create_rejects_duplicates() {
            let store = MemoryUserStore::default();
            store.create(new_user("bob", "bob@example.com")).await.unwrap();
            let err = store
                .create(new_user("other", "BOB@example.com"))
                .await
                .unwrap_err();
            assert!(matches!(err, CreateUserError::Duplicate));
        }

        #[tokio::test]
        async fn roles_are_deduplicated() {
            let store = MemoryUserStore::default();
            let user = store.create(new_user("bob", "bob@example.com")).await.unwrap();
            store.add_to_role(user.id, "Member").await.unwrap();
            store.add_to_role(user.id, "Admin").await.unwrap();
            store.add_to_role(user.id, "Member").await.unwrap();
            assert_eq!(store.roles(user.id).await.unwrap(), vec!["Admin", "Member"]);
        }
    }
}
