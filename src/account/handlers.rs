use axum::{
    extract::{FromRef, State},
    routing::{get, post},
    Json, Router,
};
use tracing::{error, info, instrument, warn};

use crate::{
    account::{
        dto::{AccessTokenDto, LoginDto, RegisterDto, UserDto},
        password::{hash_password, verify_password},
        repo::CreateUserError,
        repo_types::{NewUser, User},
        services::{identity_violations, validate_register_request, PasswordOptions},
    },
    auth::jwt::{AuthUser, JwtKeys},
    error::AppError,
    extract::ApiJson,
    state::AppState,
};

pub fn account_routes() -> Router<AppState> {
    Router::new()
        .route("/account/login", post(login))
        .route("/account/register", post(register))
        .route("/account/currentuser", get(current_user))
        .route("/account/accesstoken", get(access_token))
}

async fn user_object(state: &AppState, user: &User) -> Result<UserDto, AppError> {
    let keys = JwtKeys::from_ref(state);
    let token = keys
        .issue_token(state.users.as_ref(), &user.user_name)
        .await
        .map_err(|e| {
            error!(error = %e, user_id = %user.id, "token issuance failed");
            AppError::Internal(e)
        })?;
    Ok(UserDto {
        display_name: user.display_name.clone(),
        token,
        user_name: user.user_name.clone(),
    })
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<LoginDto>,
) -> Result<Json<UserDto>, AppError> {
    let email = payload.email.trim();

    let Some(user) = state.users.find_by_email(email).await? else {
        warn!(email = %email, "login unknown email");
        return Err(AppError::Unauthorized);
    };

    let ok = match verify_password(payload.password, user.password_hash.clone()).await {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, user_id = %user.id, "stored password hash unreadable");
            false
        }
    };
    if !ok {
        warn!(user_id = %user.id, "login invalid password");
        return Err(AppError::Unauthorized);
    }

    let dto = user_object(&state, &user).await?;
    info!(user_id = %user.id, "user logged in");
    Ok(Json(dto))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<RegisterDto>,
) -> Result<Json<UserDto>, AppError> {
    if let Err(errors) = validate_register_request(&payload) {
        warn!(?errors, "invalid registration request");
        return Err(AppError::bad_request_with("Invalid registration request", errors));
    }

    // Existence checks are not atomic with the insert; the unique
    // constraints catch a concurrent registration.
    if state.users.email_exists(&payload.email).await? {
        warn!(email = %payload.email, "email already registered");
        return Err(AppError::bad_request("Email Taken"));
    }
    if state.users.user_name_exists(&payload.user_name).await? {
        warn!("user name already registered");
        return Err(AppError::bad_request("Username Taken"));
    }

    let violations = identity_violations(&payload, &PasswordOptions::default());
    if !violations.is_empty() {
        warn!(?violations, "registration rejected");
        return Err(AppError::bad_request_with(
            "Problem registering user",
            violations,
        ));
    }

    let password_hash = hash_password(payload.password.clone()).await?;
    let new_user = NewUser {
        user_name: &payload.user_name,
        email: &payload.email,
        display_name: &payload.display_name,
        password_hash: &password_hash,
    };
    let user = match state.users.create(new_user).await {
        Ok(u) => u,
        Err(CreateUserError::Duplicate) => {
            warn!("lost registration race on unique constraint");
            return Err(AppError::bad_request("Problem registering user"));
        }
        Err(CreateUserError::Store(e)) => {
            error!(error = %e, "create user failed");
            return Err(AppError::Internal(e));
        }
    };

    // The account already exists; a missing role must not fail the request.
    for role in &state.config.default_roles {
        if let Err(e) = state.users.add_to_role(user.id, role).await {
            error!(error = %e, user_id = %user.id, role = %role, "assign default role failed");
        }
    }

    let dto = user_object(&state, &user).await?;
    info!(user_id = %user.id, "user registered");
    Ok(Json(dto))
}

#[instrument(skip(state, auth), fields(user_id = %auth.claims.sub))]
pub async fn current_user(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<UserDto>, AppError> {
    let Some(user) = state.users.find_by_id(auth.claims.sub).await? else {
        warn!("token subject has no account");
        return Err(AppError::not_found("User not found"));
    };
    Ok(Json(user_object(&state, &user).await?))
}

#[instrument(skip_all, fields(user_id = %auth.claims.sub))]
pub async fn access_token(auth: AuthUser) -> Json<AccessTokenDto> {
    Json(AccessTokenDto {
        access_token: auth.token,
    })
}
