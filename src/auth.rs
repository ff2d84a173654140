use std::future::{ready, Ready};

use actix_web::{
    body::{BoxBody, MessageBody},
    dev::{Payload, ServiceRequest, ServiceResponse},
    http::header::{self, Header},
    middleware::Next,
    Error, FromRequest, HttpMessage, HttpRequest, ResponseError,
};
use actix_web_httpauth::headers::authorization::{Authorization, Bearer};
use argon2::{
    password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header as JwtHeader, Validation};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::Config,
    error::{AppError, AppResult},
    models::{Role, UserRow},
    state::AppState,
};

/// Identity decoded from a session token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    name: String,
    role: Role,
    iat: i64,
    exp: i64,
}

pub fn hash_password(password: &str) -> Result<String, password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

fn verify_password(password: &str, password_hash: &str) -> bool {
    let parsed_hash = PasswordHash::new(password_hash);
    match parsed_hash {
        Ok(hash) => Argon2::default()
            .verify_password(password.as_bytes(), &hash)
            .is_ok(),
        Err(_) => false,
    }
}

/// Checks an email/password pair. Unknown emails and wrong passwords are
/// indistinguishable to the caller.
pub async fn authenticate_credentials(
    state: &AppState,
    email: &str,
    password: &str,
) -> AppResult<Option<AuthUser>> {
    let user = sqlx::query_as::<_, UserRow>(
        r#"SELECT id, name, email, id_document, phone, password_hash, role, created_at, updated_at
           FROM users
           WHERE email = ?
           LIMIT 1"#,
    )
    .bind(email.trim().to_lowercase())
    .fetch_optional(&state.db)
    .await?;

    let user = match user {
        Some(user) => user,
        None => return Ok(None),
    };

    if !verify_password(password, &user.password_hash) {
        return Ok(None);
    }

    Ok(Some(AuthUser {
        id: user.id,
        name: user.name,
        role: user.role,
    }))
}

pub fn issue_token(config: &Config, user: &AuthUser) -> AppResult<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: user.id.clone(),
        name: user.name.clone(),
        role: user.role,
        iat: now.timestamp(),
        exp: (now + Duration::minutes(config.token_ttl_minutes)).timestamp(),
    };
    encode(
        &JwtHeader::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .map_err(|err| AppError::internal(format!("token signing failed: {err}")))
}

pub fn decode_token(secret: &str, token: &str) -> Option<AuthUser> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;
    Some(AuthUser {
        id: data.claims.sub,
        name: data.claims.name,
        role: data.claims.role,
    })
}

/// Decodes a bearer token when one is sent and stores the identity in the
/// request extensions. A present but invalid or expired token ends the request
/// with 401; requests without an `Authorization` header pass through and are
/// turned away by the [`AuthUser`] extractor on protected handlers.
pub async fn bearer_guard<B>(
    req: ServiceRequest,
    next: Next<B>,
) -> Result<ServiceResponse<BoxBody>, Error>
where
    B: MessageBody + 'static,
{
    if req.headers().contains_key(header::AUTHORIZATION) {
        let user = Authorization::<Bearer>::parse(&req).ok().and_then(|auth| {
            let secret = req
                .app_data::<actix_web::web::Data<AppState>>()
                .map(|state| state.config.jwt_secret.clone())?;
            decode_token(&secret, auth.into_scheme().token())
        });

        match user {
            Some(user) => {
                req.extensions_mut().insert(user);
            }
            None => {
                let response = AppError::Unauthorized.error_response();
                return Ok(req.into_response(response));
            }
        }
    }

    let res = next.call(req).await?;
    Ok(res.map_into_boxed_body())
}

impl FromRequest for AuthUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<AuthUser>()
                .cloned()
                .ok_or(AppError::Unauthorized),
        )
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> Config {
        Config::for_tests(PathBuf::from("./target/test-uploads"))
    }

    fn user() -> AuthUser {
        AuthUser {
            id: "user-1".to_string(),
            name: "Ana".to_string(),
            role: Role::Client,
        }
    }

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("s3cret!").unwrap();
        assert!(verify_password("s3cret!", &hash));
        assert!(!verify_password("wrong", &hash));
        assert!(!verify_password("s3cret!", "not-a-hash"));
    }

    #[test]
    fn token_carries_identity_and_role() {
        let config = config();
        let token = issue_token(&config, &user()).unwrap();
        assert_eq!(decode_token(&config.jwt_secret, &token), Some(user()));
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let token = issue_token(&config(), &user()).unwrap();
        assert_eq!(decode_token("another-secret", &token), None);
    }

    #[test]
    fn expired_token_is_rejected() {
        let mut config = config();
        config.token_ttl_minutes = -10;
        let token = issue_token(&config, &user()).unwrap();
        assert_eq!(decode_token(&config.jwt_secret, &token), None);
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert_eq!(decode_token("test-secret", "not.a.token"), None);
    }
}
