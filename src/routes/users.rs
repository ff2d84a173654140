use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::{
    auth::{authenticate_credentials, hash_password, issue_token, new_id, AuthUser},
    db::{record_audit, AuditEntry},
    error::{AppError, AppResult},
    models::{Role, UserProfile},
    policy::{authorize, Operation},
    routes::required,
    state::AppState,
};

const MIN_PASSWORD_LEN: usize = 6;

#[derive(Deserialize)]
struct RegisterRequest {
    name: String,
    email: String,
    #[serde(default)]
    id_document: String,
    #[serde(default)]
    phone: String,
    password: String,
}

#[derive(Deserialize)]
struct CreateUserRequest {
    #[serde(flatten)]
    account: RegisterRequest,
    role: Role,
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Serialize)]
struct SessionUser {
    id: String,
    name: String,
    role: Role,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    user: SessionUser,
}

const PROFILE_COLUMNS: &str = "id, name, email, id_document, phone, role, created_at";

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/users").route(web::post().to(register)))
        .service(web::resource("/login").route(web::post().to(login)))
        .service(web::resource("/my-profile").route(web::get().to(my_profile)))
        .service(
            web::resource("/admin/users")
                .route(web::get().to(list_users))
                .route(web::post().to(create_user)),
        );
}

async fn register(
    state: web::Data<AppState>,
    payload: web::Json<RegisterRequest>,
) -> AppResult<HttpResponse> {
    let profile = insert_user(&state.db, payload.into_inner(), Role::Client, None).await?;
    Ok(HttpResponse::Created().json(profile))
}

async fn create_user(
    state: web::Data<AppState>,
    user: AuthUser,
    payload: web::Json<CreateUserRequest>,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::CreateUser)?;
    let CreateUserRequest { account, role } = payload.into_inner();
    let profile = insert_user(&state.db, account, role, Some(&user)).await?;
    Ok(HttpResponse::Created().json(profile))
}

async fn insert_user(
    pool: &SqlitePool,
    request: RegisterRequest,
    role: Role,
    actor: Option<&AuthUser>,
) -> AppResult<UserProfile> {
    let name = required(&request.name, "Name")?;
    let email = required(&request.email, "Email")?.to_lowercase();
    if !email.contains('@') {
        return Err(AppError::validation("Email is not valid"));
    }
    if request.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    let password_hash = hash_password(&request.password)
        .map_err(|err| AppError::internal(format!("password hash failed: {err}")))?;
    let id = new_id();
    let now = Utc::now();

    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"INSERT INTO users (id, name, email, id_document, phone, password_hash, role, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&id)
    .bind(&name)
    .bind(&email)
    .bind(request.id_document.trim())
    .bind(request.phone.trim())
    .bind(password_hash)
    .bind(role)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(|err| match err {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            AppError::conflict("Email is already registered")
        }
        other => AppError::Database(other),
    })?;

    record_audit(
        &mut *tx,
        AuditEntry {
            entity: "user",
            entity_id: &id,
            action: "created",
            field: Some("role"),
            old_value: None,
            new_value: Some(role.as_str()),
            actor_id: actor.map(|actor| actor.id.as_str()),
        },
    )
    .await?;

    let profile = sqlx::query_as::<_, UserProfile>(&format!(
        "SELECT {PROFILE_COLUMNS} FROM users WHERE id = ?"
    ))
    .bind(&id)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    log::info!("Created {role} account {email}");
    Ok(profile)
}

async fn login(
    state: web::Data<AppState>,
    payload: web::Json<LoginRequest>,
) -> AppResult<HttpResponse> {
    let user = authenticate_credentials(&state, &payload.email, &payload.password)
        .await?
        .ok_or_else(|| {
            log::warn!("Failed login for {}", payload.email.trim());
            AppError::Unauthorized
        })?;

    let token = issue_token(&state.config, &user)?;
    Ok(HttpResponse::Ok().json(LoginResponse {
        token,
        user: SessionUser {
            id: user.id,
            name: user.name,
            role: user.role,
        },
    }))
}

async fn my_profile(state: web::Data<AppState>, user: AuthUser) -> AppResult<HttpResponse> {
    let profile = sqlx::query_as::<_, UserProfile>(&format!(
        "SELECT {PROFILE_COLUMNS} FROM users WHERE id = ?"
    ))
    .bind(&user.id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::not_found("User not found"))?;
    Ok(HttpResponse::Ok().json(profile))
}

async fn list_users(state: web::Data<AppState>, user: AuthUser) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ListUsers)?;
    let users = sqlx::query_as::<_, UserProfile>(&format!(
        "SELECT {PROFILE_COLUMNS} FROM users ORDER BY created_at DESC"
    ))
    .fetch_all(&state.db)
    .await?;
    Ok(HttpResponse::Ok().json(users))
}
