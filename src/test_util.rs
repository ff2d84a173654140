//! Fixtures shared by the unit and handler tests.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::{
    auth::{hash_password, issue_token, new_id, AuthUser},
    config::Config,
    db,
    models::{AppointmentStatus, Role},
    state::AppState,
};

pub const PASSWORD: &str = "password123";

/// Hashing is slow in debug builds, so fixtures share one hash of [`PASSWORD`].
fn password_hash() -> &'static str {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| hash_password(PASSWORD).expect("hash"))
}

/// A fresh in-memory database with migrations applied. A single connection
/// that never expires keeps the database alive for the whole test.
pub async fn pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory database");
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .expect("enable foreign keys");
    db::run_migrations(&pool).await.expect("migrations");
    pool
}

pub async fn state() -> AppState {
    let upload_dir = std::env::temp_dir().join(format!("salon-uploads-{}", new_id()));
    std::fs::create_dir_all(&upload_dir).expect("upload dir");
    AppState::new(pool().await, Config::for_tests(upload_dir))
}

pub async fn create_user(pool: &SqlitePool, role: Role) -> AuthUser {
    let id = new_id();
    let name = format!("{role} {}", &id[..8]);
    let now = Utc::now();
    sqlx::query(
        r#"INSERT INTO users (id, name, email, id_document, phone, password_hash, role, created_at, updated_at)
           VALUES (?, ?, ?, ?, '555-0100', ?, ?, ?, ?)"#,
    )
    .bind(&id)
    .bind(&name)
    .bind(format!("{id}@salon.test"))
    .bind(format!("DOC-{}", &id[..8]))
    .bind(password_hash())
    .bind(role)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .expect("insert user");
    AuthUser { id, name, role }
}

/// A user of `role` together with a valid bearer token.
pub async fn login_as(state: &AppState, role: Role) -> (AuthUser, String) {
    let user = create_user(&state.db, role).await;
    let token = issue_token(&state.config, &user).expect("token");
    (user, token)
}

pub fn bearer(token: &str) -> (&'static str, String) {
    ("Authorization", format!("Bearer {token}"))
}

pub async fn create_service(pool: &SqlitePool, name: &str, price: f64) -> String {
    let id = new_id();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO services (id, name, description, price, created_at, updated_at) VALUES (?, ?, '', ?, ?, ?)",
    )
    .bind(&id)
    .bind(name)
    .bind(price)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .expect("insert service");
    id
}

pub async fn create_product(pool: &SqlitePool, name: &str, price: f64, quantity: i64) -> String {
    let id = new_id();
    let now = Utc::now();
    sqlx::query(
        r#"INSERT INTO products (id, name, description, price, quantity, image, created_at, updated_at)
           VALUES (?, ?, '', ?, ?, NULL, ?, ?)"#,
    )
    .bind(&id)
    .bind(name)
    .bind(price)
    .bind(quantity)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .expect("insert product");
    id
}

/// Inserts an appointment directly in `status`. Without a user it becomes a
/// guest booking for document `GUEST-1`.
pub async fn insert_appointment(
    pool: &SqlitePool,
    user_id: Option<&str>,
    service_id: &str,
    scheduled_at: DateTime<Utc>,
    status: AppointmentStatus,
) -> String {
    let id = new_id();
    let now = Utc::now();
    let (guest_name, guest_document, guest_phone) = match user_id {
        Some(_) => (None, None, None),
        None => (Some("Guest"), Some("GUEST-1"), Some("555-0199")),
    };
    sqlx::query(
        r#"INSERT INTO appointments
           (id, user_id, service_id, scheduled_at, status, guest_name, guest_document, guest_phone, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&id)
    .bind(user_id)
    .bind(service_id)
    .bind(scheduled_at)
    .bind(status)
    .bind(guest_name)
    .bind(guest_document)
    .bind(guest_phone)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .expect("insert appointment");
    id
}

pub async fn appointment_status(pool: &SqlitePool, id: &str) -> AppointmentStatus {
    sqlx::query_scalar("SELECT status FROM appointments WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("appointment status")
}

/// Builds the full application around `state` the way `main` does, minus
/// CORS and static files.
macro_rules! init_app {
    ($state:expr) => {
        actix_web::test::init_service(
            actix_web::App::new()
                .app_data(actix_web::web::Data::new($state.clone()))
                .wrap(actix_web::middleware::from_fn($crate::auth::bearer_guard))
                .configure($crate::routes::configure),
        )
    };
}

pub(crate) use init_app;
