use std::{fs, path::Path, str::FromStr};

use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqliteConnection, SqlitePool,
};

use crate::{
    auth::{hash_password, new_id},
    config::AdminSeed,
    error::{AppError, AppResult},
    models::Role,
};

pub async fn connect(db_url: &str) -> AppResult<SqlitePool> {
    ensure_sqlite_dir(db_url).map_err(|err| AppError::internal(err.to_string()))?;

    let connect_options = SqliteConnectOptions::from_str(db_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(connect_options)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

pub fn ensure_sqlite_dir(db_url: &str) -> std::io::Result<()> {
    let path = if let Some(path) = db_url.strip_prefix("sqlite://") {
        Some(path)
    } else if let Some(path) = db_url.strip_prefix("sqlite:") {
        Some(path)
    } else {
        None
    };

    let Some(path) = path else {
        return Ok(());
    };

    let path = path.split('?').next().unwrap_or(path);
    if path == ":memory:" || path.is_empty() {
        return Ok(());
    }

    let path = path.strip_prefix("file:").unwrap_or(path);
    let db_path = Path::new(path);
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Creates the bootstrap admin unless an admin account already exists.
pub async fn seed_admin(pool: &SqlitePool, seed: &AdminSeed) -> AppResult<()> {
    let existing = sqlx::query_as::<_, (String,)>("SELECT id FROM users WHERE role = ? LIMIT 1")
        .bind(Role::Admin)
        .fetch_optional(pool)
        .await?;

    if existing.is_some() {
        return Ok(());
    }

    let password_hash = hash_password(&seed.password)
        .map_err(|err| AppError::internal(format!("password hash failed: {err}")))?;
    let now = Utc::now();
    let id = new_id();

    sqlx::query(
        r#"INSERT INTO users (id, name, email, id_document, phone, password_hash, role, created_at, updated_at)
           VALUES (?, ?, ?, '', '', ?, ?, ?, ?)"#,
    )
    .bind(&id)
    .bind(&seed.name)
    .bind(&seed.email)
    .bind(password_hash)
    .bind(Role::Admin)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    log::info!("Created bootstrap admin {}", seed.email);
    Ok(())
}

/// One row for the audit trail.
pub struct AuditEntry<'a> {
    pub entity: &'a str,
    pub entity_id: &'a str,
    pub action: &'a str,
    pub field: Option<&'a str>,
    pub old_value: Option<&'a str>,
    pub new_value: Option<&'a str>,
    pub actor_id: Option<&'a str>,
}

/// Writes an audit entry on the given connection, so callers inside a
/// transaction keep the entry and the change together.
pub async fn record_audit(conn: &mut SqliteConnection, entry: AuditEntry<'_>) -> AppResult<()> {
    sqlx::query(
        r#"INSERT INTO audit_log (id, entity, entity_id, action, field, old_value, new_value, actor_id, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(new_id())
    .bind(entry.entity)
    .bind(entry.entity_id)
    .bind(entry.action)
    .bind(entry.field)
    .bind(entry.old_value)
    .bind(entry.new_value)
    .bind(entry.actor_id)
    .bind(Utc::now())
    .execute(conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_sqlite_dir_skips_memory_and_foreign_urls() {
        assert!(ensure_sqlite_dir("sqlite::memory:").is_ok());
        assert!(ensure_sqlite_dir("postgres://localhost/db").is_ok());
    }

    #[actix_web::test]
    async fn seed_admin_is_idempotent() {
        let pool = crate::test_util::pool().await;
        let seed = AdminSeed {
            email: "boss@salon".to_string(),
            password: "secret-pass".to_string(),
            name: "Boss".to_string(),
        };
        seed_admin(&pool, &seed).await.unwrap();
        seed_admin(&pool, &seed).await.unwrap();

        let admins: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE role = 'admin'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(admins, 1);
    }
}
