use std::{env, path::PathBuf};

const DEFAULT_JWT_SECRET: &str = "dev-secret-change-me";

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub jwt_secret: String,
    pub token_ttl_minutes: i64,
    pub tax_rate: f64,
    pub upload_dir: PathBuf,
    pub cors_origin: String,
    pub admin: AdminSeed,
}

/// Credentials for the admin account created on first start.
#[derive(Clone, Debug)]
pub struct AdminSeed {
    pub email: String,
    pub password: String,
    pub name: String,
}

impl Config {
    pub fn from_env() -> Self {
        let jwt_secret = env::var("JWT_SECRET").unwrap_or_else(|_| DEFAULT_JWT_SECRET.to_string());
        if jwt_secret == DEFAULT_JWT_SECRET {
            log::warn!("JWT_SECRET not set. Using an insecure development secret.");
        }

        let admin_password = env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "admin".to_string());
        if admin_password == "admin" {
            log::warn!("ADMIN_PASSWORD not set. Using default password 'admin'. Set ADMIN_PASSWORD in production.");
        }

        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./data/salon.db".to_string()),
            port: parsed("PORT", 8080),
            jwt_secret,
            token_ttl_minutes: parsed("TOKEN_TTL_MINUTES", 24 * 60),
            tax_rate: parsed("TAX_RATE", 0.13),
            upload_dir: PathBuf::from(
                env::var("UPLOAD_DIR").unwrap_or_else(|_| "./recursos".to_string()),
            ),
            cors_origin: env::var("CORS_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:4200".to_string()),
            admin: AdminSeed {
                email: env::var("ADMIN_EMAIL").unwrap_or_else(|_| "admin@admin".to_string()),
                password: admin_password,
                name: env::var("ADMIN_NAME").unwrap_or_else(|_| "Administrator".to_string()),
            },
        }
    }
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(value) => value.trim().parse().unwrap_or_else(|_| {
            log::warn!("Ignoring invalid {key}={value}");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests(upload_dir: PathBuf) -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            port: 0,
            jwt_secret: "test-secret".to_string(),
            token_ttl_minutes: 60,
            tax_rate: 0.13,
            upload_dir,
            cors_origin: "http://localhost:4200".to_string(),
            admin: AdminSeed {
                email: "admin@test".to_string(),
                password: "admin-pass".to_string(),
                name: "Test Admin".to_string(),
            },
        }
    }
}
