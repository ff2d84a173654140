use std::path::{Path, PathBuf};

use actix_multipart::form::{tempfile::TempFile, text::Text, MultipartForm};
use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde::Deserialize;
use sqlx::SqliteConnection;

use crate::{
    auth::{new_id, AuthUser},
    error::{AppError, AppResult},
    models::ProductRow,
    policy::{authorize, Operation},
    routes::required,
    state::AppState,
};

#[derive(MultipartForm)]
struct ProductForm {
    name: Text<String>,
    description: Option<Text<String>>,
    price: Text<f64>,
    quantity: Text<i64>,
    #[multipart(limit = "5MB")]
    image: Option<TempFile>,
}

#[derive(Deserialize)]
struct ProductQuery {
    search: Option<String>,
}

struct ProductFields {
    name: String,
    description: String,
    price: f64,
    quantity: i64,
}

impl ProductForm {
    fn fields(&self) -> AppResult<ProductFields> {
        let name = required(&self.name, "Name")?;
        let price = *self.price;
        if !price.is_finite() || price < 0.0 {
            return Err(AppError::validation("Price cannot be negative"));
        }
        let quantity = *self.quantity;
        if quantity < 0 {
            return Err(AppError::validation("Quantity cannot be negative"));
        }
        Ok(ProductFields {
            name,
            description: self
                .description
                .as_ref()
                .map(|text| text.trim().to_string())
                .unwrap_or_default(),
            price,
            quantity,
        })
    }
}

const PRODUCT_COLUMNS: &str = "id, name, description, price, quantity, image, created_at, updated_at";

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/products")
            .route(web::get().to(list_products))
            .route(web::post().to(create_product)),
    )
    .service(
        web::resource("/products/{id}")
            .route(web::get().to(get_product))
            .route(web::put().to(update_product))
            .route(web::delete().to(delete_product)),
    );
}

async fn fetch_product(conn: &mut SqliteConnection, id: &str) -> AppResult<ProductRow> {
    sqlx::query_as::<_, ProductRow>(&format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?"))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| AppError::not_found("Product not found"))
}

async fn list_products(
    state: web::Data<AppState>,
    query: web::Query<ProductQuery>,
) -> AppResult<HttpResponse> {
    let search = query
        .search
        .as_deref()
        .map(str::trim)
        .filter(|term| !term.is_empty());

    let products = match search {
        Some(term) => {
            sqlx::query_as::<_, ProductRow>(&format!(
                "SELECT {PRODUCT_COLUMNS} FROM products WHERE name LIKE ? COLLATE NOCASE ORDER BY name"
            ))
            .bind(format!("%{term}%"))
            .fetch_all(&state.db)
            .await?
        }
        None => {
            sqlx::query_as::<_, ProductRow>(&format!(
                "SELECT {PRODUCT_COLUMNS} FROM products ORDER BY name"
            ))
            .fetch_all(&state.db)
            .await?
        }
    };
    Ok(HttpResponse::Ok().json(products))
}

async fn get_product(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let mut conn = state.db.acquire().await?;
    let product = fetch_product(&mut conn, &path).await?;
    Ok(HttpResponse::Ok().json(product))
}

async fn create_product(
    state: web::Data<AppState>,
    user: AuthUser,
    MultipartForm(form): MultipartForm<ProductForm>,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ManageCatalog)?;
    let fields = form.fields()?;
    let image = match form.image {
        Some(upload) => Some(store_image(state.config.upload_dir.clone(), upload).await?),
        None => None,
    };

    let id = new_id();
    let now = Utc::now();
    let inserted = sqlx::query(
        r#"INSERT INTO products (id, name, description, price, quantity, image, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&id)
    .bind(&fields.name)
    .bind(&fields.description)
    .bind(fields.price)
    .bind(fields.quantity)
    .bind(&image)
    .bind(now)
    .bind(now)
    .execute(&state.db)
    .await;

    if let Err(err) = inserted {
        if let Some(image) = image {
            remove_image(state.config.upload_dir.clone(), image).await;
        }
        return Err(err.into());
    }

    let mut conn = state.db.acquire().await?;
    let product = fetch_product(&mut conn, &id).await?;
    log::info!("{} created product {}", user.name, fields.name);
    Ok(HttpResponse::Created().json(product))
}

async fn update_product(
    state: web::Data<AppState>,
    user: AuthUser,
    path: web::Path<String>,
    MultipartForm(form): MultipartForm<ProductForm>,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ManageCatalog)?;
    let id = path.into_inner();
    let fields = form.fields()?;

    let mut conn = state.db.acquire().await?;
    let current = fetch_product(&mut conn, &id).await?;
    drop(conn);

    let new_image = match form.image {
        Some(upload) => Some(store_image(state.config.upload_dir.clone(), upload).await?),
        None => None,
    };
    let image = new_image.clone().or_else(|| current.image.clone());

    let updated = sqlx::query(
        r#"UPDATE products
           SET name = ?, description = ?, price = ?, quantity = ?, image = ?, updated_at = ?
           WHERE id = ?"#,
    )
    .bind(&fields.name)
    .bind(&fields.description)
    .bind(fields.price)
    .bind(fields.quantity)
    .bind(&image)
    .bind(Utc::now())
    .bind(&id)
    .execute(&state.db)
    .await;

    if let Err(err) = updated {
        if let Some(image) = new_image {
            remove_image(state.config.upload_dir.clone(), image).await;
        }
        return Err(err.into());
    }

    if let (Some(_), Some(old)) = (&new_image, current.image) {
        remove_image(state.config.upload_dir.clone(), old).await;
    }

    let mut conn = state.db.acquire().await?;
    let product = fetch_product(&mut conn, &id).await?;
    log::info!("{} updated product {}", user.name, id);
    Ok(HttpResponse::Ok().json(product))
}

async fn delete_product(
    state: web::Data<AppState>,
    user: AuthUser,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ManageCatalog)?;
    let id = path.into_inner();

    let mut conn = state.db.acquire().await?;
    let current = fetch_product(&mut conn, &id).await?;
    sqlx::query("DELETE FROM products WHERE id = ?")
        .bind(&id)
        .execute(&mut *conn)
        .await?;
    drop(conn);

    if let Some(image) = current.image {
        remove_image(state.config.upload_dir.clone(), image).await;
    }

    log::info!("{} deleted product {}", user.name, id);
    Ok(HttpResponse::NoContent().finish())
}

/// Keeps only characters that are safe in a file name.
fn sanitize_file_name(original: &str) -> String {
    let base = Path::new(original)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned
    }
}

/// Copies the upload into `dir` under a timestamped name and returns that name.
async fn store_image(dir: PathBuf, upload: TempFile) -> AppResult<String> {
    let file_name = format!(
        "{}_{}",
        Utc::now().format("%Y%m%d%H%M%S%3f"),
        sanitize_file_name(upload.file_name.as_deref().unwrap_or("image"))
    );
    let target = dir.join(&file_name);

    web::block(move || -> std::io::Result<()> {
        std::fs::create_dir_all(&dir)?;
        std::fs::copy(upload.file.path(), &target)?;
        Ok(())
    })
    .await
    .map_err(|err| AppError::internal(format!("image copy task failed: {err}")))?
    .map_err(|err| AppError::internal(format!("failed to store image: {err}")))?;

    Ok(file_name)
}

async fn remove_image(dir: PathBuf, file_name: String) {
    let path = dir.join(&file_name);
    match web::block(move || std::fs::remove_file(path)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::warn!("Could not remove image {file_name}: {err}"),
        Err(err) => log::warn!("Image removal task failed for {file_name}: {err}"),
    }
}
