//! Invoice generation and retrieval.
//!
//! An invoice is derived from a finalized appointment. The existence check,
//! stock decrements and inserts share one transaction, and the UNIQUE
//! constraint on `invoices.appointment_id` backs the one-invoice rule.

use chrono::Utc;
use serde::Deserialize;
use sqlx::{SqliteConnection, SqlitePool};

use crate::{
    auth::{new_id, AuthUser},
    db::{record_audit, AuditEntry},
    error::{AppError, AppResult},
    models::{AppointmentStatus, Invoice, InvoiceHeaderRow, InvoiceLineRow, InvoiceSummaryRow},
};

#[derive(Debug, Default, Deserialize)]
pub struct GenerateInvoiceRequest {
    pub notes: Option<String>,
    #[serde(default)]
    pub extra_lines: Vec<ExtraLine>,
}

impl GenerateInvoiceRequest {
    /// An empty body asks for the service line only. Anything else must be a
    /// well-formed request.
    pub fn from_body(body: &[u8]) -> AppResult<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
            .map_err(|err| AppError::validation(format!("Invalid invoice request: {err}")))
    }
}

/// A billable item added on top of the appointment's service: either a
/// catalog product (priced from the catalog) or free text with its own price.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtraLine {
    pub product_id: Option<String>,
    pub description: Option<String>,
    pub quantity: i64,
    pub unit_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
struct PendingLine {
    product_id: Option<String>,
    service_id: Option<String>,
    description: Option<String>,
    quantity: i64,
    unit_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Totals {
    pub subtotal: f64,
    pub tax: f64,
    pub total: f64,
}

pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn line_subtotal(quantity: i64, unit_price: f64) -> f64 {
    round_cents(quantity as f64 * unit_price)
}

pub fn compute_totals(lines: &[(i64, f64)], tax_rate: f64) -> Totals {
    let subtotal = round_cents(
        lines
            .iter()
            .map(|(quantity, unit_price)| line_subtotal(*quantity, *unit_price))
            .sum(),
    );
    let tax = round_cents(subtotal * tax_rate);
    Totals {
        subtotal,
        tax,
        total: round_cents(subtotal + tax),
    }
}

#[derive(sqlx::FromRow)]
struct BillableAppointment {
    status: AppointmentStatus,
    service_id: String,
    service_name: String,
    service_price: f64,
    client_name: String,
    client_document: String,
    client_phone: Option<String>,
    client_email: Option<String>,
}

#[derive(sqlx::FromRow)]
struct StockRow {
    name: String,
    price: f64,
    quantity: i64,
}

/// Creates the invoice for `appointment_id` and returns its id.
pub async fn generate(
    pool: &SqlitePool,
    appointment_id: &str,
    request: GenerateInvoiceRequest,
    tax_rate: f64,
    actor: &AuthUser,
) -> AppResult<String> {
    let mut tx = pool.begin().await?;

    let appointment = sqlx::query_as::<_, BillableAppointment>(
        r#"SELECT a.status, a.service_id,
                  s.name AS service_name, s.price AS service_price,
                  COALESCE(u.name, a.guest_name) AS client_name,
                  COALESCE(u.id_document, a.guest_document) AS client_document,
                  COALESCE(u.phone, a.guest_phone) AS client_phone,
                  u.email AS client_email
           FROM appointments a
           JOIN services s ON s.id = a.service_id
           LEFT JOIN users u ON u.id = a.user_id
           WHERE a.id = ?"#,
    )
    .bind(appointment_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| AppError::not_found("Appointment not found"))?;

    if appointment.status != AppointmentStatus::Finalized {
        return Err(AppError::conflict(
            "Invoices can only be generated for finalized appointments",
        ));
    }

    let existing = sqlx::query_scalar::<_, String>("SELECT id FROM invoices WHERE appointment_id = ?")
        .bind(appointment_id)
        .fetch_optional(&mut *tx)
        .await?;
    if existing.is_some() {
        return Err(AppError::conflict(
            "An invoice already exists for this appointment",
        ));
    }

    let mut lines = vec![PendingLine {
        product_id: None,
        service_id: Some(appointment.service_id.clone()),
        description: Some(appointment.service_name.clone()),
        quantity: 1,
        unit_price: appointment.service_price,
    }];
    for extra in request.extra_lines {
        lines.push(resolve_extra_line(&mut *tx, extra).await?);
    }

    let totals = compute_totals(
        &lines
            .iter()
            .map(|line| (line.quantity, line.unit_price))
            .collect::<Vec<_>>(),
        tax_rate,
    );

    let invoice_id = new_id();
    let notes = request
        .notes
        .map(|notes| notes.trim().to_string())
        .filter(|notes| !notes.is_empty());

    sqlx::query(
        r#"INSERT INTO invoices
           (id, appointment_id, client_name, client_document, client_phone, client_email,
            issued_at, subtotal, tax, total, notes)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&invoice_id)
    .bind(appointment_id)
    .bind(&appointment.client_name)
    .bind(&appointment.client_document)
    .bind(&appointment.client_phone)
    .bind(&appointment.client_email)
    .bind(Utc::now())
    .bind(totals.subtotal)
    .bind(totals.tax)
    .bind(totals.total)
    .bind(notes)
    .execute(&mut *tx)
    .await
    .map_err(|err| match err {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            AppError::conflict("An invoice already exists for this appointment")
        }
        other => AppError::Database(other),
    })?;

    for (position, line) in lines.iter().enumerate() {
        sqlx::query(
            r#"INSERT INTO invoice_lines
               (id, invoice_id, position, product_id, service_id, description, quantity, unit_price, subtotal)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(new_id())
        .bind(&invoice_id)
        .bind(position as i64)
        .bind(&line.product_id)
        .bind(&line.service_id)
        .bind(&line.description)
        .bind(line.quantity)
        .bind(line.unit_price)
        .bind(line_subtotal(line.quantity, line.unit_price))
        .execute(&mut *tx)
        .await?;
    }

    record_audit(
        &mut *tx,
        AuditEntry {
            entity: "invoice",
            entity_id: &invoice_id,
            action: "generated",
            field: Some("appointment_id"),
            old_value: None,
            new_value: Some(appointment_id),
            actor_id: Some(&actor.id),
        },
    )
    .await?;

    tx.commit().await?;
    log::info!(
        "{} generated invoice {} for appointment {} (total {:.2})",
        actor.name,
        invoice_id,
        appointment_id,
        totals.total
    );
    Ok(invoice_id)
}

async fn resolve_extra_line(
    conn: &mut SqliteConnection,
    extra: ExtraLine,
) -> AppResult<PendingLine> {
    if extra.quantity <= 0 {
        return Err(AppError::validation("Line quantity must be positive"));
    }

    if let Some(product_id) = extra.product_id {
        let product = sqlx::query_as::<_, StockRow>(
            "SELECT name, price, quantity FROM products WHERE id = ?",
        )
        .bind(&product_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Product {product_id} not found")))?;

        if product.quantity < extra.quantity {
            return Err(AppError::conflict(format!(
                "Not enough stock for {} ({} available)",
                product.name, product.quantity
            )));
        }

        sqlx::query("UPDATE products SET quantity = quantity - ?, updated_at = ? WHERE id = ?")
            .bind(extra.quantity)
            .bind(Utc::now())
            .bind(&product_id)
            .execute(&mut *conn)
            .await?;

        return Ok(PendingLine {
            product_id: Some(product_id),
            service_id: None,
            description: Some(product.name),
            quantity: extra.quantity,
            unit_price: product.price,
        });
    }

    let description = extra
        .description
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::validation("Custom lines need a description"))?;
    let unit_price = match extra.unit_price {
        Some(price) if price >= 0.0 && price.is_finite() => price,
        _ => {
            return Err(AppError::validation(
                "Custom lines need a non-negative unit price",
            ))
        }
    };

    Ok(PendingLine {
        product_id: None,
        service_id: None,
        description: Some(description),
        quantity: extra.quantity,
        unit_price,
    })
}

const HEADER_COLUMNS: &str = "id, appointment_id, client_name, client_document, client_phone, \
     client_email, issued_at, subtotal, tax, total, notes";

pub async fn fetch_header(pool: &SqlitePool, invoice_id: &str) -> AppResult<Option<InvoiceHeaderRow>> {
    let header = sqlx::query_as::<_, InvoiceHeaderRow>(&format!(
        "SELECT {HEADER_COLUMNS} FROM invoices WHERE id = ?"
    ))
    .bind(invoice_id)
    .fetch_optional(pool)
    .await?;
    Ok(header)
}

pub async fn fetch(pool: &SqlitePool, invoice_id: &str) -> AppResult<Option<Invoice>> {
    match fetch_header(pool, invoice_id).await? {
        Some(header) => Ok(Some(with_lines(pool, header).await?)),
        None => Ok(None),
    }
}

pub async fn fetch_for_appointment(
    pool: &SqlitePool,
    appointment_id: &str,
) -> AppResult<Option<Invoice>> {
    let header = sqlx::query_as::<_, InvoiceHeaderRow>(&format!(
        "SELECT {HEADER_COLUMNS} FROM invoices WHERE appointment_id = ?"
    ))
    .bind(appointment_id)
    .fetch_optional(pool)
    .await?;

    match header {
        Some(header) => Ok(Some(with_lines(pool, header).await?)),
        None => Ok(None),
    }
}

async fn with_lines(pool: &SqlitePool, header: InvoiceHeaderRow) -> AppResult<Invoice> {
    let lines = sqlx::query_as::<_, InvoiceLineRow>(
        r#"SELECT l.id, l.position, l.product_id, l.service_id, l.description,
                  l.quantity, l.unit_price, l.subtotal,
                  COALESCE(p.name, s.name, l.description) AS item_name,
                  CASE
                      WHEN l.product_id IS NOT NULL THEN 'product'
                      WHEN l.service_id IS NOT NULL THEN 'service'
                      ELSE 'custom'
                  END AS item_kind
           FROM invoice_lines l
           LEFT JOIN products p ON p.id = l.product_id
           LEFT JOIN services s ON s.id = l.service_id
           WHERE l.invoice_id = ?
           ORDER BY l.position"#,
    )
    .bind(&header.id)
    .fetch_all(pool)
    .await?;

    Ok(Invoice { header, lines })
}

pub async fn list(pool: &SqlitePool) -> AppResult<Vec<InvoiceSummaryRow>> {
    let rows = sqlx::query_as::<_, InvoiceSummaryRow>(
        r#"SELECT id, appointment_id, client_name, client_document, issued_at, total
           FROM invoices
           ORDER BY issued_at DESC"#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
