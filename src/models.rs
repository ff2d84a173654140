use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Employee,
    Client,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Employee => "employee",
            Role::Client => "client",
        }
    }
}

#[cfg(test)]
impl Role {
    pub const ALL: [Role; 3] = [Role::Admin, Role::Employee, Role::Client];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Rejected,
    Cancelled,
    Finalized,
}

impl AppointmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Rejected => "rejected",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Finalized => "finalized",
        }
    }

    /// No transition leaves these states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AppointmentStatus::Rejected | AppointmentStatus::Cancelled | AppointmentStatus::Finalized
        )
    }
}

#[cfg(test)]
impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 5] = [
        AppointmentStatus::Pending,
        AppointmentStatus::Confirmed,
        AppointmentStatus::Rejected,
        AppointmentStatus::Cancelled,
        AppointmentStatus::Finalized,
    ];
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub name: String,
    pub email: String,
    pub id_document: String,
    pub phone: String,
    pub password_hash: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A user as exposed over the API, without the password hash.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub email: String,
    pub id_document: String,
    pub phone: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ServiceRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProductRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub quantity: i64,
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AppointmentRow {
    pub id: String,
    pub user_id: Option<String>,
    pub service_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub staff_id: Option<String>,
    pub cancellation_reason: Option<String>,
    pub guest_name: Option<String>,
    pub guest_document: Option<String>,
    pub guest_phone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const APPOINTMENT_COLUMNS: &str = "id, user_id, service_id, scheduled_at, status, staff_id, \
     cancellation_reason, guest_name, guest_document, guest_phone, created_at, updated_at";

/// Appointment joined with its service and registered client.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ClientAppointmentRow {
    pub id: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub staff_id: Option<String>,
    pub cancellation_reason: Option<String>,
    pub service_id: String,
    pub service_name: String,
    pub service_price: f64,
    pub client_id: String,
    pub client_name: String,
    pub client_document: String,
    pub client_email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GuestAppointmentRow {
    pub id: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub service_id: String,
    pub guest_name: String,
    pub guest_document: String,
    pub guest_phone: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct InvoiceHeaderRow {
    pub id: String,
    pub appointment_id: String,
    pub client_name: String,
    pub client_document: String,
    pub client_phone: Option<String>,
    pub client_email: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub subtotal: f64,
    pub tax: f64,
    pub total: f64,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct InvoiceLineRow {
    pub id: String,
    pub position: i64,
    pub product_id: Option<String>,
    pub service_id: Option<String>,
    pub description: Option<String>,
    pub quantity: i64,
    pub unit_price: f64,
    pub subtotal: f64,
    pub item_name: Option<String>,
    pub item_kind: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Invoice {
    #[serde(flatten)]
    pub header: InvoiceHeaderRow,
    pub lines: Vec<InvoiceLineRow>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct InvoiceSummaryRow {
    pub id: String,
    pub appointment_id: String,
    pub client_name: String,
    pub client_document: String,
    pub issued_at: DateTime<Utc>,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct InventoryAlertRow {
    pub id: String,
    pub product_id: String,
    pub product_name: String,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditRow {
    pub id: String,
    pub entity: String,
    pub entity_id: String,
    pub action: String,
    pub field: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub actor_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ClientStatisticsRow {
    pub client_id: String,
    pub name: String,
    pub email: String,
    pub total_appointments: i64,
    pub finalized_appointments: i64,
    pub cancelled_appointments: i64,
    pub total_spent: f64,
    pub last_appointment_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PriceChangeRow {
    pub id: String,
    pub service_id: String,
    pub service_name: String,
    pub old_price: f64,
    pub new_price: f64,
    pub change_percent: f64,
    pub reason: Option<String>,
    pub changed_at: DateTime<Utc>,
}
