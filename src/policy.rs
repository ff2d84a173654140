//! Role policy for every protected operation.
//!
//! Handlers call [`authorize`] before touching the database. Ownership rules
//! (a client acting on their own appointment) are checked by the handler
//! afterwards.

use crate::{
    auth::AuthUser,
    error::{AppError, AppResult},
    models::Role,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateAppointment,
    ViewAppointment,
    ListAllAppointments,
    UpdateAppointment,
    ConfirmAppointment,
    RejectAppointment,
    CancelAppointment,
    FinalizeAppointment,
    GenerateInvoice,
    ViewInvoice,
    ListInvoices,
    ManageCatalog,
    CreateUser,
    ListUsers,
    ViewInventoryAlerts,
    ResolveInventoryAlert,
    ViewAuditTrail,
    ViewClientStatistics,
    ViewPriceHistory,
    ViewAppointmentReport,
}

const ANY: &[Role] = &[Role::Admin, Role::Employee, Role::Client];
const ADMIN: &[Role] = &[Role::Admin];
const STAFF: &[Role] = &[Role::Admin, Role::Employee];
const ADMIN_OR_CLIENT: &[Role] = &[Role::Admin, Role::Client];

impl Operation {
    pub fn allowed_roles(self) -> &'static [Role] {
        use Operation::*;
        match self {
            CreateAppointment | ViewAppointment | ViewInvoice => ANY,
            ListAllAppointments | UpdateAppointment | ConfirmAppointment | RejectAppointment => {
                ADMIN
            }
            CancelAppointment => ADMIN_OR_CLIENT,
            FinalizeAppointment | GenerateInvoice => STAFF,
            ListInvoices | ManageCatalog | CreateUser | ViewAuditTrail => ADMIN,
            ListUsers
            | ViewInventoryAlerts
            | ResolveInventoryAlert
            | ViewClientStatistics
            | ViewPriceHistory
            | ViewAppointmentReport => STAFF,
        }
    }

    fn label(self) -> &'static str {
        use Operation::*;
        match self {
            CreateAppointment => "create appointments",
            ViewAppointment => "view appointments",
            ListAllAppointments => "list all appointments",
            UpdateAppointment => "update appointments",
            ConfirmAppointment => "confirm appointments",
            RejectAppointment => "reject appointments",
            CancelAppointment => "cancel appointments",
            FinalizeAppointment => "finalize appointments",
            GenerateInvoice => "generate invoices",
            ViewInvoice => "view invoices",
            ListInvoices => "list invoices",
            ManageCatalog => "manage the catalog",
            CreateUser => "create users",
            ListUsers => "list users",
            ViewInventoryAlerts => "view inventory alerts",
            ResolveInventoryAlert => "resolve inventory alerts",
            ViewAuditTrail => "view the audit trail",
            ViewClientStatistics => "view client statistics",
            ViewPriceHistory => "view price history",
            ViewAppointmentReport => "view appointment reports",
        }
    }
}

pub fn is_allowed(role: Role, operation: Operation) -> bool {
    operation.allowed_roles().contains(&role)
}

/// Staff may act on any record; a client only on records they own.
pub fn ensure_owner_or_staff(user: &AuthUser, owner_id: Option<&str>) -> AppResult<()> {
    if user.role != Role::Client || owner_id == Some(user.id.as_str()) {
        Ok(())
    } else {
        log::warn!("User {} denied access to a record owned by someone else", user.id);
        Err(AppError::forbidden("You can only access your own appointments"))
    }
}

pub fn authorize(user: &AuthUser, operation: Operation) -> AppResult<()> {
    if is_allowed(user.role, operation) {
        Ok(())
    } else {
        log::warn!(
            "User {} ({}) denied: {}",
            user.id,
            user.role,
            operation.label()
        );
        Err(AppError::forbidden(format!(
            "Role {} is not allowed to {}",
            user.role,
            operation.label()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: Role) -> AuthUser {
        AuthUser {
            id: "u-1".to_string(),
            name: "Tester".to_string(),
            role,
        }
    }

    #[test]
    fn lifecycle_operations_follow_the_role_table() {
        let table = [
            (Operation::ConfirmAppointment, vec![Role::Admin]),
            (Operation::RejectAppointment, vec![Role::Admin]),
            (Operation::CancelAppointment, vec![Role::Admin, Role::Client]),
            (Operation::FinalizeAppointment, vec![Role::Admin, Role::Employee]),
            (Operation::UpdateAppointment, vec![Role::Admin]),
        ];
        for (operation, permitted) in table {
            for role in Role::ALL {
                assert_eq!(
                    is_allowed(role, operation),
                    permitted.contains(&role),
                    "{operation:?} for {role}"
                );
            }
        }
    }

    #[test]
    fn authorize_returns_forbidden_for_other_roles() {
        let err = authorize(&user(Role::Employee), Operation::ConfirmAppointment).unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        assert!(authorize(&user(Role::Admin), Operation::ConfirmAppointment).is_ok());
    }

    #[test]
    fn catalog_writes_are_admin_only() {
        assert!(is_allowed(Role::Admin, Operation::ManageCatalog));
        assert!(!is_allowed(Role::Employee, Operation::ManageCatalog));
        assert!(!is_allowed(Role::Client, Operation::ManageCatalog));
    }

    #[test]
    fn clients_only_reach_their_own_records() {
        let client = user(Role::Client);
        assert!(ensure_owner_or_staff(&client, Some("u-1")).is_ok());
        assert!(ensure_owner_or_staff(&client, Some("u-2")).is_err());
        assert!(ensure_owner_or_staff(&client, None).is_err());
        assert!(ensure_owner_or_staff(&user(Role::Employee), Some("u-2")).is_ok());
    }
}
