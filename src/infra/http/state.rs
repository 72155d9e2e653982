use crate::application::{
    hydration::HydrationService, maintenance::MaintenanceService, resolver::RequestResolver,
    users::UserService,
};

#[derive(Clone)]
pub struct AppState {
    pub resolver: RequestResolver,
    pub maintenance: MaintenanceService,
    /// Absent when no default account code is configured.
    pub hydration: Option<HydrationService>,
    /// Absent when the credential check is disabled.
    pub users: Option<UserService>,
}
