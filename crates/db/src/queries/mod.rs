pub mod components;
pub mod dispatches;
pub mod maintenances;
pub mod pages;
pub mod status_reports;
pub mod subscriptions;
