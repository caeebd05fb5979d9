pub mod auth;
pub mod config;
pub mod crm;
pub mod errors;
pub mod logging;
