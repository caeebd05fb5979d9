//! WeXlot CRM: store access, refetch-on-write sync, derived views and the
//! admin HTTP/WebSocket surface.

pub mod actions;
pub mod api;
pub mod dashboard;
pub mod dto;
pub mod incidents;
pub mod models;
pub mod pipeline;
pub mod quick_add;
pub mod schema;
pub mod server;
pub mod store;
pub mod sync;
pub mod views;
pub mod ws;

pub use actions::Crm;
pub use sync::{CrmSync, Snapshot};
