//! CLI command implementations.
//!
//! | Module      | Commands handled                         |
//! |-------------|------------------------------------------|
//! | `serve`     | `Serve`                                  |
//! | `store`     | `Init`, `MigrationSql`, `Status`         |
//! | `dashboard` | `Dashboard`                              |
//! | `config`    | `Config`                                 |

pub mod config;
pub mod dashboard;
pub mod serve;
pub mod store;

pub use config::cmd_config;
pub use dashboard::cmd_dashboard;
pub use serve::cmd_serve;
pub use store::{cmd_init, cmd_migration_sql, cmd_status};
