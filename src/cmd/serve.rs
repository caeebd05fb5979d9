//! Admin server command for `wexlot serve`.

use anyhow::Result;
use wexlot_crm::config::CrmToml;

pub async fn cmd_serve(mut config: CrmToml, port: Option<u16>, dev: bool) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if dev {
        config.server.dev_mode = true;
    }
    wexlot_crm::crm::server::start_server(&config).await
}
