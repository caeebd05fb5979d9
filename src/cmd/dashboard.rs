//! Pipeline summary command for `wexlot dashboard`.

use anyhow::Result;
use wexlot_crm::config::CrmToml;
use wexlot_crm::crm::dashboard;

use super::store::load_once;

pub async fn cmd_dashboard(config: &CrmToml) -> Result<()> {
    let (sync, _incidents) = load_once(config).await?;
    let snapshot = sync.snapshot();
    let stats = dashboard::compute(
        &snapshot.deals,
        &snapshot.activities,
        &snapshot.staff,
        &snapshot.interactions,
    );

    println!();
    println!("{}", console::style("Pipeline").bold().cyan());
    println!("  Total pipeline value: {:.2}", stats.total_pipeline_value);
    println!("  Weighted forecast:    {:.2}", stats.weighted_forecast);
    println!("  Active deals:         {}", stats.active_deals);
    println!();

    if stats.by_rep.is_empty() {
        println!("  No staff yet.");
    } else {
        println!("{:<24} {:>14} {:>10}", "Rep", "Pipeline", "Completed");
        println!("{:<24} {:>14} {:>10}", "-".repeat(24), "-".repeat(14), "-".repeat(10));
        for rep in &stats.by_rep {
            println!(
                "{:<24} {:>14.2} {:>10}",
                rep.name, rep.pipeline_value, rep.activity_count
            );
        }
    }

    if !stats.recent_interactions.is_empty() {
        println!();
        println!("{}", console::style("Recent interactions").bold());
        for interaction in &stats.recent_interactions {
            println!(
                "  {} {:<8} {}",
                console::style(&interaction.date).dim(),
                interaction.interaction_type.as_str(),
                interaction.notes.as_deref().unwrap_or("")
            );
        }
    }
    println!();
    Ok(())
}
