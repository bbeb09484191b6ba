use clap::Subcommand;
use cohort_core::{amount_label, Catalog};

#[derive(Subcommand)]
pub enum CatalogAction {
    /// Print the module and tier tables
    Show,
    /// Validate catalog consistency
    Check,
}

pub fn run(action: CatalogAction) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = Catalog::standard();
    match action {
        CatalogAction::Show => {
            println!("modules:");
            for module in catalog.modules {
                let activities: Vec<&str> =
                    module.activities.iter().map(|a| a.name).collect();
                println!(
                    "  {:<18} {:<12} days {}-{}  shift {:>2}h  {}",
                    module.name,
                    module.phase.to_string(),
                    module.start_day,
                    module.end_day,
                    module.shift_hour,
                    activities.join(", "),
                );
            }
            println!("tiers:");
            for (idx, tier) in catalog.tiers.iter().enumerate() {
                println!(
                    "  {}  {:<4} days {}-{}  needs {} x {} (+{}d leniency)",
                    idx + 1,
                    amount_label(tier.amount_usd),
                    tier.start_day,
                    tier.end_day,
                    tier.min_evidence,
                    tier.evidence_activity,
                    tier.leniency_days,
                );
            }
        }
        CatalogAction::Check => {
            catalog.validate()?;
            println!(
                "catalog ok: {} modules, {} tiers",
                catalog.modules.len(),
                catalog.tiers.len()
            );
        }
    }
    Ok(())
}
