use std::path::Path;

use clap::Subcommand;
use cohort_core::pool::{load_pool, save_pool};
use cohort_core::store::{self, Subject, KEY_GIFT_CODES};
use cohort_core::{amount_label, Catalog, GiftCodePool};

use crate::commands::services;

#[derive(Subcommand)]
pub enum PoolAction {
    /// Remaining codes per denomination
    Status,
    /// Add gift codes to one denomination
    Add {
        /// Dollar amount of every listed code
        #[arg(long)]
        amount: u32,
        /// Codes to append, oldest-first
        #[arg(required = true)]
        codes: Vec<String>,
    },
}

pub fn run(action: PoolAction, config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    let _guard = rt.enter();
    let svc = services(config_path)?;

    match action {
        PoolAction::Status => {
            let pool: GiftCodePool =
                store::fetch(&svc.store, Subject::Study, KEY_GIFT_CODES)?.unwrap_or_default();
            let levels = pool.levels();
            if levels.is_empty() {
                println!("pool is empty");
                return Ok(());
            }
            for (label, count) in levels {
                println!("{label:<6} {count} remaining");
            }
        }
        PoolAction::Add { amount, codes } => {
            let label = amount_label(amount);
            if !Catalog::standard()
                .tiers
                .iter()
                .any(|t| t.amount_usd == amount)
            {
                eprintln!("note: no incentive tier pays {label}");
            }
            let added = codes.len();
            let mut pool = load_pool(&svc.store)?;
            pool.add(&label, codes);
            save_pool(&svc.store, &pool)?;
            println!("added {added} codes; {label} now holds {}", pool.count(&label));
        }
    }
    Ok(())
}
