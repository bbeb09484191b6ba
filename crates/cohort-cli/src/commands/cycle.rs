use std::path::Path;
use std::time::Duration;

use clap::Subcommand;
use cohort_core::{Catalog, Runner, SystemClock};

use crate::commands::services;

#[derive(Subcommand)]
pub enum CycleAction {
    /// Run one sweep over the roster and print the report
    Run,
    /// Run sweeps forever on a fixed interval
    Watch {
        /// Minutes between sweeps
        #[arg(long, default_value_t = 15)]
        interval_mins: u64,
    },
}

pub fn run(action: CycleAction, config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    let _guard = rt.enter();

    let svc = services(config_path)?;
    let clock = SystemClock;
    let runner = Runner::new(
        &svc.store,
        &svc.directory,
        &svc.gateway,
        &svc.ops,
        &clock,
        &svc.config,
        Catalog::standard(),
    );

    match action {
        CycleAction::Run => {
            let report = runner.run_cycle()?;
            println!("{}", report.render());
        }
        CycleAction::Watch { interval_mins } => loop {
            match runner.run_cycle() {
                Ok(report) => println!("{}", report.render()),
                Err(e) => tracing::error!("cycle failed: {e}"),
            }
            std::thread::sleep(Duration::from_secs(interval_mins * 60));
        },
    }
    Ok(())
}
