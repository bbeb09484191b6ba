use std::path::Path;

use clap::Subcommand;
use cohort_core::clock::format_ms;
use cohort_core::store::{
    self, Subject, KEY_GROUP, KEY_LEDGER, KEY_MODULES, KEY_PHASES, KEY_QUALITY,
};
use cohort_core::{ActivityDirectory, PhaseRecord};
use serde_json::json;

use crate::commands::services;

#[derive(Subcommand)]
pub enum ParticipantAction {
    /// Roster with current phase
    List,
    /// All stored study documents for one participant
    Status {
        /// Participant identifier
        id: String,
    },
}

pub fn run(
    action: ParticipantAction,
    config_path: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    let _guard = rt.enter();
    let svc = services(config_path)?;

    match action {
        ParticipantAction::List => {
            let roster = svc.directory.participants()?;
            if roster.is_empty() {
                println!("no participants");
                return Ok(());
            }
            for id in roster {
                let record: Option<PhaseRecord> =
                    store::fetch(&svc.store, Subject::Participant(&id), KEY_PHASES)?;
                match record {
                    Some(r) => {
                        let since = r
                            .entered_ms(r.status)
                            .map(format_ms)
                            .unwrap_or_else(|| "unknown".into());
                        println!("{id:<24} {:<13} since {since}", r.status);
                    }
                    None => println!("{id:<24} never seen"),
                }
            }
        }
        ParticipantAction::Status { id } => {
            let subject = Subject::Participant(&id);
            let phases: Option<serde_json::Value> = store::fetch(&svc.store, subject, KEY_PHASES)?;
            if phases.is_none() {
                eprintln!("no phase record for {id}");
                std::process::exit(1);
            }
            let modules: Option<serde_json::Value> =
                store::fetch(&svc.store, subject, KEY_MODULES)?;
            let ledger: Option<serde_json::Value> = store::fetch(&svc.store, subject, KEY_LEDGER)?;
            let quality: Option<serde_json::Value> =
                store::fetch(&svc.store, subject, KEY_QUALITY)?;
            let group: Option<u32> = store::fetch(&svc.store, subject, KEY_GROUP)?;
            let doc = json!({
                "participant": id,
                "phases": phases,
                "modules": modules,
                "ledger": ledger,
                "quality": quality,
                "group": group,
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
    }
    Ok(())
}
