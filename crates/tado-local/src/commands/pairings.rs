//! `pairings`: stored gateway credentials.

use tabled::Tabled;

use tado_local_core::db::{Database, StoredPairing};

use crate::cli::{GlobalOpts, PairingsArgs, PairingsCommand};
use crate::config;
use crate::error::CliError;
use crate::output;

#[derive(Tabled)]
struct PairingRow {
    #[tabled(rename = "Gateway")]
    address: String,
    #[tabled(rename = "Paired")]
    created: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl From<&StoredPairing> for PairingRow {
    fn from(p: &StoredPairing) -> Self {
        Self {
            address: p.gateway_address.clone(),
            created: p.created_at.format("%Y-%m-%d %H:%M").to_string(),
            updated: p.updated_at.format("%Y-%m-%d %H:%M").to_string(),
        }
    }
}

pub async fn handle(args: PairingsArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = config::load(global)?;
    let db = Database::open(cfg.state_path()).await?;

    let result = match args.command {
        PairingsCommand::List => list(&db, global).await,
        PairingsCommand::Clear { address } => clear(&db, address.as_deref(), global).await,
    };
    db.close().await;
    result
}

async fn list(db: &Database, global: &GlobalOpts) -> Result<(), CliError> {
    let pairings = db.list_pairings().await?;
    let out = output::render_list(global.output, &pairings, |p| PairingRow::from(p), |p| {
        p.gateway_address.clone()
    })?;
    output::print_output(&out, global.quiet);
    Ok(())
}

async fn clear(db: &Database, address: Option<&str>, global: &GlobalOpts) -> Result<(), CliError> {
    let removed = db.clear_pairings(address).await?;
    let scope = address.map_or_else(|| "all gateways".to_owned(), |a| format!("gateway {a}"));
    output::print_output(&format!("Removed {removed} pairing(s) for {scope}"), global.quiet);
    Ok(())
}
