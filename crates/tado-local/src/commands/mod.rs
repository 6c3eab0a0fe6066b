//! Command handlers, one module per subcommand.

pub mod config_cmd;
pub mod devices;
pub mod history;
pub mod pairings;
pub mod run;
pub mod set;
pub mod status;
pub mod util;
pub mod zones;

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

/// Route a bridge command to its handler.
pub async fn dispatch(cmd: Command, global: &GlobalOpts) -> Result<(), CliError> {
    match cmd {
        Command::Run(args) => run::handle(args, global).await,
        Command::Status => status::handle(global).await,
        Command::Devices => devices::handle(global).await,
        Command::Zones => zones::handle(global).await,
        Command::History(args) => history::handle(args, global).await,
        Command::Set(args) => set::handle(args, global).await,
        Command::Pairings(args) => pairings::handle(args, global).await,
        Command::Config(_) | Command::Completions(_) => Ok(()),
    }
}
