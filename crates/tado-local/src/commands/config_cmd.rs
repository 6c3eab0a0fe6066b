//! Config subcommand handlers.

use tado_local_config::Config;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, OutputFormat};
use crate::config;
use crate::error::CliError;
use crate::output;

const MASK: &str = "****";

/// Copy of `cfg` with secrets masked.
fn redacted(cfg: &Config) -> Config {
    let mut cfg = cfg.clone();
    if cfg.gateway.setup_code.is_some() {
        cfg.gateway.setup_code = Some(MASK.into());
    }
    if cfg.cloud.refresh_token.is_some() {
        cfg.cloud.refresh_token = Some(MASK.into());
    }
    cfg
}

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Show => {
            let cfg = redacted(&config::load(global)?);
            let out = match global.output {
                OutputFormat::Json => serde_json::to_string_pretty(&cfg)?,
                OutputFormat::JsonCompact => serde_json::to_string(&cfg)?,
                OutputFormat::Table | OutputFormat::Plain => toml::to_string_pretty(&cfg)?,
            };
            output::print_output(out.trim_end(), global.quiet);
            Ok(())
        }

        ConfigCommand::Path => {
            output::print_output(&config::config_path(global).display().to_string(), global.quiet);
            Ok(())
        }

        ConfigCommand::SetCloudToken { token, plaintext } => {
            let token = token.trim();
            if token.is_empty() {
                return Err(CliError::Validation {
                    field: "token".into(),
                    reason: "must not be empty".into(),
                });
            }

            let path = config::config_path(global);
            // Raw file contents: flag overrides must not be persisted.
            let mut cfg = tado_local_config::load_config_from(&path)?;
            cfg.cloud.enabled = true;
            if plaintext {
                cfg.cloud.refresh_token = Some(token.to_owned());
            } else {
                config::store_refresh_token(token)?;
                cfg.cloud.refresh_token = None;
            }
            config::save_config_to(&cfg, &path)?;

            let location = if plaintext { "config file" } else { "system keyring" };
            tracing::info!(path = %path.display(), "cloud sync enabled");
            output::print_output(&format!("Refresh token stored in the {location}"), global.quiet);
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_masked() {
        let mut cfg = Config::default();
        cfg.gateway.setup_code = Some("123-45-678".into());
        cfg.cloud.refresh_token = Some("secret-refresh".into());

        let shown = toml::to_string_pretty(&redacted(&cfg)).unwrap();
        assert!(!shown.contains("secret-refresh"));
        assert!(!shown.contains("123-45-678"));
        assert!(shown.contains(MASK));
    }

    #[test]
    fn absent_secrets_stay_absent() {
        let shown = redacted(&Config::default());
        assert_eq!(shown.cloud.refresh_token, None);
        assert_eq!(shown.gateway.setup_code, None);
    }
}
