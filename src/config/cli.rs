use clap::{Parser, Subcommand};
use std::{fs, path::Path, path::PathBuf};

use super::config::ConfigError;
use super::types::LogLevel;

// -----------------------------------------------------------------------------
// ----- CliConfig -------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CliConfig {
    pub config_file_location: Option<PathBuf>,
    pub log_level: LogLevel,
    pub command: Command,
}

impl CliConfig {
    /// Exits the process with clap's usage message on bad arguments.
    pub fn from_args() -> Self {
        Self::from_parsed(Args::parse())
    }

    pub fn try_from_iter<I, T>(iter: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Args::try_parse_from(iter).map(Self::from_parsed)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.config_file_location {
            Some(path) => must_exist_file(path),
            None => Ok(()),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- CliConfig: Private ----------------------------------------------------

impl CliConfig {
    fn from_parsed(args: Args) -> Self {
        Self {
            config_file_location: args.config_file,
            log_level: args.log_level,
            command: args.command,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Args ------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gatelink", version, about = "Brokerage gateway connectivity toolkit")]
struct Args {
    // Not required via CLI or ENV (defaults to info).
    #[arg(long = "log", default_value = "info", global = true)]
    log_level: LogLevel,

    // Optional; built-in defaults apply without it.
    #[arg(long = "config", env = "GATELINK_CONFIG_FILE", global = true)]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Classify a gateway error code and message.
    Classify {
        #[arg(allow_negative_numbers = true)]
        code: i32,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        message: Vec<String>,
    },

    /// Load the config file and print the effective settings.
    Check,
}

// -----------------------------------------------------------------------------
// ----- Private Utils ---------------------------------------------------------

fn must_exist_file(path: &Path) -> Result<(), ConfigError> {
    let md = fs::metadata(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    if !md.is_file() {
        return Err(ConfigError::InvalidField(format!(
            "--config: {} is not a file",
            path.display()
        )));
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_collects_message_words() {
        let cli = CliConfig::try_from_iter([
            "gatelink",
            "--log",
            "debug",
            "classify",
            "-1",
            "Socket",
            "connection",
            "lost",
        ])
        .unwrap();

        assert_eq!(cli.log_level, LogLevel::Debug);
        assert_eq!(
            cli.command,
            Command::Classify {
                code: -1,
                message: vec!["Socket".into(), "connection".into(), "lost".into()],
            }
        );
    }

    #[test]
    fn check_accepts_config_after_subcommand() {
        let cli = CliConfig::try_from_iter(["gatelink", "check", "--config", "/tmp/gatelink.toml"])
            .unwrap();

        assert_eq!(cli.command, Command::Check);
        assert_eq!(cli.log_level, LogLevel::Info);
        assert_eq!(
            cli.config_file_location,
            Some(PathBuf::from("/tmp/gatelink.toml"))
        );
    }

    #[test]
    fn missing_config_file_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let cli = CliConfig {
            config_file_location: Some(dir.path().join("missing.toml")),
            log_level: LogLevel::Info,
            command: Command::Check,
        };
        assert!(matches!(cli.validate(), Err(ConfigError::Io { .. })));

        let cli = CliConfig {
            config_file_location: Some(dir.path().to_path_buf()),
            ..cli
        };
        assert!(matches!(cli.validate(), Err(ConfigError::InvalidField(_))));
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
