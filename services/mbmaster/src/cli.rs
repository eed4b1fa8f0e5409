//! Command-line arguments

use std::path::PathBuf;

use clap::Parser;

use crate::core::config::Overrides;

#[derive(Parser, Debug, Clone)]
#[command(name = "mbmaster", version, about = "Modbus master gateway")]
pub struct Args {
    /// Service configuration file (YAML, TOML or JSON)
    #[arg(short = 'c', long, env = "MBMASTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Persisted connection tree; overrides `state.path`
    #[arg(short = 's', long)]
    pub state: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides `logging.level`
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Validation mode - load and validate the connection tree, then exit
    #[arg(long)]
    pub validate: bool,
}

impl Args {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            state_path: self.state.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let args = Args::try_parse_from([
            "mbmaster",
            "--config",
            "/etc/mbmaster.yaml",
            "-s",
            "tree.json",
            "--log-level",
            "debug",
            "--validate",
        ])
        .unwrap();
        assert!(args.validate);
        let overrides = args.overrides();
        assert_eq!(overrides.state_path, Some(PathBuf::from("tree.json")));
        assert_eq!(overrides.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["mbmaster"]).unwrap();
        assert!(!args.validate);
        assert!(args.state.is_none());
    }
}
