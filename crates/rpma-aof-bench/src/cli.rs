use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rpma_aof_engine::EngineConfig;
use std::path::PathBuf;

use crate::workload::Workload;

#[derive(Parser)]
#[command(name = "rpma-aof")]
#[command(about = "Append-only write+flush workload over a loopback RDMA fabric", long_about = None)]
pub struct Cli {
    /// Engine configuration (.toml or .json)
    #[arg(short, long, env = "RPMA_AOF_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run an append workload and print a report
    Run {
        /// Bytes per write
        #[arg(short, long, default_value = "4096")]
        block_size: u64,
        /// Total bytes to append
        #[arg(short, long, default_value = "16777216")]
        total: u64,
        /// Request durability on every Nth write (0 = never)
        #[arg(short, long, default_value = "1")]
        durable_every: u64,
        /// Persist into this file instead of recording in memory
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Compare the workspace against the written pattern afterwards
        #[arg(long)]
        verify: bool,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

impl Cli {
    pub fn load_config(&self) -> Result<EngineConfig> {
        match &self.config {
            Some(path) => EngineConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display())),
            None => Ok(EngineConfig::default()),
        }
    }

    pub fn workload(&self) -> Option<Workload> {
        match &self.command {
            Command::Run {
                block_size,
                total,
                durable_every,
                file,
                verify,
            } => Some(Workload {
                block_size: *block_size,
                total_bytes: *total,
                durable_every: *durable_every,
                file: file.clone(),
                verify: *verify,
            }),
            Command::ShowConfig => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_run_defaults() {
        let cli = Cli::try_parse_from(["rpma-aof", "run"]).unwrap();
        let shape = cli.workload().unwrap();
        assert_eq!(shape.block_size, 4096);
        assert_eq!(shape.total_bytes, 16 << 20);
        assert_eq!(shape.durable_every, 1);
        assert!(shape.file.is_none());
        assert!(!shape.verify);
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "rpma-aof", "run", "-b", "512", "-t", "8192", "-d", "4", "--verify",
        ])
        .unwrap();
        let shape = cli.workload().unwrap();
        assert_eq!(shape.block_size, 512);
        assert_eq!(shape.total_bytes, 8192);
        assert_eq!(shape.durable_every, 4);
        assert!(shape.verify);
    }

    #[test]
    fn test_show_config_has_no_workload() {
        let cli = Cli::try_parse_from(["rpma-aof", "show-config"]).unwrap();
        assert!(cli.workload().is_none());
        assert_eq!(cli.load_config().unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_config_file_loaded() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[server]\nmax_msg_num = 8").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let cli = Cli::try_parse_from(["rpma-aof", "--config", &path, "show-config"]).unwrap();
        assert_eq!(cli.load_config().unwrap().server.max_msg_num, 8);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let cli =
            Cli::try_parse_from(["rpma-aof", "-c", "/nonexistent/aof.toml", "show-config"]).unwrap();
        assert!(cli.load_config().is_err());
    }
}
