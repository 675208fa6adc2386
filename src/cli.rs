use std::path::PathBuf;

use clap::Parser;

use crate::config::{ErrorPolicy, MonitorConfig};

#[derive(Parser, Debug)]
#[command(name = "treewatch")]
#[command(version)]
#[command(about = "Watch configured paths and print one line per matching filesystem event")]
#[command(long_about = "treewatch registers every directory under each configured target, up to the target's depth, \
and prints `<time> <KIND>: <path>` for each create, delete, rename, write or permission change that matches \
the target's event filter. New directories are picked up as they appear.")]
pub struct Cli {
    /// Target list (YAML, TOML or JSON)
    #[arg(short = 't', long = "config", value_name = "FILE", help = "Path to the target list (defaults to config.yml next to the executable)")]
    pub config: Option<PathBuf>,

    /// Append event lines to this file instead of stdout
    #[arg(short, long, value_name = "FILE", help = "Output file (defaults to stdout)")]
    pub output: Option<PathBuf>,

    /// Maximum directory registrations in flight
    #[arg(short = 'n', long, value_name = "N", help = "Parallel registration limit")]
    pub max_parallel: Option<usize>,

    /// What to do when the OS watcher reports an error
    #[arg(long, value_name = "POLICY", help = "stop (default) or continue")]
    pub on_error: Option<ErrorPolicy>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,

    /// Resolve the config, print targets and directories, then exit
    #[arg(long, help = "Validate the config and show what would be watched")]
    pub check: bool,
}

impl Cli {
    pub fn get_config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.join("config.yml")))
                .unwrap_or_else(|| PathBuf::from("config.yml"))
        })
    }

    /// Environment defaults with command-line flags on top.
    pub fn monitor_config(&self) -> MonitorConfig {
        let mut config = MonitorConfig::from_env();
        if let Some(n) = self.max_parallel {
            config.max_parallel = n;
        }
        if let Some(ref output) = self.output {
            config.output = Some(output.clone());
        }
        if let Some(policy) = self.on_error {
            config.on_error = policy;
        }
        config
    }

    /// Logs go to stderr; stdout carries event lines.
    pub fn setup_logging(&self) {
        let level = if self.verbose {
            tracing::Level::DEBUG
        } else {
            std::env::var("TREEWATCH_LOG")
                .ok()
                .and_then(|s| s.trim().parse::<tracing::Level>().ok())
                .unwrap_or(tracing::Level::INFO)
        };

        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(std::io::stderr)
            .init();
    }

    pub fn validate(&self) -> Result<(), String> {
        let path = self.get_config_path();

        if !path.exists() {
            return Err(format!("Config file does not exist: {}", path.display()));
        }

        if !path.is_file() {
            return Err(format!("Config path is not a file: {}", path.display()));
        }

        if self.max_parallel == Some(0) {
            return Err("Max parallel must be greater than 0".to_string());
        }

        Ok(())
    }
}
