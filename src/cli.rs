use crate::config::DEFAULT_CONFIG_FILE;
use crate::state::types::CertificateRecord;
use crate::time::humanize_relative_millis;
use clap::{Parser, Subcommand};
use std::fmt::Write;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct CommandLineArguments {
    /// Path to the configuration file. It is created with default settings if it does not exist.
    #[arg(short, long, env = "CERTSTEWARD_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// Shorthand option to enable debug logging (logging can be fine-tuned via `CERTSTEWARD_LOG` environment variable)
    #[clap(long, short, action)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the HTTP API, the job worker and the daily renewal sweep (default)
    Serve,
    /// List stored certificates
    List,
    /// Run one renewal sweep and exit
    Renew,
}

/// One line per certificate, for the `list` command.
pub fn format_certificates(records: &[CertificateRecord]) -> String {
    if records.is_empty() {
        return "No certificates stored\n".to_string();
    }
    let mut out = String::new();
    for record in records {
        let _ = writeln!(
            out,
            "{}\n\tDomains: {}\n\tAccount: {}\n\tExpires: {}",
            record.main,
            record.domains().collect::<Vec<_>>().join(", "),
            record.email,
            humanize_relative_millis(record.not_after_ts),
        );
    }
    out
}
