use anyhow::Context;
use certsteward::cli::{Command, CommandLineArguments, format_certificates};
use certsteward::config;
use certsteward::daemon::Steward;
use certsteward::state::{CertificateStore, Database};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const ENV_FILTER_NAME: &str = "CERTSTEWARD_LOG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CommandLineArguments::parse();
    let filter = EnvFilter::try_from_env(ENV_FILTER_NAME).unwrap_or_else(|_| {
        EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| {
            EnvFilter::new(if cli.verbose {
                "certsteward=debug,info"
            } else {
                "info"
            })
        })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let config = config::load(&cli.config).context(format!(
        "Loading configuration from {}",
        cli.config.display()
    ))?;
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let steward = Steward::open(config).await?;
            let shutdown = CancellationToken::new();
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Cannot listen for Ctrl-C: {e}");
                        return;
                    }
                    info!("Shutting down, finishing queued jobs");
                    shutdown.cancel();
                }
            });
            steward.serve(shutdown).await
        }
        Command::List => {
            let database = Database::open(&config.database).await?;
            let certificates = database.list_certificates().await?;
            print!("{}", format_certificates(&certificates));
            database.close().await;
            Ok(())
        }
        Command::Renew => {
            let steward = Steward::open(config).await?;
            let report = steward.renew_once().await?;
            println!("Renewal sweep: {report}");
            Ok(())
        }
    }
}
