use anyhow::Context;
use mimir_syncd::config::MirrorConfig;
use mimir_syncd::daemon::DaemonRuntime;
use mimir_syncd::logging;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: mimir-syncd [--once]");
        println!("  --once     Run one reconciliation pass, print its report and exit");
        println!();
        println!("Configuration: $MIMIR_CONFIG or {}", MirrorConfig::default_path().display());
        return Ok(());
    }

    let (config, config_path) = MirrorConfig::from_env().context("failed to load configuration")?;
    logging::init(config.log_file.as_deref())?;
    let daemon = DaemonRuntime::bootstrap(config, config_path).await?;

    match mode {
        CliMode::Once => match daemon.run_once().await {
            Ok(report) => {
                println!("{}", serde_json::to_string_pretty(&report)?);
                if report.failed > 0 {
                    std::process::exit(1);
                }
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "pass failed");
                Err(err)
            }
        },
        _ => daemon.run().await,
    }
}
