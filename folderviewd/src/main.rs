use folderviewd::daemon::{DaemonConfig, DaemonRuntime};
use folderviewd::logging::init_tracing;

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
        println!("Usage: folderviewd [--once]");
        println!("  --once     Reload the configured folder once and exit");
        println!();
        println!("Configuration is read from FOLDERVIEW_* environment variables");
        println!("(FOLDERVIEW_BASE_URL and FOLDERVIEW_TOKEN are required).");
        return Ok(());
    }

    init_tracing();
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Once => {
            daemon.run_once().await?;
            daemon.shutdown().await
        }
        _ => daemon.run().await,
    }
}
