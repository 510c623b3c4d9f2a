use cirrusd::config::DaemonConfig;
use cirrusd::daemon::DaemonRuntime;
use cirrusd::storage::CredentialStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Logout,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--logout" => mode = CliMode::Logout,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    match parse_cli_mode(std::env::args())? {
        CliMode::Logout => {
            let store = CredentialStore::new()?;
            store.clear()?;
            eprintln!("[cirrusd] saved session removed");
            return Ok(());
        }
        CliMode::Help => {
            println!("Usage: cirrusd [--logout]");
            println!("  --logout   Remove the saved session and exit");
            return Ok(());
        }
        CliMode::Run => {}
    }
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}
