use anyhow::Result;
use oxalert_common::types::SelfStateValue;
use oxalert_server::app::{App, SHUTDOWN_TIMEOUT};
use oxalert_server::config::ServerConfig;
use oxalert_server::logging;
use oxalert_server::seed;
use oxalert_server::selfstate;
use std::time::Instant;
use tokio::signal;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  oxalert-server [config.toml]                          Start the server");
    eprintln!("  oxalert-server init-seed <config.toml> <seed.json>    Create triggers, contacts and subscriptions from a seed file");
    eprintln!("  oxalert-server selfstate <config.toml> ok|error       Override the notifier self-state");
    eprintln!("  oxalert-server check <config.toml> <trigger_id>       Run one check of a trigger and print its state");
}

/// Loads the config and initializes logging from it.
fn load(config_path: &str) -> Result<ServerConfig> {
    let config = ServerConfig::load(config_path)?;
    logging::init(&config.log)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("init-seed") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("init-seed requires <config.toml> and <seed.json> arguments")
            })?;
            let seed_path = args.get(3).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("init-seed requires <seed.json> argument")
            })?;
            run_init_seed(config_path, seed_path)
        }
        Some("selfstate") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("selfstate requires <config.toml> and ok|error arguments")
            })?;
            let value = match args.get(3).map(|s| s.as_str()) {
                Some("ok") => SelfStateValue::Ok,
                Some("error") => SelfStateValue::Error,
                other => {
                    print_usage();
                    anyhow::bail!("selfstate expects ok or error, got {:?}", other.unwrap_or(""))
                }
            };
            run_selfstate(config_path, value)
        }
        Some("check") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("check requires <config.toml> and <trigger_id> arguments")
            })?;
            let trigger_id = args.get(3).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("check requires <trigger_id> argument")
            })?;
            run_check(config_path, trigger_id).await
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            let config_path = args
                .get(1)
                .map(|s| s.as_str())
                .unwrap_or("config/oxalert.toml");
            run_server(config_path).await
        }
    }
}

fn run_init_seed(config_path: &str, seed_path: &str) -> Result<()> {
    let config = load(config_path)?;
    let db = config.store.open()?;
    let seed = seed::load_seed_file(seed_path)?;
    let report = seed::apply_seed(&db, &seed)?;
    tracing::info!(
        created = report.created,
        skipped = report.skipped,
        invalid = report.invalid,
        "init-seed completed"
    );
    Ok(())
}

fn run_selfstate(config_path: &str, value: SelfStateValue) -> Result<()> {
    let config = load(config_path)?;
    let db = config.store.open()?;
    let state = selfstate::override_self_state(&db, value, oxalert_common::now_ts())?;
    tracing::info!(state = ?state.state, actor = ?state.actor, "Self-state updated");
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn run_check(config_path: &str, trigger_id: &str) -> Result<()> {
    let config = load(config_path)?;
    let app = App::new(config)?;
    let started = Instant::now();
    let outcome = app.check_once(trigger_id).await?;
    tracing::info!(
        trigger_id,
        events = outcome.events.len(),
        elapsed = %logging::format_elapsed(started.elapsed()),
        "Check completed"
    );
    println!("{}", serde_json::to_string_pretty(&outcome.check)?);
    Ok(())
}

async fn run_server(config_path: &str) -> Result<()> {
    let config = load(config_path)?;
    tracing::info!(config = config_path, "Starting oxalert");
    let app = App::new(config)?;
    let running = app.start().await?;

    signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    if !running.shutdown(SHUTDOWN_TIMEOUT).await {
        tracing::warn!("Some services were aborted during shutdown");
    }
    Ok(())
}
