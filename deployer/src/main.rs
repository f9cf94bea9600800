//! Policy deployer - Entry Point
//!
//! Usage:
//!   policy-deployer --deployment=rollout.json [--targets=FILE] [--storage=DIR] [--settings=FILE] [--serve]
//!   policy-deployer --serve
//!   policy-deployer --version

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;

use colored::Colorize;
use policy_deployer::app::options::AppOptions;
use policy_deployer::app::run::run;
use policy_deployer::filesys::file::File;
use policy_deployer::logs::{init_logging, LogLevel, LogOptions};
use policy_deployer::models::deployment::{DeploymentConfig, DistributionResult};
use policy_deployer::storage::layout::StorageLayout;
use policy_deployer::storage::settings::Settings;
use policy_deployer::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // --key=value
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return ExitCode::SUCCESS;
    }

    let layout = match cli_args.get("storage") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };

    let settings_file = match cli_args.get("settings") {
        Some(path) => File::new(path),
        None => layout.settings_file(),
    };
    let mut settings = match Settings::load(&settings_file).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to read settings file {}: {}", settings_file.path().display(), e);
            return ExitCode::from(2);
        }
    };
    if let Some(level) = cli_args.get("log-level") {
        match level.parse::<LogLevel>() {
            Ok(level) => settings.log.level = level,
            Err(e) => eprintln!("{}", e),
        }
    }
    if cli_args.contains_key("serve") {
        settings.server.enabled = true;
    }
    let layout = match &settings.storage_dir {
        Some(dir) if !cli_args.contains_key("storage") => StorageLayout::new(dir),
        _ => layout,
    };
    let layout = match cli_args.get("targets") {
        Some(path) => layout.with_targets_file(path),
        None => layout,
    };

    let log_options = LogOptions {
        log_level: settings.log.level,
        json_format: settings.log.json,
        log_dir: settings.log.file.then(|| layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    // flushes the file writer on drop
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let deployment = match cli_args.get("deployment") {
        Some(path) => match File::new(path).read_json::<DeploymentConfig>().await {
            Ok(config) => Some(config),
            Err(e) => {
                error!("Unable to read deployment {}: {}", path, e);
                return ExitCode::from(2);
            }
        },
        None => None,
    };

    if deployment.is_none() && !settings.server.enabled {
        eprintln!("Nothing to do: pass --deployment=FILE and/or --serve");
        return ExitCode::from(2);
    }

    let options = AppOptions::from_settings(&settings, layout);
    info!("Running policy deployer {} with options: {:?}", version.version, options);

    match run(options, deployment, await_shutdown_signal()).await {
        Ok(Some(result)) => {
            print_summary(&result);
            if result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Deployment failed: {e}");
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::from(2)
        }
    }
}

fn print_summary(result: &DistributionResult) {
    let status = if result.success {
        result.status.as_str().green().bold()
    } else {
        result.status.as_str().red().bold()
    };
    println!(
        "{} {} ({}ms)",
        result.deployment_id.bold(),
        status,
        result.duration_ms
    );
    println!("  {}", result.summary);

    for target in &result.results {
        let mark = if target.success { "ok".green() } else { "failed".red() };
        println!("  {:<24} {:<6} {}", target.target_id, mark, target.message);
    }
    for warning in &result.warnings {
        println!("  {} {}", "warning:".yellow(), warning);
    }
    if let Some(rollback) = &result.rollback {
        println!(
            "  rollback {}: {}/{} targets restored",
            rollback.operation_id,
            rollback.processed_targets - rollback.failed_targets,
            rollback.processed_targets
        );
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut sigterm), Ok(mut sigint)) =
            (signal(SignalKind::terminate()), signal(SignalKind::interrupt()))
        else {
            let _ = tokio::signal::ctrl_c().await;
            info!("Ctrl+C received, shutting down...");
            return;
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
