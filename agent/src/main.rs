//! Upgrade Agent - Entry Point
//!
//! Runs firmware upgrade jobs against network devices and streams progress
//! events. Jobs come from a file, from flags, or as JSON lines on stdin in
//! worker mode.

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use secrecy::ExposeSecret;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use upgrade_agent::app::options::AgentOptions;
use upgrade_agent::app::run::JobRunner;
use upgrade_agent::device::sim::{SimScenario, SimulatedTransport};
use upgrade_agent::errors::UpgradeError;
use upgrade_agent::filesys::file::File;
use upgrade_agent::logs::init_logging;
use upgrade_agent::models::job::UpgradeJob;
use upgrade_agent::models::status::DeviceStatus;
use upgrade_agent::mqtt::client::MqttClient;
use upgrade_agent::progress::formatter::{format_check_table, format_device_summary};
use upgrade_agent::progress::sink::{EventSink, FanoutSink, MqttSink, StderrSink, WebhookSink};
use upgrade_agent::storage::settings::Settings;
use upgrade_agent::utils::{generate_uuid, version_info};
use upgrade_agent::workers::{intake, mqtt};

const PASSWORD_ENV: &str = "UPGRADE_PASSWORD";

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("{}", e),
        }
        return ExitCode::SUCCESS;
    }

    // Retrieve the settings file
    let settings = match cli_args.get("settings") {
        Some(path) => match File::new(path).read_json::<Settings>().await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Unable to read settings file: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => Settings::default(),
    };

    let options = match AgentOptions::from_settings(&settings) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Invalid settings: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let _log_guard = match init_logging(options.log.clone()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    match run(cli_args, options).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every device succeeded
async fn run(cli_args: HashMap<String, String>, options: AgentOptions) -> Result<bool, UpgradeError> {
    let transport = match cli_args.get("simulate") {
        Some(path) => {
            let scenario = File::new(path).read_json::<SimScenario>().await?;
            info!("Rehearsing against simulated device from {}", path);
            Arc::new(SimulatedTransport::new(scenario))
        }
        None => {
            return Err(UpgradeError::ConfigError(
                "no device transport is linked into this build; rehearse with --simulate=<scenario.json>"
                    .to_string(),
            ))
        }
    };

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let sink = build_sink(&options, &shutdown_tx)?;
    let runner = JobRunner::new(
        transport.clone(),
        transport,
        sink,
        options.upgrade.clone(),
        options.max_concurrent_devices,
    );

    let all_succeeded = if cli_args.contains_key("worker") {
        run_worker(&runner, cli_args.get("output").cloned(), shutdown_tx.clone()).await?
    } else {
        let job = load_job(&cli_args).await?;
        let statuses = runner.run_job(&job).await?;
        report(&statuses, cli_args.get("output")).await?
    };

    let _ = shutdown_tx.send(());
    Ok(all_succeeded)
}

fn build_sink(options: &AgentOptions, shutdown_tx: &broadcast::Sender<()>) -> Result<Arc<dyn EventSink>, UpgradeError> {
    let mut fanout = FanoutSink::new(Vec::new());

    if options.stderr_events {
        fanout.push(Arc::new(StderrSink));
    }

    if options.mqtt_worker.broker_address.is_configured() {
        let client_id = format!("upgrade-agent-{}", generate_uuid());
        let client = MqttClient::new(&options.mqtt_worker.broker_address, &client_id)?;
        fanout.push(Arc::new(MqttSink::new(client.publisher())));

        let worker_options = options.mqtt_worker.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            mqtt::run(
                &worker_options,
                client,
                tokio::time::sleep,
                Box::pin(async move {
                    let _ = shutdown_rx.recv().await;
                }),
            )
            .await;
        });
    }

    if let Some(url) = &options.webhook_url {
        fanout.push(Arc::new(WebhookSink::new(url.as_str(), options.webhook_timeout)?));
    }

    if fanout.is_empty() {
        warn!("No event sinks configured; progress events are discarded");
    }
    Ok(Arc::new(fanout))
}

/// Job from `--job=<file>` or from individual flags
async fn load_job(cli_args: &HashMap<String, String>) -> Result<UpgradeJob, UpgradeError> {
    let mut job = match cli_args.get("job") {
        Some(path) => File::new(path).read_json::<UpgradeJob>().await?,
        None => job_from_flags(cli_args)?,
    };

    if let Ok(password) = env::var(PASSWORD_ENV) {
        if !cli_args.contains_key("password") {
            job.password = password.into();
        }
    }
    Ok(job)
}

fn job_from_flags(cli_args: &HashMap<String, String>) -> Result<UpgradeJob, UpgradeError> {
    let list = |key: &str| -> Option<Vec<String>> {
        cli_args.get(key).map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
    };
    let flag = |key: &str| cli_args.get(key).is_some_and(|v| v == "true");

    let mut fields = Map::new();
    fields.insert("hostnames".to_string(), json!(list("hostname").unwrap_or_default()));
    fields.insert("skip_pre_check".to_string(), json!(flag("skip-pre-check")));
    fields.insert("force".to_string(), json!(flag("force")));
    for (flag_name, field) in [
        ("job-id", "job_id"),
        ("command", "command"),
        ("username", "username"),
        ("password", "password"),
        ("target-version", "target_version"),
        ("image", "image_filename"),
    ] {
        if let Some(value) = cli_args.get(flag_name) {
            let value = if field == "command" {
                value.replace('-', "_")
            } else {
                value.clone()
            };
            fields.insert(field.to_string(), json!(value));
        }
    }
    if let Some(checks) = list("checks") {
        fields.insert("selected_checks".to_string(), json!(checks));
    }
    if let Some(port) = cli_args.get("port") {
        let port: u16 = port
            .parse()
            .map_err(|_| UpgradeError::ConfigError(format!("invalid port: {}", port)))?;
        fields.insert("port".to_string(), json!(port));
    }

    serde_json::from_value(Value::Object(fields))
        .map_err(|e| UpgradeError::ConfigError(format!("invalid job flags: {}", e)))
}

/// Feed JSON-lines jobs from stdin to the intake worker
async fn run_worker(
    runner: &JobRunner,
    output: Option<String>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<bool, UpgradeError> {
    let (job_tx, job_rx) = mpsc::channel::<UpgradeJob>(16);
    let (report_tx, mut report_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<UpgradeJob>(&line) {
                    Ok(mut job) => {
                        if let Ok(password) = env::var(PASSWORD_ENV) {
                            if job.password.expose_secret().is_empty() {
                                job.password = password.into();
                            }
                        }
                        if job_tx.send(job).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring malformed job line: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    error!("Reading jobs from stdin failed: {}", e);
                    break;
                }
            }
        }
    });

    let worker_runner = runner.clone();
    let mut shutdown_rx = shutdown_tx.subscribe();
    let worker = tokio::spawn(async move {
        intake::run(
            &intake::Options::default(),
            &worker_runner,
            job_rx,
            report_tx,
            Box::pin(async move {
                tokio::select! {
                    _ = await_shutdown_signal() => {}
                    _ = shutdown_rx.recv() => {}
                }
            }),
        )
        .await;
    });

    let mut all_succeeded = true;
    while let Some(job_report) = report_rx.recv().await {
        info!("Job {} finished", job_report.job_id);
        let output = output
            .as_ref()
            .map(|base| format!("{}.{}.json", base.trim_end_matches(".json"), job_report.job_id));
        all_succeeded &= report(&job_report.statuses, output.as_ref()).await?;
    }

    if let Err(e) = worker.await {
        error!("Intake worker stopped abnormally: {}", e);
    }
    let _ = shutdown_tx.send(());
    Ok(all_succeeded)
}

/// Print summaries and persist terminal snapshots
async fn report(statuses: &[DeviceStatus], output: Option<&String>) -> Result<bool, UpgradeError> {
    for status in statuses {
        if let Some(summary) = &status.pre_check_summary {
            println!("{}", format_check_table(summary));
        }
        println!("{}", format_device_summary(status));
    }

    if let Some(path) = output {
        File::new(path).write_json(&statuses).await?;
        info!("Wrote {} device status snapshot(s) to {}", statuses.len(), path);
    }

    Ok(statuses
        .iter()
        .all(|s| s.upgrade_result.as_ref().is_some_and(|r| r.success)))
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, shutting down...");
                    }
                    _ = sigint.recv() => {
                        info!("SIGINT received, shutting down...");
                    }
                }
                return;
            }
            _ => warn!("Unable to install signal handlers, falling back to Ctrl+C"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl+C received, shutting down..."),
        Err(e) => {
            error!("Unable to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
