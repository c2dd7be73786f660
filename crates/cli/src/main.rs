use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use batchflow_engine::{
    ComponentRegistry, ExecutionContext, InterruptFlag, NoopDriver, Runtime, load_services_dir, parse_message_catalog,
};
use batchflow_types::Value;
use batchflow_util::EngineConfig;
use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    let config_path = matches.get_one::<PathBuf>("config").map(PathBuf::as_path);
    let config = EngineConfig::load(config_path)?;
    init_tracing(&config);

    match matches.subcommand() {
        Some(("validate", _)) => validate(&config),
        Some(("run", sub)) => run_service(config, sub).await,
        Some((other, _)) => anyhow::bail!("unknown command '{other}'"),
        None => anyhow::bail!("expected a command; see --help"),
    }
}

fn build_cli() -> Command {
    Command::new("batchflow")
        .about("Prepare and run Batchflow services")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(clap::value_parser!(PathBuf))
                .help("Configuration file; defaults to BATCHFLOW_CONFIG_PATH or the user config directory"),
        )
        .subcommand(Command::new("validate").about("Prepare every service and report configuration errors"))
        .subcommand(
            Command::new("run")
                .about("Invoke one service and print the final context as JSON")
                .arg(Arg::new("service").required(true).help("Name of the service to invoke"))
                .arg(
                    Arg::new("set")
                        .long("set")
                        .action(ArgAction::Append)
                        .value_name("NAME=VALUE")
                        .help("Initial context field; repeat for several fields"),
                ),
        )
}

fn init_tracing(config: &EngineConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn load_registry(config: &EngineConfig) -> Result<ComponentRegistry> {
    let mut registry = ComponentRegistry::new();
    let definitions = load_services_dir(&config.services_dir)?;
    info!(services = definitions.len(), directory = %config.services_dir.display(), "loaded service definitions");
    registry.add_services(definitions)?;
    if let Some(messages_file) = &config.messages_file {
        registry.add_messages(parse_message_catalog(messages_file)?);
    }
    Ok(registry)
}

fn prepare_runtime(config: &EngineConfig) -> Result<Runtime> {
    let registry = load_registry(config)?;
    let runtime = Runtime::prepare(&registry, NoopDriver::shared())?.with_config(config);
    Ok(runtime)
}

fn validate(config: &EngineConfig) -> Result<()> {
    let runtime = prepare_runtime(config)?;
    let names: Vec<&str> = runtime.services().map(|service| service.name()).collect();
    println!("{} service(s) prepared: {}", names.len(), names.join(", "));
    Ok(())
}

async fn run_service(config: EngineConfig, matches: &ArgMatches) -> Result<()> {
    let service = matches
        .get_one::<String>("service")
        .cloned()
        .context("expected a service name")?;
    let mut context = ExecutionContext::new();
    for assignment in matches.get_many::<String>("set").into_iter().flatten() {
        let (name, value) = parse_assignment(assignment)?;
        context.set_value(name, value);
    }

    let interrupt = InterruptFlag::new();
    let runtime = prepare_runtime(&config)?.with_interrupt_flag(interrupt.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; batch steps stop after the current row");
            interrupt.raise();
        }
    });

    let (status, context) = tokio::task::spawn_blocking(move || {
        let status = runtime.invoke(&service, &mut context);
        (status, context)
    })
    .await
    .context("service invocation panicked")?;
    let status = status?;

    info!(status = ?status, in_error = context.in_error(), "service finished");
    println!("{}", serde_json::to_string_pretty(&context)?);
    if context.in_error() {
        anyhow::bail!("service ended with error messages");
    }
    Ok(())
}

/// Splits `name=value`. The value is read as a YAML scalar so numbers and
/// booleans keep their type; anything else is text.
fn parse_assignment(raw: &str) -> Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected NAME=VALUE, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("field name is empty in '{raw}'");
    }
    let value = serde_yaml::from_str::<Value>(value).unwrap_or_else(|_| Value::Text(value.to_string()));
    Ok((name.to_string(), value))
}
