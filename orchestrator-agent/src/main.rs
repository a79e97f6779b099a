use anyhow::Context;
use envconfig::Envconfig;
use orchestrator_agent::args::{Args, Invocation};
use orchestrator_agent::config::Config;
use orchestrator_agent::process::ProcessGate;
use orchestrator_agent::signals::wait_for_shutdown_signal;
use orchestrator_client::OrchestratorClient;
use tracing::{error, info, Level};

fn init_tracing(level: Level) {
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("tracing subscriber already installed");
    }
}

/// Runs until the instance is shut down and returns the process exit code.
async fn run(config: Config, invocation: Invocation) -> anyhow::Result<i32> {
    let args = invocation.args;
    let attributes = args.attributes().context("invalid init data")?;

    let mut builder = OrchestratorClient::builder(&args.orchestrator_url, &args.orchestrator_secret)
        .with_init_data(attributes)
        .with_request_timeout(config.request_timeout())
        .with_machine_id_path(&config.machine_id_path);
    if let Some(service) = invocation.external_service {
        info!(
            service = %service.name,
            min_processes = service.min_processes,
            "heartbeats gated on external service"
        );
        builder = builder.with_liveness_gate(ProcessGate::new(service.name, service.min_processes));
    }
    let client = builder
        .build()
        .context("failed to create orchestrator client")?;

    let instance_config = match client
        .init(
            args.orchestrator_service_port,
            None,
            args.instance_suffix.as_deref(),
        )
        .await
    {
        Ok(instance_config) => instance_config,
        Err(e) => {
            error!("failed to initialize orchestrator client: {}", e);
            client.destroy().await;
            return Err(e).context("failed to initialize orchestrator client");
        }
    };
    info!(
        instance_id = %client.instance_id().unwrap_or_default(),
        modules = instance_config.modules.len(),
        "agent running"
    );

    tokio::select! {
        signal = wait_for_shutdown_signal() => {
            let signal = signal.context("failed to install signal handlers")?;
            client.destroy().await;
            Ok(signal.exit_code())
        }
        _ = client.destroyed() => {
            info!("instance destroyed, exiting");
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env().context("failed to load configuration")?;
    init_tracing(config.log_level);

    let invocation = Args::parse_invocation();
    let exit_code = run(config, invocation).await?;
    std::process::exit(exit_code);
}
