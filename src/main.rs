mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use std::sync::Arc;

use pockestrator::{
    CaddyManager, ControlAction, JsonFileRepository, Orchestrator, PocketBaseProvisioner,
    ServiceHooks, ServiceRequest, Settings, SystemRunner, SystemdManager, Validator,
};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;

    let runner = Arc::new(SystemRunner);
    let systemd = Arc::new(SystemdManager::new(settings.unit_dir.clone(), runner.clone()));
    let caddy = Arc::new(CaddyManager::new(settings.gateway_config.clone(), runner));
    let repo = Arc::new(JsonFileRepository::open(settings.state_file.clone())?);
    let validator = Validator::new(&settings);

    let orchestrator = Arc::new(Orchestrator::new(
        settings,
        repo,
        systemd,
        caddy,
        Arc::new(PocketBaseProvisioner),
        validator,
    ));

    match cli.command {
        Commands::Serve => {
            let prereqs = Validator::new(orchestrator.settings()).check_prerequisites();
            for warning in &prereqs.warnings {
                tracing::warn!("{}", warning);
            }
            if !prereqs.is_valid {
                for error in &prereqs.errors {
                    tracing::error!("{}", error);
                }
                anyhow::bail!("host prerequisites not met");
            }

            // Startup drift report: compare every row to the host before
            // the monitor takes over.
            for service in orchestrator.repository().list().await? {
                let verdict = orchestrator.reconciler().classify(&service).await;
                if verdict.is_synced() {
                    tracing::debug!(service = %service.project_name, "in sync");
                } else {
                    tracing::warn!(
                        service = %service.project_name,
                        "drift detected: {}",
                        serde_json::to_string(&verdict)?
                    );
                }
            }

            let hooks = ServiceHooks::new(Arc::clone(&orchestrator));
            let monitor = hooks.schedule_health_monitor();
            tracing::info!("pockestrator running; press ctrl-c to stop");

            tokio::signal::ctrl_c().await?;
            orchestrator.shutdown();
            let _ = monitor.await;
        }

        Commands::Doctor => {
            let result = Validator::new(orchestrator.settings()).check_prerequisites();
            for warning in &result.warnings {
                println!("warning: {}", warning);
            }
            for error in &result.errors {
                println!("error: {}", error);
            }
            if result.is_valid {
                println!("Host looks ready.");
            } else {
                anyhow::bail!("host prerequisites not met");
            }
        }

        Commands::Create {
            name,
            port,
            version,
            domain,
            wait,
        } => {
            let request = ServiceRequest {
                project_name: name,
                port,
                pocketbase_version: version,
                domain,
                ..Default::default()
            };
            let response = if wait {
                orchestrator.create_blocking(request).await?
            } else {
                orchestrator.create(request).await?
            };
            print_response(&response)?;
        }

        Commands::List => {
            for service in orchestrator.repository().list().await? {
                println!(
                    "{:<20} {:<6} {:<10} {:<10} {}",
                    service.project_name,
                    service.port,
                    service.pocketbase_version,
                    service.status,
                    service.host()
                );
            }
        }

        Commands::Delete { name } => {
            let service = orchestrator.find_by_name(&name).await?;
            let response = orchestrator.delete(&service.id).await?;
            print_response(&response)?;
        }

        Commands::Start { name } => {
            control(&orchestrator, &name, ControlAction::Start).await?;
        }
        Commands::Stop { name } => {
            control(&orchestrator, &name, ControlAction::Stop).await?;
        }
        Commands::Restart { name } => {
            control(&orchestrator, &name, ControlAction::Restart).await?;
        }

        Commands::Status { name } => {
            let service = orchestrator.find_by_name(&name).await?;
            let status = orchestrator.status(&service.id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::Drift { name } => {
            let service = orchestrator.find_by_name(&name).await?;
            let verdict = orchestrator.classify(&service.id).await?;
            println!("{}", serde_json::to_string_pretty(&verdict)?);
        }

        Commands::Logs { name, lines } => {
            let service = orchestrator.find_by_name(&name).await?;
            for line in orchestrator.logs(&service.id, lines).await? {
                println!("{}", line);
            }
        }
    }

    Ok(())
}

async fn control(
    orchestrator: &Arc<Orchestrator>,
    name: &str,
    action: ControlAction,
) -> anyhow::Result<()> {
    let service = orchestrator.find_by_name(name).await?;
    let response = orchestrator.control(&service.id, action).await?;
    print_response(&response)
}

fn print_response(response: &pockestrator::ServiceResponse) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    if response.status == "error" {
        anyhow::bail!("{}", response.message);
    }
    Ok(())
}
