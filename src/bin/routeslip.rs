//! routeslip CLI: producer and routing-step workers for the greeting workflow.

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use routeslip::channel::{Address, PgmqChannel};
use routeslip::config::{Config, WorkerConfig, WorkflowConfig};
use routeslip::db::Db;
use routeslip::db::topology::pgmq_name;
use routeslip::engine::{RoutingStep, Supervisor, Worker, WorkerOutcome};
use routeslip::greeting::{self, ENRICHER_ADDRESS, Greeting, RECEIVER_ADDRESS};
use routeslip::producer::Producer;
use routeslip::slip::RoutingSlip;
use routeslip::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "routeslip", about = "Routing-slip workflows over pgmq")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish greeting slips into the workflow
    Send {
        /// Workflow TOML; defaults to enricher -> receiver
        #[arg(long)]
        workflow: Option<PathBuf>,
        /// Stop after this many slips (default: until Ctrl-C)
        #[arg(long)]
        count: Option<u64>,
        /// Pause for five seconds after every N slips
        #[arg(long, default_value_t = 10)]
        burst: u64,
    },
    /// Run enricher workers: fill in the recipient and pass the slip on
    Enrich(StepArgs),
    /// Run receiver workers: log the finished greeting
    Receive(StepArgs),
    /// Show how many messages sit in an address's dead-letter queue
    DeadLetters {
        /// The address whose rejects to count
        address: String,
    },
}

#[derive(Args)]
struct StepArgs {
    /// Competing workers on the step's address
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// Override the step's inbound address
    #[arg(long)]
    address: Option<String>,
}

#[derive(Clone, Copy)]
enum Role {
    Enrich,
    Receive,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = telemetry(&config)?;
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    match cli.command {
        Command::Send {
            workflow,
            count,
            burst,
        } => cmd_send(&db, &config, workflow, count, burst).await,
        Command::Enrich(args) => cmd_run(&db, &config, Role::Enrich, args).await,
        Command::Receive(args) => cmd_run(&db, &config, Role::Receive, args).await,
        Command::DeadLetters { address } => cmd_dead_letters(&db, address).await,
    }
}

fn telemetry(config: &Config) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "routeslip".to_string(),
        log_level: config.log_level.clone(),
    })?)
}

async fn cmd_send(
    db: &Db,
    config: &Config,
    workflow: Option<PathBuf>,
    count: Option<u64>,
    burst: u64,
) -> anyhow::Result<()> {
    let workflow = match workflow {
        Some(path) => WorkflowConfig::load(&path)?,
        None => WorkflowConfig {
            name: "greeting".to_string(),
            steps: vec![ENRICHER_ADDRESS.into(), RECEIVER_ADDRESS.into()],
        },
    };
    let first = workflow
        .first()
        .context("workflow has no steps")?
        .clone();

    let channel = PgmqChannel::open(db.clone(), config.topology.clone(), &first).await?;
    let mut producer = Producer::new(channel);

    let mut sent = 0u64;
    let result = async {
        while count.is_none_or(|limit| sent < limit) {
            let greeting = Greeting::new(format!("Hello World #{}", sent + 1));
            let slip = RoutingSlip::from_addresses(greeting, workflow.steps.iter());
            let to = producer.send(&slip).await?;
            sent += 1;
            info!(workflow = %workflow.name, %to, sent, "sent slip");

            if burst > 0 && sent % burst == 0 {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
            }
        }
        anyhow::Ok(())
    };

    tokio::select! {
        r = result => r?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    producer.close().await?;
    println!("Sent {sent} slip(s).");
    Ok(())
}

async fn cmd_run(
    db: &Db,
    config: &Config,
    role: Role,
    args: StepArgs,
) -> anyhow::Result<()> {
    let worker_config = WorkerConfig::default();
    let address = Address::new(args.address.unwrap_or_else(|| match role {
        Role::Enrich => ENRICHER_ADDRESS.to_string(),
        Role::Receive => RECEIVER_ADDRESS.to_string(),
    }));

    let mut supervisor = Supervisor::new(worker_config.shutdown_timeout);
    for i in 0..args.workers.max(1) {
        let channel = PgmqChannel::open(db.clone(), config.topology.clone(), &address)
            .await?
            .with_visibility_timeout(config.visibility_timeout);
        match role {
            Role::Enrich => supervisor.spawn(Worker::new(
                format!("enricher-{i}"),
                RoutingStep::new(channel, &address, greeting::enrich),
                worker_config,
            )),
            Role::Receive => supervisor.spawn(Worker::new(
                format!("receiver-{i}"),
                RoutingStep::new(channel, &address, greeting::greet),
                worker_config,
            )),
        }
    }

    // Watch for Ctrl-C and for workers dying on their own.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down consumers");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(3)) => {
                for exit in supervisor.reap().await {
                    error!(worker = %exit.name, outcome = ?exit.outcome, "worker exited");
                }
                if supervisor.is_empty() {
                    anyhow::bail!("all workers on {address} have exited");
                }
            }
        }
    }

    let report = supervisor.shutdown().await;
    for exit in &report.exits {
        match &exit.outcome {
            WorkerOutcome::Stopped(r) => info!(worker = %exit.name, processed = r.processed(), "stopped"),
            other => warn!(worker = %exit.name, outcome = ?other, "did not stop cleanly"),
        }
    }
    Ok(())
}

async fn cmd_dead_letters(db: &Db, address: String) -> anyhow::Result<()> {
    let dead_letter = Address::new(address).dead_letter();
    let queue = pgmq_name(&dead_letter)?;
    let length = db
        .queue_length(&queue)
        .await
        .with_context(|| format!("no dead-letter queue for {dead_letter}"))?;
    println!("{dead_letter}: {length} message(s)");
    Ok(())
}
