mod face;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use rpa_test_agent::brain::Prompt;
use rpa_test_agent::planner::Planner;
use rpa_test_agent::{
    AgentConfig, AgentEvent, ChromeDriver, LanguageModel, OpenAiBrain, PageContext, ProviderError,
    RunReport, TestAgent, TestPlan,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agent", version, about = "Run plain-language web tests in Chrome")]
struct Cli {
    /// TOML config file; defaults to ./rpa-agent.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Site that relative URLs and fresh sessions start from.
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// Show the browser window.
    #[arg(long, global = true)]
    headed: bool,
    /// Where session directories are created.
    #[arg(long, global = true)]
    artifacts: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan and execute each description in one browser session.
    Run {
        #[arg(required = true)]
        descriptions: Vec<String>,
    },
    /// Print the validated plan for a description without opening a browser.
    Plan { description: String },
    /// Re-execute a saved plan.json.
    Replay { plan: PathBuf },
    /// Serve the web UI and run descriptions submitted there.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// Stands in for the model when a saved plan is replayed without an API key.
struct Offline;

#[async_trait]
impl LanguageModel for Offline {
    async fn complete(&self, _prompt: &Prompt, _schema: &Value) -> Result<String, ProviderError> {
        Err(ProviderError::MissingApiKey(
            "no model configured for replay".to_string(),
        ))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(error) => {
            error!("{error:#}");
            ExitCode::FAILURE
        }
    }
}

/// Ok(false) means every command ran but at least one test failed.
async fn run(cli: Cli) -> Result<bool> {
    let mut config = AgentConfig::load(cli.config.as_deref())?;
    if cli.base_url.is_some() {
        config.base_url = cli.base_url;
    }
    if cli.headed {
        config.browser.headless = false;
    }
    if cli.artifacts.is_some() {
        config.artifacts.root = cli.artifacts;
    }

    match cli.command {
        Command::Run { descriptions } => run_descriptions(config, descriptions).await,
        Command::Plan { description } => print_plan(config, &description).await,
        Command::Replay { plan } => replay(config, &plan).await,
        Command::Serve { port } => serve(config, port).await.map(|()| true),
    }
}

fn model(config: &AgentConfig) -> Result<Arc<dyn LanguageModel>> {
    let brain = OpenAiBrain::from_config(&config.model).context("language model unavailable")?;
    Ok(Arc::new(brain))
}

async fn start_agent(config: &AgentConfig, model: Arc<dyn LanguageModel>) -> Result<TestAgent> {
    info!("launching Chrome");
    let driver = ChromeDriver::start(
        config.browser.clone(),
        Duration::from_millis(config.executor.step_timeout_ms),
    )
    .await?;
    let agent = TestAgent::new(Arc::new(driver), model, config.clone()).await?;
    info!(dir = %agent.artifacts().session_dir().display(), "session ready");
    Ok(agent)
}

async fn run_descriptions(config: AgentConfig, descriptions: Vec<String>) -> Result<bool> {
    let mut agent = start_agent(&config, model(&config)?).await?;
    let batch = agent.execute_batch(&descriptions, PageContext::new()).await;
    let closed = agent.close().await;

    for result in &batch.results {
        println!(
            "{} {}: {}",
            if result.success { "PASS" } else { "FAIL" },
            result.case_id,
            result.message
        );
    }
    for failure in &batch.failures {
        println!("ERROR {}: {}", failure.description, failure.error);
    }
    println!("artifacts: {}", agent.artifacts().session_dir().display());
    closed?;
    Ok(batch.success())
}

async fn print_plan(config: AgentConfig, description: &str) -> Result<bool> {
    let planner =
        Planner::new(model(&config)?, config.planner.clone()).with_base_url(config.base_url.clone());
    let plan = planner
        .plan(description, &PageContext::new())
        .await?
        .with_policy(config.executor.failure_policy.clone());
    println!("{}", plan.to_json_pretty()?);
    Ok(true)
}

async fn replay(config: AgentConfig, path: &std::path::Path) -> Result<bool> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let plan = TestPlan::from_json(&raw)
        .with_context(|| format!("{} is not a valid plan", path.display()))?;

    let model = model(&config).unwrap_or_else(|error| {
        warn!("{error:#}; replaying without a model");
        Arc::new(Offline) as Arc<dyn LanguageModel>
    });
    let mut agent = start_agent(&config, model).await?;
    let outcome = agent.execute_plan(&plan, &PageContext::new()).await;
    let closed = agent.close().await;

    let result = match outcome {
        Ok(run) => run.result,
        Err(rpa_test_agent::AgentError::SessionLost { result }) => *result,
        Err(error) => return Err(error.into()),
    };
    println!(
        "{} {}: {}",
        if result.success { "PASS" } else { "FAIL" },
        result.case_id,
        result.message
    );
    closed?;
    Ok(result.success)
}

async fn serve(config: AgentConfig, port: Option<u16>) -> Result<()> {
    let mut server = face::start_server(port).await?;
    let model = model(&config)?;
    let mut agent = start_agent(&config, Arc::clone(&model))
        .await?
        .with_events(server.events.clone());
    let mut context = PageContext::new();
    let mut finished = Vec::new();
    ready(&server.events);
    info!(port = server.port, "waiting for test descriptions");

    while let Some(description) = server.commands.recv().await {
        if agent.is_closed() {
            warn!("previous browser session ended; starting a new one");
            finished.extend(agent.results().iter().cloned());
            agent = match start_agent(&config, Arc::clone(&model)).await {
                Ok(agent) => agent.with_events(server.events.clone()),
                Err(error) => {
                    error!("{error:#}");
                    ready(&server.events);
                    continue;
                }
            };
            context = PageContext::new();
        }

        match agent.execute_test_plan(&description, &context).await {
            Ok(run) => context = run.context,
            Err(error) => warn!(%error, "test did not complete"),
        }
        if let Err(error) = agent.write_report().await {
            warn!(%error, "could not write report");
        }
        let mut cases = finished.clone();
        cases.extend(agent.results().iter().cloned());
        *server.report.write().await = Some(RunReport::new(cases).to_markdown());
        ready(&server.events);
    }

    agent.close().await?;
    Ok(())
}

fn ready(events: &broadcast::Sender<AgentEvent>) {
    let _ = events.send(AgentEvent::Ready);
}
