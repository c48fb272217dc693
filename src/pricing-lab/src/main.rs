//! Pricing Lab: pricing-strategy experiments and a Q-learning price policy.
//!
//! Entry point that wires the engines over an in-memory marketplace and runs
//! one of the demo, train or sweep workflows.

mod demo;

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use pricing_core::config::AppConfig;
use pricing_core::event_bus::capture_sink;
use pricing_core::store::{ExperimentRepository, InMemoryStore, ListingProvider};
use pricing_core::types::{AllocationMethod, ExperimentType, Reward, SuccessMetric};
use pricing_experiments::{CreateExperimentRequest, ExperimentManager, OutcomeMeasurement};
use pricing_rl_engine::{
    EpisodeSimulator, QPolicy, StateEncoder, TrainingJobManager, TrainingRequest,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "pricing-lab")]
#[command(about = "Pricing strategy experiments and reinforcement-learning price policy")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "PRICING_LAB__NODE_ID")]
    node_id: Option<String>,

    /// Seed for every random draw in the run
    #[arg(long, env = "PRICING_LAB__SEED", default_value_t = 42)]
    seed: u64,

    /// Number of synthetic listings to seed
    #[arg(long, default_value_t = 120)]
    listings: usize,

    /// Print the Prometheus metrics snapshot after the command
    #[arg(long, default_value_t = false)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an experiment end to end and pick a price action
    Demo {
        #[arg(long, value_enum, default_value_t = Method::ThompsonSampling)]
        method: Method,
    },
    /// Train the Q-table in a background job and poll it to completion
    Train {
        #[arg(long, default_value_t = 200)]
        episodes: usize,
        #[arg(long)]
        learning_rate: Option<f64>,
        #[arg(long)]
        discount_factor: Option<f64>,
        #[arg(long)]
        exploration_rate: Option<f64>,
        #[arg(long)]
        category: Option<String>,
        /// Job timeout in seconds (overrides config)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Complete every experiment past its end date
    Sweep,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Method {
    Equal,
    EpsilonGreedy,
    ThompsonSampling,
}

impl From<Method> for AllocationMethod {
    fn from(m: Method) -> Self {
        match m {
            Method::Equal => AllocationMethod::Equal,
            Method::EpsilonGreedy => AllocationMethod::EpsilonGreedy,
            Method::ThompsonSampling => AllocationMethod::ThompsonSampling,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "pricing_lab=info,pricing_experiments=info,pricing_rl_engine=info".into()
            }),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(node_id) = cli.node_id.clone() {
        config.node_id = node_id;
    }

    let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder();
    let metrics = match recorder {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Failed to install metrics recorder");
            None
        }
    };

    info!(
        node_id = %config.node_id,
        seed = cli.seed,
        listings = cli.listings,
        "Pricing Lab starting"
    );

    let mut rng = StdRng::seed_from_u64(cli.seed);
    let store = Arc::new(InMemoryStore::new());
    demo::seed_listings(&store, cli.listings, &mut rng, Utc::now());

    match cli.command {
        Command::Demo { method } => run_demo(&config, store, method.into(), &mut rng)?,
        Command::Train {
            episodes,
            learning_rate,
            discount_factor,
            exploration_rate,
            category,
            timeout_secs,
        } => {
            if let Some(secs) = timeout_secs {
                config.training.job_timeout_secs = secs;
            }
            let request = TrainingRequest {
                episodes,
                learning_rate,
                discount_factor,
                exploration_rate,
                category_id: category,
                listing_ids: None,
            };
            run_training(&config, store, request, cli.seed).await?;
        }
        Command::Sweep => run_sweep(&config, store, &mut rng)?,
    }

    if cli.print_metrics {
        if let Some(handle) = metrics {
            println!("{}", handle.render());
        }
    }
    Ok(())
}

fn experiment_manager(config: &AppConfig, store: Arc<InMemoryStore>) -> ExperimentManager {
    ExperimentManager::new(
        store.clone(),
        store.clone(),
        store,
        capture_sink(),
        config.bandit.clone(),
        config.significance.clone(),
    )
}

fn experiment_request(
    method: AllocationMethod,
    max_duration_days: u32,
) -> CreateExperimentRequest {
    CreateExperimentRequest {
        user_id: "seller-0".into(),
        name: "markdown depth".into(),
        experiment_type: ExperimentType::MultiArmedBandit,
        strategies: demo::strategies(),
        allocation_method: method,
        success_metric: SuccessMetric::SellThrough,
        confidence_threshold: None,
        min_sample_size: Some(60),
        max_duration_days: Some(max_duration_days),
        category_id: None,
        brand: None,
    }
}

/// Record one synthetic outcome for every assigned listing.
fn record_outcomes(
    manager: &ExperimentManager,
    store: &InMemoryStore,
    experiment_id: &Uuid,
    at: chrono::DateTime<Utc>,
    rng: &mut StdRng,
) -> anyhow::Result<usize> {
    let strategies = demo::strategies();
    let assignments = store.assignments(experiment_id)?;
    for assignment in &assignments {
        let Some(strategy) = strategies.iter().find(|s| s.id == assignment.strategy_id) else {
            continue;
        };
        let score = demo::simulated_score(&strategy.config, rng);
        manager.record_outcome(
            experiment_id,
            &assignment.listing_id,
            OutcomeMeasurement {
                score: Some(score),
                revenue_impact: Some(score * 25.0),
                velocity_change: Some(score - 0.3),
            },
            at,
        )?;
    }
    Ok(assignments.len())
}

fn run_demo(
    config: &AppConfig,
    store: Arc<InMemoryStore>,
    method: AllocationMethod,
    rng: &mut StdRng,
) -> anyhow::Result<()> {
    let manager = experiment_manager(config, store.clone());
    let created = manager.create_experiment(
        experiment_request(method, config.bandit.default_max_duration_days),
        rng,
    )?;
    print_json(&created)?;

    let now = Utc::now();
    let started = manager.start_experiment(&created.experiment_id, "seller-0", now)?;
    info!(
        experiment_id = %created.experiment_id,
        message = %started.message,
        "Experiment running"
    );

    let recorded = record_outcomes(&manager, &store, &created.experiment_id, now, rng)?;
    info!(recorded, "Synthetic outcomes recorded");

    let status =
        manager.get_experiment_status(&created.experiment_id, "seller-0", now + Duration::days(3))?;
    print_json(&status)?;

    // One online decision and its reward against the Q-policy.
    let policy = QPolicy::new(store.clone(), store.clone(), config.q_learning.clone());
    let assignments = store.assignments(&created.experiment_id)?;
    let first = match assignments.first() {
        Some(a) => store.get_listing(&a.listing_id)?,
        None => None,
    };
    if let Some(listing) = first {
        let features = StateEncoder::features_from_listing(&listing, now);
        let decision = policy.next_action(&listing.id, features.clone(), true, rng)?;
        print_json(&decision)?;

        let recorded = policy.record_reward(
            &listing.id,
            Reward::new(0.2, 0.1, config.training.delayed_reward_weight),
            Some(features),
        )?;
        print_json(&recorded)?;
    }
    Ok(())
}

async fn run_training(
    config: &AppConfig,
    store: Arc<InMemoryStore>,
    request: TrainingRequest,
    seed: u64,
) -> anyhow::Result<()> {
    let policy = Arc::new(QPolicy::new(
        store.clone(),
        store.clone(),
        config.q_learning.clone(),
    ));
    let simulator = Arc::new(EpisodeSimulator::new(
        policy,
        store,
        config.training.clone(),
        config.bandit.max_eligible_listings,
    ));
    let jobs = TrainingJobManager::new(
        simulator,
        std::time::Duration::from_secs(config.training.job_timeout_secs),
        config.training.max_retained_jobs,
    );

    let id = jobs.submit(request, seed)?;
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(250));
    loop {
        interval.tick().await;
        let job = jobs.status(&id)?;
        if job.state.is_terminal() {
            break;
        }
        info!(
            job_id = %id,
            state = job.state.as_str(),
            episodes_completed = job.episodes_completed,
            episodes_requested = job.episodes_requested,
            "Training in progress"
        );
    }

    let job = jobs.wait(&id).await?;
    print_json(&job)?;
    Ok(())
}

fn run_sweep(
    config: &AppConfig,
    store: Arc<InMemoryStore>,
    rng: &mut StdRng,
) -> anyhow::Result<()> {
    let manager = experiment_manager(config, store.clone());
    let duration_days = 14;
    let started_at = Utc::now() - Duration::days(duration_days as i64 + 1);

    for method in [AllocationMethod::Equal, AllocationMethod::ThompsonSampling] {
        let created = manager.create_experiment(experiment_request(method, duration_days), rng)?;
        manager.start_experiment(&created.experiment_id, "seller-0", started_at)?;
        let recorded_at = started_at + Duration::days(1);
        record_outcomes(&manager, &store, &created.experiment_id, recorded_at, rng)?;
    }

    let events = manager.complete_expired(Utc::now())?;
    info!(completed = events.len(), "Sweep finished");
    print_json(&events)?;
    Ok(())
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
