use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use distributed_tasks::api::{self, ApiState};
use distributed_tasks::coordinator::{Coordinator, CoordinatorConfig};
use distributed_tasks::store::{keys, RedisStore, SharedStore};
use distributed_tasks::task::{ScheduleOptions, Scheduler, Task, TaskResult};
use distributed_tasks::worker::{TaskHandlerRegistry, Worker, WorkerConfig};

#[derive(Debug, Clone)]
struct Config {
    command: String,
    role: String,
    redis_addr: String,
    worker_count: usize,
    monitor: bool,
    priority: u8,
    deadline: Option<String>,
    max_retries: u32,
    steal: bool,
    min_workers: usize,
    max_workers: usize,
    api_addr: Option<String>,
    keep_state: bool,
    task_type: String,
    payload: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: String::new(),
            role: String::new(),
            redis_addr: "localhost:6379".to_string(),
            worker_count: 5,
            monitor: false,
            priority: 1,
            deadline: None,
            max_retries: 3,
            steal: false,
            min_workers: 1,
            max_workers: 10,
            api_addr: None,
            keep_state: false,
            task_type: "test".to_string(),
            payload: "hello world".to_string(),
        }
    }
}

fn usage(program: &str) -> ! {
    eprintln!("Usage: {} <command> [flags]", program);
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  run     --role <coordinator|worker> [--redis HOST:PORT] [--workers N]");
    eprintln!("          [--steal] [--min N] [--max N] [--api ADDR] [--keep-state]");
    eprintln!("  submit  [--redis HOST:PORT] [--priority 1-10] [--deadline RFC3339]");
    eprintln!("          [--retries N] [--type NAME] [--payload DATA] [--monitor]");
    std::process::exit(1);
}

fn parse_or_die<T: std::str::FromStr>(value: &str, program: &str) -> T {
    match value.parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            eprintln!("Invalid numeric value: {}", value);
            usage(program);
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let program = args[0].clone();

    if args.len() < 2 {
        usage(&program);
    }

    let mut cfg = Config {
        command: args[1].clone(),
        ..Config::default()
    };

    let mut i = 2;
    while i < args.len() {
        // Accept both `--flag value` and `--flag=value`.
        let (flag, inline_value) = match args[i].split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (args[i].clone(), None),
        };

        let value = |i: &mut usize| -> String {
            match &inline_value {
                Some(value) => value.clone(),
                None => {
                    *i += 1;
                    if *i >= args.len() {
                        eprintln!("Missing value for {}", flag);
                        usage(&program);
                    }
                    args[*i].clone()
                }
            }
        };

        match flag.as_str() {
            "--role" => cfg.role = value(&mut i),
            "--redis" => cfg.redis_addr = value(&mut i),
            "--workers" => cfg.worker_count = parse_or_die(&value(&mut i), &program),
            "--monitor" => cfg.monitor = true,
            "--priority" => cfg.priority = parse_or_die(&value(&mut i), &program),
            "--deadline" => cfg.deadline = Some(value(&mut i)),
            "--retries" => cfg.max_retries = parse_or_die(&value(&mut i), &program),
            "--steal" => cfg.steal = true,
            "--min" => cfg.min_workers = parse_or_die(&value(&mut i), &program),
            "--max" => cfg.max_workers = parse_or_die(&value(&mut i), &program),
            "--api" => cfg.api_addr = Some(value(&mut i)),
            "--keep-state" => cfg.keep_state = true,
            "--type" => cfg.task_type = value(&mut i),
            "--payload" => cfg.payload = value(&mut i),
            _ => {
                eprintln!("Unknown flag: {}", flag);
                usage(&program);
            }
        }
        i += 1;
    }

    if cfg.command == "run" && cfg.role.is_empty() {
        eprintln!("Role must be specified for the run command");
        usage(&program);
    }
    if cfg.priority < 1 || cfg.priority > 10 {
        eprintln!("Priority must be between 1 and 10");
        std::process::exit(1);
    }

    cfg
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cfg = parse_args();

    match cfg.command.as_str() {
        "run" => run_service(&cfg).await,
        "submit" => submit_and_monitor(&cfg).await,
        command => bail!("Unknown command: {}", command),
    }
}

async fn run_service(cfg: &Config) -> Result<()> {
    let store: Arc<dyn SharedStore> = Arc::new(RedisStore::connect(&cfg.redis_addr).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received interrupt, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    match cfg.role.as_str() {
        "coordinator" => {
            let coordinator = Coordinator::new(
                store.clone(),
                CoordinatorConfig {
                    clean_start: !cfg.keep_state,
                    ..CoordinatorConfig::default()
                },
            );

            if let Some(api_addr) = &cfg.api_addr {
                let state = ApiState::new(store.clone(), TaskHandlerRegistry::new());
                let api_addr = api_addr.clone();
                let api_shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    if let Err(e) = api::serve(state, &api_addr, api_shutdown).await {
                        tracing::error!("API server failed: {}", e);
                    }
                });
            }

            coordinator.run(shutdown_rx).await
        }
        "worker" => {
            let worker = Worker::new(
                store,
                TaskHandlerRegistry::new(),
                WorkerConfig {
                    pool_size: cfg.worker_count,
                    enable_steal: cfg.steal,
                    min_workers: cfg.min_workers,
                    max_workers: cfg.max_workers,
                },
            );
            worker.run(shutdown_rx).await
        }
        role => bail!("Unknown role: {}", role),
    }
}

async fn submit_and_monitor(cfg: &Config) -> Result<()> {
    let store: Arc<dyn SharedStore> = Arc::new(RedisStore::connect(&cfg.redis_addr).await?);
    let scheduler = Scheduler::new(store.clone());

    let deadline = match &cfg.deadline {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|e| anyhow::anyhow!("Invalid deadline format: {}", e))?
                .with_timezone(&Utc),
        ),
        None => None,
    };

    let mut task = Task::new(&cfg.task_type, cfg.payload.clone().into_bytes());
    let opts = ScheduleOptions {
        priority: cfg.priority,
        deadline,
        max_retries: cfg.max_retries,
        dependencies: Vec::new(),
    };
    scheduler.schedule(&mut task, &opts).await?;

    println!(
        "Successfully submitted task: {} with priority {}",
        task.id, task.priority
    );

    if !cfg.monitor {
        return Ok(());
    }

    println!("\nMonitoring task progress...");
    for _ in 0..30 {
        let workers = store.hash_all(keys::WORKERS).await.unwrap_or_default();
        let mut queued = 0;
        for priority in keys::PRIORITY_MIN..=keys::PRIORITY_MAX {
            queued += store
                .zset_len(&keys::priority_queue(priority))
                .await
                .unwrap_or(0);
        }
        let results = store.hash_all(keys::RESULTS).await.unwrap_or_default();

        println!("\nActive workers: {}", workers.len());
        println!("Tasks in queue: {}", queued);
        println!("Completed tasks: {}", results.len());

        for (task_id, raw) in &results {
            let Ok(result) = serde_json::from_str::<TaskResult>(raw) else {
                continue;
            };
            let elapsed = result.end_time - result.start_time;
            println!(
                "Task {} completed in {:.2} seconds",
                task_id,
                elapsed.num_milliseconds() as f64 / 1000.0
            );
        }

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }

    Ok(())
}
