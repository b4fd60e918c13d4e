//! perpetual - coordinator のデモ／運用 CLI
//!
//! すべて in-memory store 上で動く。
//! - `simulate`: タスクを作り、scheduler の pass を模擬時計で回す
//! - `lock`: 名前付きロックを取得して保持する
//! - `queue`: メッセージを publish し、失敗を注入する handler で消化する

mod logging;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::info;

use perpetual_core::app::{AssignmentScheduler, HeartbeatMonitor, PerpetualTaskRegistry};
use perpetual_core::config::CoordinatorConfig;
use perpetual_core::domain::{
    ClientContext, DelegateId, HandlerError, MessageId, NewPerpetualTask, PerpetualTaskRecord, QueueFilter, QueueMessage,
    UnassignedReason,
};
use perpetual_core::impls::InMemoryRecordStore;
use perpetual_core::lock::PersistentLocker;
use perpetual_core::ports::{Clock, DelegateSelector, IdGenerator, ManualClock, SystemClock, UlidGenerator};
use perpetual_core::queue::{QueueConsumer, QueueHandler, QueueListener, QueueListenerController, QueuePublisher};

use crate::logging::LogFormat;

#[derive(Parser)]
#[command(name = "perpetual", about = "Drive the perpetual-task coordinator against an in-memory store")]
struct Cli {
    /// TOML config file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create tasks and run scheduler passes on a simulated clock.
    Simulate {
        #[arg(long, default_value_t = 10)]
        tasks: usize,
        /// Size of the delegate pool. Zero exercises the backoff path.
        #[arg(long, default_value_t = 3)]
        delegates: usize,
        #[arg(long, default_value_t = 5)]
        ticks: u32,
        /// Disconnect the first delegate before this tick.
        #[arg(long)]
        disconnect_at: Option<u32>,
    },
    /// Acquire a named lock and hold it.
    Lock {
        name: String,
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
        #[arg(long, default_value_t = 1_000)]
        hold_ms: u64,
        /// Wait up to this long for the lock instead of failing at once.
        #[arg(long)]
        wait_ms: Option<u64>,
    },
    /// Publish messages and consume them with a handler that fails first.
    Queue {
        #[arg(long, default_value_t = 5)]
        messages: u32,
        /// Deliveries of each message that fail before one succeeds.
        #[arg(long, default_value_t = 1)]
        fail_first: u32,
        #[arg(long, default_value_t = 2)]
        workers: usize,
        /// Overrides `queue.default_retries`.
        #[arg(long)]
        retries: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format)?;
    let config = CoordinatorConfig::load(cli.config.as_deref()).context("loading config")?;

    match cli.command {
        Command::Simulate {
            tasks,
            delegates,
            ticks,
            disconnect_at,
        } => simulate(&config, tasks, delegates, ticks, disconnect_at).await,
        Command::Lock {
            name,
            timeout_ms,
            hold_ms,
            wait_ms,
        } => hold_lock(&config, &name, timeout_ms, hold_ms, wait_ms).await,
        Command::Queue {
            messages,
            fail_first,
            workers,
            retries,
        } => run_queue(&config, messages, fail_first, workers, retries).await,
    }
}

/// Hands out delegates from a shrinking pool in turn.
struct RoundRobin {
    pool: Mutex<Vec<DelegateId>>,
    next: AtomicUsize,
}

impl RoundRobin {
    fn new(size: usize) -> Self {
        Self {
            pool: Mutex::new((0..size).map(|i| DelegateId::new(format!("delegate-{i}"))).collect()),
            next: AtomicUsize::new(0),
        }
    }

    async fn remove_first(&self) -> Option<DelegateId> {
        let mut pool = self.pool.lock().await;
        if pool.is_empty() {
            return None;
        }
        Some(pool.remove(0))
    }
}

#[async_trait]
impl DelegateSelector for RoundRobin {
    async fn select_delegate(&self, _task: &PerpetualTaskRecord) -> Result<DelegateId, UnassignedReason> {
        let pool = self.pool.lock().await;
        if pool.is_empty() {
            return Err(UnassignedReason::NoDelegateAvailable);
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % pool.len();
        Ok(pool[i].clone())
    }
}

async fn simulate(
    config: &CoordinatorConfig,
    tasks: usize,
    delegates: usize,
    ticks: u32,
    disconnect_at: Option<u32>,
) -> anyhow::Result<()> {
    // (A) 模擬時計・store・registry・scheduler を用意
    let clock = ManualClock::at_millis(SystemClock.now_millis());
    let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
    let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock_arc)));
    let registry = Arc::new(PerpetualTaskRegistry::new(
        Arc::new(InMemoryRecordStore::new()),
        Arc::clone(&clock_arc),
        ids,
    ));
    let selector = Arc::new(RoundRobin::new(delegates));
    let settings = config.scheduler.settings();
    let tick = settings.tick_interval;
    let scheduler = AssignmentScheduler::new(Arc::clone(&registry), selector.clone(), settings);
    let monitor = HeartbeatMonitor::new(Arc::clone(&registry));

    // (B) タスク投入
    let account = "sim-account";
    for i in 0..tasks {
        let spec = NewPerpetualTask::new(account, "sim_watch", ClientContext::client_id(format!("client-{i}")))
            .with_interval_seconds(30);
        registry.create_task(spec).await?;
    }

    // (C) tick ごとに: 切断 -> 割り当て pass -> heartbeat -> 集計を出力
    for t in 0..ticks {
        if disconnect_at == Some(t) {
            if let Some(gone) = selector.remove_first().await {
                monitor.delegate_disconnected(&gone).await?;
            }
        }

        let report = scheduler.run_once().await?;

        let mut heartbeats = 0;
        for task in registry.list_all_tasks_for_account(account).await? {
            if monitor.save_heartbeat(task.id, task.delegate_id.as_ref(), clock.now_millis(), 0).await? {
                heartbeats += 1;
            }
        }

        let counts = registry.counts_for_account(account).await?;
        println!(
            "{}",
            json!({
                "tick": t,
                "examined": report.examined,
                "assigned": report.assigned,
                "failed": report.failed,
                "lost_races": report.lost_races,
                "heartbeats": heartbeats,
                "counts": counts,
            })
        );
        clock.advance(tick);
    }
    Ok(())
}

async fn hold_lock(
    config: &CoordinatorConfig,
    name: &str,
    timeout_ms: u64,
    hold_ms: u64,
    wait_ms: Option<u64>,
) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
    let locker = PersistentLocker::new(Arc::new(InMemoryRecordStore::new()), clock, ids)
        .with_wait_poll_interval(config.lock.wait_poll_interval());
    let timeout = Duration::from_millis(timeout_ms);

    let lock = match wait_ms {
        Some(wait) => {
            locker
                .wait_to_acquire_lock(name, timeout, Duration::from_millis(wait))
                .await?
        }
        None => locker.acquire_lock(name, timeout).await?,
    };
    info!(lock = %lock.name(), owner = %lock.owner(), "holding lock");

    // 保持中は 2 人目が弾かれることを確認
    let contended = locker.acquire_lock(name, timeout).await.is_err();

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(hold_ms)) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    let held_ms = lock.elapsed().as_millis() as u64;
    let overran = lock.elapsed() >= lock.timeout();
    lock.close().await?;
    println!(
        "{}",
        json!({
            "lock": name,
            "held_ms": held_ms,
            "second_caller_rejected": contended,
            "overran_timeout": overran,
        })
    );
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    n: u32,
}

/// Fails the first `fail_first` deliveries of every message.
struct Flaky {
    fail_first: u32,
    attempts: Mutex<HashMap<MessageId, u32>>,
    succeeded: Mutex<HashSet<MessageId>>,
}

#[async_trait]
impl QueueHandler<Greeting> for Flaky {
    async fn on_message(&self, message: &QueueMessage<Greeting>) -> Result<(), HandlerError> {
        let attempt = {
            let mut attempts = self.attempts.lock().await;
            let n = attempts.entry(message.id).or_insert(0);
            *n += 1;
            *n
        };
        if attempt <= self.fail_first {
            return Err(format!("greeting {} failed on attempt {attempt}", message.payload.n).into());
        }
        self.succeeded.lock().await.insert(message.id);
        Ok(())
    }
}

async fn run_queue(
    config: &CoordinatorConfig,
    messages: u32,
    fail_first: u32,
    workers: usize,
    retries: Option<u32>,
) -> anyhow::Result<()> {
    let settings = config.queue.settings();
    let store = Arc::new(InMemoryRecordStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
    let scope = settings.scope("greetings");

    let publisher = QueuePublisher::new(
        store.clone(),
        Arc::clone(&clock),
        ids,
        scope.clone(),
        retries.unwrap_or(settings.default_retries),
        settings.message_ttl,
    );
    let consumer = Arc::new(QueueConsumer::<Greeting>::new(
        store,
        clock,
        scope.subscriptions::<&str>(&[]),
        settings.heartbeat,
    ));
    let handler = Arc::new(Flaky {
        fail_first,
        attempts: Mutex::new(HashMap::new()),
        succeeded: Mutex::new(HashSet::new()),
    });

    // (A) 先にすべて publish
    for n in 0..messages {
        publisher.send(Greeting { n }).await?;
    }

    // (B) listener を workers 本で起動
    let listener = Arc::new(QueueListener::new(
        "greetings",
        Arc::clone(&consumer),
        handler.clone(),
        settings.clone(),
    ));
    let mut controller = QueueListenerController::new();
    controller.register(listener, workers);

    // (C) キューが空になるまでポーリング（最大 30 秒）
    let drained = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match consumer.count(QueueFilter::All).await {
                Ok(0) => break,
                Ok(_) => tokio::time::sleep(Duration::from_millis(100)).await,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    })
    .await;
    // (D) graceful shutdown: 1 heartbeat 分だけ待つ
    let stopped = controller.stop(settings.heartbeat).await;

    match drained {
        Ok(result) => result?,
        Err(_) => tracing::warn!("queue not drained within 30s"),
    }

    let attempts = handler.attempts.lock().await;
    let acked = handler.succeeded.lock().await.len();
    let deliveries: u32 = attempts.values().sum();
    println!(
        "{}",
        json!({
            "published": messages,
            "deliveries": deliveries,
            "acked": acked,
            "requeued": deliveries as usize - attempts.len(),
            "dropped": attempts.len() - acked,
            "clean_shutdown": stopped,
        })
    );
    Ok(())
}
