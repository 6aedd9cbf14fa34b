//! HotShield demo
//!
//! Runs a skewed read workload against a simulated backing store through the
//! funnel, using the in-process adapters, and prints the funnel metrics.
//!
//! ```text
//! workers ──▶ Cached("product") ──▶ L1 ─▶ L2 ─▶ L3 ─▶ L4 ──▶ backing store
//!                                                           (1ms per load)
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hotshield::adapters::{
    InMemoryBroadcastBus, InMemoryDelayQueue, InMemoryLockService, InMemorySharedCache,
    LoggingRuleListener,
};
use hotshield::config::Settings;
use hotshield::funnel::{CacheKey, Cached, Context, EvictTiming};
use hotshield::rule::{
    ConsistencyConfig, L2Config, L3Config, Rule, YamlFileConfigSource,
};
use hotshield::{Error, HotShield, Result};

const RESOURCE: &str = "product";

// =============================================================================
// CLI Arguments
// =============================================================================

/// HotShield demo - hotspot protection over a simulated backing store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (YAML); watched for rule changes while running
    #[arg(long, env = "HOTSHIELD_CONFIG")]
    config: Option<PathBuf>,

    /// Total number of reads
    #[arg(long, env = "HOTSHIELD_REQUESTS", default_value = "20000")]
    requests: usize,

    /// Size of the key space
    #[arg(long, env = "HOTSHIELD_KEYS", default_value = "1000")]
    keys: u64,

    /// Keys receiving the hot share of traffic
    #[arg(long, env = "HOTSHIELD_HOT_KEYS", default_value = "5")]
    hot_keys: u64,

    /// Share of reads going to the hot keys (0.0 - 1.0)
    #[arg(long, env = "HOTSHIELD_HOT_RATIO", default_value = "0.8")]
    hot_ratio: f64,

    /// Concurrent readers
    #[arg(long, env = "HOTSHIELD_WORKERS", default_value = "16")]
    workers: usize,

    /// Workload seed
    #[arg(long, env = "HOTSHIELD_SEED", default_value = "7")]
    seed: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Product {
    id: u64,
    name: String,
    version: u64,
}

/// Simulated backing store counting every load.
#[derive(Default)]
struct BackingStore {
    loads: AtomicU64,
    version: AtomicU64,
}

impl BackingStore {
    async fn find(&self, id: u64) -> anyhow::Result<Option<Product>> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(1)).await;
        Ok(Some(Product {
            id,
            name: format!("product-{}", id),
            version: self.version.load(Ordering::Relaxed),
        }))
    }

    async fn bump(&self) -> anyhow::Result<u64> {
        Ok(self.version.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting HotShield demo");
    info!("  Requests: {}", args.requests);
    info!("  Keys: {} ({} hot, {:.0}% of traffic)", args.keys, args.hot_keys, args.hot_ratio * 100.0);
    info!("  Workers: {}", args.workers);

    let settings = match &args.config {
        Some(path) => Settings::from_file(path)?,
        None => demo_settings(),
    };

    let mut builder = HotShield::builder()
        .settings(settings)
        .shared_cache(Arc::new(InMemorySharedCache::new()))
        .lock_service(Arc::new(InMemoryLockService::new()))
        .broadcast_bus(Arc::new(InMemoryBroadcastBus::new()))
        .delay_queue(Arc::new(InMemoryDelayQueue::with_time_divisor(10)))
        .listener(Arc::new(LoggingRuleListener::info_level()));
    if let Some(path) = &args.config {
        builder = builder.config_source(Arc::new(YamlFileConfigSource::new(path)));
    }
    let shield = builder.build()?;
    shield.start().await?;

    let store = Arc::new(BackingStore::default());
    let loader_store = Arc::clone(&store);
    let get_product = Cached::new(
        shield.funnel(),
        RESOURCE,
        |id: &u64| Some(CacheKey::from(*id)),
        move |id: u64| {
            let store = Arc::clone(&loader_store);
            async move { store.find(id).await }
        },
    );

    let started = Instant::now();
    let per_worker = args.requests / args.workers.max(1);
    let workers = (0..args.workers.max(1)).map(|worker| {
        let get_product = &get_product;
        let args = &args;
        async move {
            let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(worker as u64));
            let mut failures = 0u64;
            for _ in 0..per_worker {
                let id = pick_key(&mut rng, args);
                if get_product.call(id).await.is_err() {
                    failures += 1;
                }
            }
            failures
        }
    });
    let failures: u64 = futures::future::join_all(workers).await.into_iter().sum();
    let elapsed = started.elapsed();

    // One write to the hottest key
    let hottest = Context::new(RESOURCE, 0u64);
    let version = shield
        .handle_evict(&hottest, EvictTiming::After, true, true, || store.bump())
        .await
        .map_err(|e| Error::Internal(format!("demo write failed: {}", e)))?;
    info!(version, "Wrote hottest key");

    let snapshot = shield.metrics();
    let served = (per_worker * args.workers.max(1)) as u64;
    let loads = store.loads.load(Ordering::Relaxed);

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    println!();
    println!("Reads:            {}", served);
    println!("Failures:         {}", failures);
    println!("Backing loads:    {}", loads);
    println!(
        "Load reduction:   {:.1}%",
        if served == 0 {
            0.0
        } else {
            100.0 * (1.0 - loads as f64 / served as f64)
        }
    );
    if let Some(stats) = shield.l1_stats(RESOURCE) {
        println!(
            "L1 entries:       {} / {} (hit ratio {:.2})",
            stats.entries, stats.max_entries, stats.hit_ratio
        );
    }
    println!("Elapsed:          {:?}", elapsed);

    let dropped = shield.shutdown().await;
    info!(dropped, "HotShield demo finished");
    Ok(())
}

fn pick_key(rng: &mut StdRng, args: &Args) -> u64 {
    let hot_keys = args.hot_keys.clamp(1, args.keys.max(1));
    if rng.gen_bool(args.hot_ratio.clamp(0.0, 1.0)) {
        rng.gen_range(0..hot_keys)
    } else {
        rng.gen_range(0..args.keys.max(1))
    }
}

fn demo_settings() -> Settings {
    let rule = Rule::new(RESOURCE)
        .with_l2(L2Config {
            window_secs: 10,
            threshold: 3,
            enabled: true,
        })
        .with_l3(L3Config {
            qps_threshold: 20.0,
            window_secs: 1,
            enabled: true,
        })
        .with_consistency(ConsistencyConfig {
            delay_ms: 1000,
            ..Default::default()
        });

    Settings {
        rules: vec![rule],
        ..Default::default()
    }
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
