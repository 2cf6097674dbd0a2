//! Simulates a cache stampede: many concurrent requests over several cache instances ask for one expensive resource
//! at the same moment. Reports how many times the resource was actually computed.
//!
//! ```text
//! RUST_LOG=memo_cache=debug cargo run --example stampede --features demo -- --instances 4 --requests 200
//! ```

use anyhow::Result;
use clap::Parser;
use fieldx::fxstruct;
use memo_cache::prelude::*;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::info;
use tracing::warn;

#[derive(Debug, Clone, clap::Parser)]
#[fxstruct(no_new, get(copy))]
#[clap(about, version, name = "stampede")]
struct Cli {
    /// Number of cache instances, each standing for a separate process.
    #[clap(long, short, env = "STAMPEDE_INSTANCES", default_value_t = 4)]
    instances: usize,

    /// Total number of concurrent requests.
    #[clap(long, short, env = "STAMPEDE_REQUESTS", default_value_t = 100)]
    requests: usize,

    #[fieldx(get(clone))]
    #[clap(long, env = "STAMPEDE_RESOURCE", default_value = "AA-1")]
    resource: String,

    #[fieldx(get(clone))]
    #[clap(long, env = "MEMO_CACHE_TAG", default_value = "stampede")]
    tag: String,

    /// How long the computation takes, milliseconds.
    #[clap(long, env = "STAMPEDE_COMPUTE_MS", default_value_t = 500)]
    compute_ms: u64,

    /// Time to live of the computed value, seconds.
    #[clap(long, env = "STAMPEDE_TTL", default_value_t = 60)]
    ttl: u64,

    #[clap(long, env = "MEMO_CACHE_LOCK_TIMEOUT", default_value_t = 10)]
    lock_timeout: u64,

    #[clap(long, env = "MEMO_CACHE_WAIT_TIMEOUT", default_value_t = 30)]
    wait_timeout: u64,

    /// Use a Redis server instead of the in-process one. Needs the `redis` feature.
    #[fieldx(get(clone))]
    #[clap(long, env = "STAMPEDE_REDIS_URL")]
    redis_url: Option<String>,
}

impl Cli {
    fn config(&self) -> MemoConfig {
        MemoConfig {
            resource_tag:      self.tag(),
            lock_timeout_secs: self.lock_timeout(),
            wait_timeout_secs: self.wait_timeout(),
        }
    }
}

#[derive(Debug, Default)]
struct Report {
    served:       usize,
    failed:       usize,
    computations: usize,
    elapsed:      Duration,
}

fn setup_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    info!("Tracing initialized");
    Ok(())
}

async fn stampede<S, N>(cli: &Cli, instances: Vec<Arc<MemoCache<S, N>>>) -> Result<Report>
where
    S: CacheStore,
    N: NotificationSource,
{
    for cache in &instances {
        cache.listen().await?;
    }

    let computations = Arc::new(AtomicUsize::new(0));
    let delay = Duration::from_millis(cli.compute_ms());
    let ttl = Duration::from_secs(cli.ttl());
    let started = Instant::now();

    let mut requests = JoinSet::new();
    for i in 0..cli.requests() {
        let cache = Arc::clone(&instances[i % instances.len()]);
        let computations = Arc::clone(&computations);
        let resource = cli.resource();
        requests.spawn(async move {
            let label = resource.clone();
            cache
                .fetch(&resource, || async move {
                    let n = computations.fetch_add(1, Ordering::SeqCst) + 1;
                    info!("computing {label}, run #{n}");
                    tokio::time::sleep(delay).await;
                    Ok::<_, MemoError>(Computed::new(format!("computed by run #{n}"), ttl))
                })
                .await
        });
    }

    let mut report = Report::default();
    while let Some(joined) = requests.join_next().await {
        match joined? {
            Ok(_) => report.served += 1,
            Err(err) => {
                warn!("request failed: {err}");
                report.failed += 1;
            }
        }
    }
    report.elapsed = started.elapsed();
    report.computations = computations.load(Ordering::SeqCst);

    for cache in &instances {
        cache.close();
    }
    Ok(report)
}

async fn run_in_memory(cli: &Cli) -> Result<Report> {
    let server = MemoryServer::new();
    let config = cli.config();
    let instances = (0..cli.instances().max(1))
        .map(|_| MemoCache::from_config(Arc::new(server.connect()), Arc::new(server.connect()), &config))
        .collect::<memo_cache::Result<Vec<_>>>()?;
    stampede(cli, instances).await
}

#[cfg(feature = "redis")]
async fn run_on_redis(cli: &Cli, url: &str) -> Result<Report> {
    let config = cli.config();
    let mut instances = Vec::with_capacity(cli.instances().max(1));
    for _ in 0..cli.instances().max(1) {
        let store = Arc::new(RedisConnection::open(url).await?);
        let subscriber = Arc::new(RedisConnection::open(url).await?);
        instances.push(MemoCache::from_config(store, subscriber, &config)?);
    }
    stampede(cli, instances).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing()?;

    #[cfg(feature = "redis")]
    let report = match cli.redis_url() {
        Some(url) => run_on_redis(&cli, &url).await?,
        None => run_in_memory(&cli).await?,
    };
    #[cfg(not(feature = "redis"))]
    let report = {
        if cli.redis_url().is_some() {
            warn!("built without the redis feature, using the in-process server");
        }
        run_in_memory(&cli).await?
    };

    println!(
        "{} requests over {} instances: {} served, {} failed, {} computation(s) in {:.2?}",
        cli.requests(),
        cli.instances(),
        report.served,
        report.failed,
        report.computations,
        report.elapsed
    );
    Ok(())
}
