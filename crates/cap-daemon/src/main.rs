// SPDX-License-Identifier: MIT OR Apache-2.0
use anyhow::{Context, Result};
use cap_daemon::webhook_sink::NoopWebhookSink;
use cap_daemon::{build_app, engine::MockEngine, AppState};
use cap_db::{
    ApiKeyRepository, ArtifactRepository, JobRepository, SessionRepository,
    SubscriptionRepository, TenantRepository, UsageRepository, UserRepository,
    WebhookEventRepository,
};
use cap_queue::{QueueBridge, QueueName};
use cap_ratelimit::{KeyCache, RateLimiter, RedisStore};
use cap_reconciler::StripeStyleVerifier;
use cap_ssrf::SsrfPolicy;
use cap_storage::ArtifactStore;
use clap::Parser;
use redis::aio::ConnectionManager;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Per-queue capacity for the in-process screenshot/PDF queues.
const QUEUE_CAPACITY: usize = 1024;
/// Allowed clock skew, in seconds, between the daemon's clock and a
/// billing webhook's signed timestamp.
const WEBHOOK_TOLERANCE_SECS: i64 = 300;
/// How often the retention sweep walks expired jobs and artifacts.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
/// How long an API-key-hash to tenant-id cache entry stays valid.
const KEY_CACHE_TTL_SECS: u64 = 60;

#[derive(Parser, Debug)]
#[command(name = "cap-daemon", version, about = "Capture control plane API daemon")]
struct Args {
    /// Path to a TOML config file. Falls back to built-in defaults plus
    /// environment overrides when omitted.
    #[arg(long, env = "CAP_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Enable verbose request/worker logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config =
        cap_config::load_config(args.config.as_deref()).context("loading configuration")?;

    let filter = if args.debug {
        EnvFilter::new("cap_daemon=debug,cap_db=debug,cap_ratelimit=debug,info")
    } else {
        EnvFilter::new(config.log_level.clone().unwrap_or_else(|| "info".into()))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cap_config::validate_config(&config) {
        Ok(warnings) => {
            for w in warnings {
                warn!(%w, "configuration warning");
            }
        }
        Err(e) => anyhow::bail!("invalid configuration: {e}"),
    }

    let database_url = config
        .database_url
        .clone()
        .context("database_url must be set (CAP_DATABASE_URL or config file)")?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(20)
        .connect(&database_url)
        .await
        .context("connecting to postgres")?;

    let redis_url = config
        .redis_url
        .clone()
        .context("redis_url must be set (CAP_REDIS_URL or config file)")?;
    let redis_client = redis::Client::open(redis_url).context("building redis client")?;
    let redis_conn = ConnectionManager::new(redis_client)
        .await
        .context("connecting to redis")?;

    let storage_cfg = config
        .storage
        .clone()
        .context("storage config must be set (bucket at minimum)")?;
    let storage = ArtifactStore::from_env(
        storage_cfg.bucket.clone(),
        storage_cfg.endpoint.as_deref(),
    )
    .await;

    let webhook_secret = config.webhook_signing_secret.clone().unwrap_or_default();
    if webhook_secret.is_empty() {
        warn!("webhook_signing_secret is unset; inbound billing webhooks will all be rejected");
    }

    let state = Arc::new(AppState {
        tenants: TenantRepository::new(pool.clone()),
        api_keys: ApiKeyRepository::new(pool.clone()),
        sessions: SessionRepository::new(pool.clone()),
        users: UserRepository::new(pool.clone()),
        jobs: JobRepository::new(pool.clone()),
        artifacts: ArtifactRepository::new(pool.clone()),
        usage: UsageRepository::new(pool.clone()),
        webhook_events: WebhookEventRepository::new(pool.clone()),
        subscriptions: SubscriptionRepository::new(pool.clone()),
        rate_limiter: RateLimiter::new(RedisStore::new(redis_conn.clone())),
        key_cache: KeyCache::new(RedisStore::new(redis_conn.clone()), KEY_CACHE_TTL_SECS),
        queue: Mutex::new(QueueBridge::new(QUEUE_CAPACITY)),
        storage,
        ssrf_policy: SsrfPolicy::default(),
        webhook_verifier: Box::new(StripeStyleVerifier {
            secret: webhook_secret,
            tolerance_secs: WEBHOOK_TOLERANCE_SECS,
        }),
        engine: Box::new(MockEngine),
        webhook_sink: Box::new(NoopWebhookSink),
        config,
    });

    tokio::spawn(cap_daemon::worker::run_worker(
        state.clone(),
        QueueName::Screenshot,
    ));
    tokio::spawn(cap_daemon::worker::run_worker(state.clone(), QueueName::Pdf));
    tokio::spawn(cap_daemon::worker::run_retention_sweep(
        state.clone(),
        RETENTION_SWEEP_INTERVAL,
    ));

    let bind_addr = state.config.bind_addr.clone();
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("bind {bind_addr}"))?;
    info!(addr = %bind_addr, "cap-daemon listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("serve")
}
