//! Composition root.
//!
//! Builds every component in dependency order, owns them for the process
//! lifetime, and tears them down in reverse order on shutdown. There are no
//! process-wide singletons: anything that needs a component gets a handle
//! from here at construction time. `start` is guarded one-shot; starting a
//! manager twice is a programming error and fails loudly.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {anyhow::Context, tracing::info};

use {
    roost_auth::{LogMailer, Mailer, RegistrationService, VerificationCodeManager},
    roost_cache::CacheManager,
    roost_config::SharedConfig,
    roost_queue::{MessageQueue, QueueConfig},
    roost_redis::RedisHandle,
    roost_sessions::SessionManager,
    roost_storage::{ConnectionPool, UserIdGenerator, UserStore},
    roost_tls::{CertStore, FsCertStore},
};

use crate::{
    acceptor::{ClientRegistry, TcpServer},
    dispatch::ProtocolHandler,
    events::EventBus,
};

pub struct ServerManager {
    config: SharedConfig,
    pool: ConnectionPool,
    sessions: Arc<SessionManager>,
    cache: Arc<CacheManager>,
    ids: Arc<UserIdGenerator>,
    queue: Arc<MessageQueue>,
    server: Arc<TcpServer>,
    started: AtomicBool,
    background: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ServerManager {
    /// Construct every component against the given config. Fails fast when a
    /// backing service (MySQL, Redis, certificates) is unavailable; that is
    /// an initialization failure, reported before the process daemonizes.
    pub async fn build(config: SharedConfig) -> anyhow::Result<Self> {
        let cfg = config.get();

        // Storage first; everything sits on the pool.
        let pool = ConnectionPool::connect(&cfg.database)
            .await
            .context("database pool")?;
        let users = UserStore::new(pool.clone());
        let ids = UserIdGenerator::new(pool.clone());
        ids.ensure_initialized()
            .await
            .context("user id sequence")?;

        let redis = RedisHandle::connect(&cfg.redis).await.context("redis")?;

        let sessions = SessionManager::new(redis.clone(), config.clone());
        let cache = CacheManager::new(pool.clone());
        let codes = VerificationCodeManager::new(pool.clone(), redis.clone(), config.clone());
        let registration = RegistrationService::new(
            users.clone(),
            Arc::clone(&codes),
            Arc::clone(&ids),
            config.clone(),
        );
        let mailer: Arc<dyn Mailer> = Arc::new(LogMailer);

        let handler = ProtocolHandler::new(
            config.clone(),
            users,
            Arc::clone(&sessions),
            registration,
            codes,
            Arc::clone(&cache),
            mailer,
        );

        let tls = if cfg.server.use_tls {
            let store = FsCertStore::new().context("certificate store")?;
            let (_ca, cert, key) = store.ensure_certs().context("certificate material")?;
            Some(
                store
                    .build_rustls_config(&cert, &key)
                    .context("TLS configuration")?,
            )
        } else {
            None
        };

        let registry = ClientRegistry::new();
        let server = TcpServer::new(config.clone(), handler, registry, EventBus::new(), tls);
        let queue = MessageQueue::new(QueueConfig::default());

        Ok(Self {
            config,
            pool,
            sessions,
            cache,
            ids,
            queue,
            server,
            started: AtomicBool::new(false),
            background: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Start everything in dependency order: queue workers first (they are
    /// pure consumers), then the acceptor, then the periodic maintenance.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            anyhow::bail!("server manager already started");
        }

        let mut background = Vec::new();
        background.extend(self.queue.start(self.server.clone()));
        self.server.start().await?;
        background.push(self.sessions.spawn_cleanup());
        background.extend(self.cache.spawn_maintenance());

        if let Ok(mut tasks) = self.background.lock() {
            *tasks = background;
        }
        info!("all components started");
        Ok(())
    }

    /// Stop in reverse dependency order: acceptor (no new traffic), queue
    /// (bounded drain), periodic tasks, then the pool.
    pub async fn stop(&self) {
        info!("shutting down");
        self.server.stop().await;
        self.queue.shutdown().await;

        let tasks = self
            .background
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }

        self.pool.close().await;
        info!("shutdown complete");
    }

    /// Aggregate statistics across components.
    pub fn statistics(&self) -> serde_json::Value {
        serde_json::json!({
            "server": self.server.statistics(),
            "queue": self.queue.statistics(),
            "sessions": self.sessions.stats(),
            "pool": self.pool.statistics(),
        })
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn server(&self) -> Arc<TcpServer> {
        Arc::clone(&self.server)
    }

    pub fn queue(&self) -> Arc<MessageQueue> {
        Arc::clone(&self.queue)
    }

    pub fn sequence(&self) -> Arc<UserIdGenerator> {
        Arc::clone(&self.ids)
    }

    pub fn cache(&self) -> Arc<CacheManager> {
        Arc::clone(&self.cache)
    }
}
