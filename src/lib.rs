//! Service wiring: builds every subsystem from one [`PulsewatchConfig`].

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use pulsewatch_adapter_balancer::{AutoScaler, BalancerCollector, LoadBalancer, LoggingScaleExecutor, prober_for};
use pulsewatch_adapter_metrics::{MetricStore, SystemCollector, storage};
use pulsewatch_adapter_notification::NotificationDispatcher;
use pulsewatch_adapter_pool::{ConnectionPoolManager, PoolCollector, SqliteConnectionFactory};
use pulsewatch_application::{AlertEngine, Orchestrator, Schedule, Subsystems};
use pulsewatch_domain::{Channel, Clock, PulsewatchConfig, SystemClock};
use pulsewatch_ports::{ChannelSender, InstanceProber, SampleCollector, ScaleExecutor, ScalingControl};

pub use pulsewatch_domain as domain;

pub type SqlitePool = ConnectionPoolManager<SqliteConnectionFactory>;

/// Every wired subsystem plus the orchestrator driving them.
pub struct Services {
    pub config: PulsewatchConfig,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<MetricStore>,
    pub notifications: Arc<NotificationDispatcher>,
    pub alerts: Arc<AlertEngine>,
    pub pool: Arc<SqlitePool>,
    pub balancer: Arc<LoadBalancer>,
    pub scaler: Option<Arc<AutoScaler>>,
    pub orchestrator: Orchestrator,
}

impl Services {
    /// Opens the pool's minimum connections ahead of the first request.
    pub async fn warm_up(&self) -> Result<()> {
        let opened = self
            .pool
            .warm_up()
            .await
            .context("warming up connection pool")?;
        info!(opened, "connection pool warmed up");
        Ok(())
    }
}

pub struct ServiceBuilder {
    config: PulsewatchConfig,
    clock: Arc<dyn Clock>,
    prober: Option<Arc<dyn InstanceProber>>,
    executor: Arc<dyn ScaleExecutor>,
    senders: Vec<(Channel, Arc<dyn ChannelSender>)>,
}

impl ServiceBuilder {
    pub fn new(config: PulsewatchConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            prober: None,
            executor: Arc::new(LoggingScaleExecutor),
            senders: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the probe built from `balancer.probe`.
    pub fn with_prober(mut self, prober: Arc<dyn InstanceProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn with_scale_executor(mut self, executor: Arc<dyn ScaleExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Installs an enabled sender for `channel`, overriding its configured provider.
    pub fn with_sender(mut self, channel: Channel, sender: Arc<dyn ChannelSender>) -> Self {
        self.senders.push((channel, sender));
        self
    }

    pub fn build(self) -> Result<Services> {
        let config = self.config;
        config.validate()?;
        let clock = self.clock;

        let backend =
            storage::from_config(&config.metrics.backend).context("opening metric storage")?;
        let metrics = Arc::new(
            MetricStore::new(
                backend,
                Arc::clone(&clock),
                config.metrics.buffer_capacity,
                config.metrics.retention,
            )
            .with_health_window(config.metrics.health_window),
        );

        let notifications = Arc::new(
            NotificationDispatcher::from_config(&config.notifications, Arc::clone(&clock))
                .context("building notification dispatcher")?,
        );
        for (channel, sender) in self.senders {
            notifications.set_sender(channel, true, sender);
        }

        let alerts = Arc::new(AlertEngine::new(
            metrics.clone(),
            notifications.clone(),
            Arc::clone(&clock),
            config.alerts.history_retention,
        ));
        for rule in &config.alerts.rules {
            alerts.configure_rule(rule.to_rule());
        }

        let pool = Arc::new(ConnectionPoolManager::new(
            SqliteConnectionFactory::new(config.pool.database_path.clone()),
            config.pool.clone(),
        ));

        let prober = match self.prober {
            Some(prober) => prober,
            None => prober_for(config.balancer.probe, config.balancer.probe_timeout)?,
        };
        let balancer = Arc::new(
            LoadBalancer::new(&config.balancer, prober, Arc::clone(&clock))
                .context("building load balancer")?,
        );

        let scaler = if config.autoscaler.enabled {
            let initial = u32::try_from(config.balancer.instances.len()).unwrap_or(u32::MAX);
            Some(Arc::new(AutoScaler::new(
                config.autoscaler.clone(),
                self.executor,
                Arc::clone(&clock),
                initial,
            )))
        } else {
            info!("autoscaler disabled");
            None
        };

        let mut collectors: Vec<Arc<dyn SampleCollector>> = vec![
            Arc::new(PoolCollector::new(pool.clone(), Arc::clone(&clock))),
            Arc::new(BalancerCollector::new(balancer.clone(), Arc::clone(&clock))),
        ];
        if config.metrics.collect_system {
            if cfg!(target_os = "linux") {
                collectors.push(Arc::new(SystemCollector::new(Arc::clone(&clock))));
            } else {
                warn!("system metrics need /proc; host collection disabled");
            }
        }

        let subsystems = Subsystems {
            metrics: metrics.clone(),
            alerts: alerts.clone(),
            notifications: notifications.clone(),
            collectors,
            pool: Some(pool.clone()),
            balancer: Some(balancer.clone()),
            scaler: scaler
                .clone()
                .map(|scaler| scaler as Arc<dyn ScalingControl>),
        };
        let orchestrator =
            Orchestrator::new(subsystems, Schedule::from_config(&config), Arc::clone(&clock));

        info!(
            rules = config.alerts.rules.len(),
            channels = config.notifications.channels.len(),
            instances = config.balancer.instances.len(),
            "services wired"
        );
        Ok(Services {
            config,
            clock,
            metrics,
            notifications,
            alerts,
            pool,
            balancer,
            scaler,
            orchestrator,
        })
    }
}
