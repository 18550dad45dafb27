//! Gateway coordinator
//!
//! Binds the gateway endpoint and the ingress listeners, runs them until the
//! shutdown token is cancelled or one of them fails, then drains every relay
//! within the configured grace period.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vicar_egress::EgressDispatchers;
use vicar_ingress::IngressListener;
use vicar_mapping::MappingTable;
use vicar_router::Router;
use vicar_server_h2::{load_tls_acceptor, GatewayServer, GatewayService};
use vicar_transport::{ConnectorSettings, H2Connector, TaskScope};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::lifecycle::{FirstError, Lifecycle, LifecycleState};

/// A validated, not yet started gateway
#[derive(Debug)]
pub struct Gateway {
    config: GatewayConfig,
    table: Arc<MappingTable>,
    lifecycle: Arc<Lifecycle>,
}

/// Sockets bound during startup
struct Bound {
    server: GatewayServer,
    upstream: Option<Arc<H2Connector>>,
    ingress: Vec<IngressListener>,
}

impl Gateway {
    /// Validate the configuration and build the mapping table
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let table = config.validate()?;
        Ok(Self {
            config,
            table: Arc::new(table),
            lifecycle: Arc::new(Lifecycle::new()),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn table(&self) -> &MappingTable {
        &self.table
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    /// Bind every socket and start serving
    ///
    /// Returns once the gateway is `Running`. A bind failure leaves the
    /// gateway `Stopped` and is returned here.
    pub async fn start(self, shutdown: CancellationToken) -> Result<RunningGateway, GatewayError> {
        self.lifecycle.transition(LifecycleState::Starting);

        for key in self.table.ambiguous_keys() {
            warn!("Service '{}' shadows egress port {}; the service wins", key, key);
        }

        let scope = TaskScope::child_of(&shutdown);
        let settings = ConnectorSettings {
            connect_timeout: self.config.connect_timeout,
        };

        let egress = match EgressDispatchers::from_table(&self.table, &settings) {
            Ok(egress) => egress,
            Err(e) => {
                self.abort_start();
                return Err(e.into());
            }
        };

        let bound = match self.bind(&settings).await {
            Ok(bound) => bound,
            Err(e) => {
                error!("Gateway failed to start: {}", e);
                egress.close_all().await;
                self.abort_start();
                return Err(e);
            }
        };

        let router = Router::new(
            self.table.clone(),
            egress.clone(),
            self.config.local_ip,
            self.config.connect_timeout,
            scope.clone(),
        );
        let service = GatewayService::new(router, scope.clone(), self.config.shutdown_timeout);

        let local_addr = bound.server.local_addr();
        let mut ingress_addrs = HashMap::with_capacity(bound.ingress.len());
        let mut tasks: JoinSet<Result<(), GatewayError>> = JoinSet::new();

        let server = bound.server;
        tasks.spawn(async move { server.serve(service).await.map_err(GatewayError::from) });

        if let Some(upstream) = &bound.upstream {
            for listener in bound.ingress {
                ingress_addrs.insert(listener.name().to_string(), listener.local_addr());
                let connector = upstream.clone();
                let scope = scope.clone();
                tasks.spawn(async move {
                    listener
                        .run(connector, scope)
                        .await
                        .map_err(GatewayError::from)
                });
            }
        }

        self.lifecycle.transition(LifecycleState::Running);
        info!(
            "Gateway running on {} ({} service(s), {} egress port(s))",
            local_addr,
            self.table.services().len(),
            egress.len()
        );

        let supervisor = Supervisor {
            lifecycle: self.lifecycle.clone(),
            scope: scope.clone(),
            egress,
            upstream: bound.upstream,
            shutdown_timeout: self.config.shutdown_timeout,
        };
        let handle = tokio::spawn(supervisor.run(tasks));

        Ok(RunningGateway {
            local_addr,
            ingress_addrs,
            state: self.lifecycle.subscribe(),
            scope,
            supervisor: handle,
        })
    }

    /// Start and wait until the gateway stops
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), GatewayError> {
        self.start(shutdown).await?.wait().await
    }

    async fn bind(&self, settings: &ConnectorSettings) -> Result<Bound, GatewayError> {
        let tls = match &self.config.tls {
            Some(files) => Some(load_tls_acceptor(&files.cert, &files.key)?),
            None => None,
        };

        let server = GatewayServer::bind(self.config.listen, tls).await?;

        let upstream = match &self.config.upstream {
            Some(url) => Some(Arc::new(H2Connector::new(url.clone(), settings.clone())?)),
            None => None,
        };

        let mut ingress = Vec::new();
        if upstream.is_some() {
            for mapping in self.table.services() {
                ingress.push(IngressListener::bind(mapping.clone(), self.config.local_ip).await?);
            }
        } else if !self.table.services().is_empty() {
            info!("No upstream configured; ingress listeners disabled");
        }

        Ok(Bound {
            server,
            upstream,
            ingress,
        })
    }

    fn abort_start(&self) {
        self.lifecycle.transition(LifecycleState::Draining);
        self.lifecycle.transition(LifecycleState::Stopped);
    }
}

/// Owns the running tasks and performs the shutdown sequence
struct Supervisor {
    lifecycle: Arc<Lifecycle>,
    scope: TaskScope,
    egress: EgressDispatchers,
    upstream: Option<Arc<H2Connector>>,
    shutdown_timeout: Duration,
}

impl Supervisor {
    async fn run(self, mut tasks: JoinSet<Result<(), GatewayError>>) -> Result<(), GatewayError> {
        let first = FirstError::new(self.scope.token().clone());
        let token = self.scope.token().clone();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                joined = tasks.join_next() => match joined {
                    Some(result) => record(&first, result),
                    None => break,
                },
            }
        }

        self.lifecycle.transition(LifecycleState::Draining);
        info!("Gateway draining");
        self.scope.cancel();

        while let Some(result) = tasks.join_next().await {
            record(&first, result);
        }

        self.scope.close_and_wait(self.shutdown_timeout).await;
        self.egress.close_all().await;
        if let Some(upstream) = &self.upstream {
            upstream.close().await;
        }

        self.lifecycle.transition(LifecycleState::Stopped);

        match first.take() {
            Some(e) => {
                error!("Gateway stopped with error: {}", e);
                Err(e)
            }
            None => {
                info!("Gateway stopped");
                Ok(())
            }
        }
    }
}

fn record(first: &FirstError<GatewayError>, result: Result<Result<(), GatewayError>, JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            first.record(e);
        }
        Err(e) => {
            first.record(GatewayError::TaskPanicked(e.to_string()));
        }
    }
}

/// Handle to a started gateway
#[derive(Debug)]
pub struct RunningGateway {
    local_addr: SocketAddr,
    ingress_addrs: HashMap<String, SocketAddr>,
    state: watch::Receiver<LifecycleState>,
    scope: TaskScope,
    supervisor: JoinHandle<Result<(), GatewayError>>,
}

impl RunningGateway {
    /// Bound address of the gateway endpoint
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound address of the ingress listener for service `name`
    pub fn ingress_addr(&self, name: &str) -> Option<SocketAddr> {
        self.ingress_addrs.get(name).copied()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.clone()
    }

    /// Begin shutdown without waiting for it
    pub fn shutdown(&self) {
        self.scope.cancel();
    }

    /// Wait for the gateway to stop; returns the first fatal error
    pub async fn wait(self) -> Result<(), GatewayError> {
        match self.supervisor.await {
            Ok(result) => result,
            Err(e) => Err(GatewayError::TaskPanicked(e.to_string())),
        }
    }

    /// Shut down and wait
    pub async fn stop(self) -> Result<(), GatewayError> {
        self.shutdown();
        self.wait().await
    }
}
