use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use conduit_http::connection::{ConnectionStats, CountingIo, HttpConnection, HttpService};
use conduit_http::dispatch::{Dispatcher, DispatcherPipeline};
use conduit_http::firewall::Firewall;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::bandwidth::spawn_sampler;
use crate::config::{ConfigError, ServerConfig};
use crate::dispatchers::ConnectionsDispatcher;
use crate::registry::ConnectionRegistry;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("can't bind {address}: {source}")]
    Bind { address: SocketAddr, source: io::Error },
}

pub struct ServerBuilder {
    config: ServerConfig,
    dispatchers: Vec<Box<dyn Dispatcher>>,
    firewall: Option<Arc<dyn Firewall>>,
}

impl ServerBuilder {
    fn new() -> Self {
        Self { config: ServerConfig::default(), dispatchers: vec![], firewall: None }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn dispatcher(mut self, dispatcher: impl Dispatcher + 'static) -> Self {
        self.dispatchers.push(Box::new(dispatcher));
        self
    }

    pub fn firewall(mut self, firewall: Arc<dyn Firewall>) -> Self {
        self.firewall = Some(firewall);
        self
    }

    pub fn build(self) -> Result<Server, ServerError> {
        self.config.validate()?;

        let registry = ConnectionRegistry::new();
        let pipeline = self
            .dispatchers
            .into_iter()
            .fold(DispatcherPipeline::builder(), |builder, dispatcher| builder.register_boxed(dispatcher))
            .register(ConnectionsDispatcher::new(registry.clone()))
            .build();
        debug!(?pipeline, "dispatchers ready");

        let mut service = HttpService::new(self.config.http.clone(), pipeline);
        if let Some(firewall) = self.firewall {
            service = service.with_firewall(firewall);
        }

        Ok(Server { config: self.config, service: Arc::new(service), registry })
    }
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("dispatchers", &self.dispatchers.len())
            .field("firewall", &self.firewall.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    service: Arc<HttpService>,
    registry: ConnectionRegistry,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn service(&self) -> &Arc<HttpService> {
        &self.service
    }

    /// Binds the configured address and serves until `ctrl_c`.
    pub async fn start(self) -> Result<(), ServerError> {
        let address = self.config.bind_address()?;
        let listener = TcpListener::bind(address).await.map_err(|source| ServerError::Bind { address, source })?;
        info!(%address, "start listening");

        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(cause = %e, "can't listen for ctrl_c");
                std::future::pending::<()>().await;
            }
        })
        .await;
        Ok(())
    }

    /// Accepts connections from `listener` until `shutdown` completes.
    ///
    /// Connections already accepted keep running on their own tasks.
    pub async fn serve(self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        let sampler = spawn_sampler(self.registry.clone(), self.config.bandwidth_interval());
        tokio::pin!(shutdown);

        loop {
            let (tcp_stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(stream_and_addr) => stream_and_addr,
                    Err(e) => {
                        warn!(cause = %e, "failed to accept");
                        continue;
                    }
                },
                () = &mut shutdown => {
                    info!("shutting down, no longer accepting connections");
                    break;
                }
            };

            self.spawn_connection(tcp_stream, remote_addr);
        }

        sampler.abort();
    }

    fn spawn_connection(&self, tcp_stream: TcpStream, remote_addr: SocketAddr) {
        let stats = Arc::new(ConnectionStats::new(remote_addr));
        let registration = self.registry.register(Arc::clone(&stats));
        let service = Arc::clone(&self.service);
        let ssl = self.config.ssl;
        service.server_stats().connection_opened();

        tokio::spawn(async move {
            let (reader, writer) = tcp_stream.into_split();
            let reader = CountingIo::new(reader, Arc::clone(&stats));
            let writer = CountingIo::new(writer, Arc::clone(&stats));
            let connection = HttpConnection::new(reader, writer, Arc::clone(&service), stats, ssl);
            match connection.process().await {
                Ok(()) => debug!(remote = %remote_addr, "finished process, connection shutdown"),
                Err(e) => info!(remote = %remote_addr, cause = %e, "connection shutdown with error"),
            }
            drop(registration);
            service.server_stats().connection_closed();
        });
    }
}
