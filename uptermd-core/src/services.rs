use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use uptermd_common::{RoutingMode, UptermConfig};

use crate::net::{NetProvider, TcpNetProvider};
use crate::routing::{ConsulRouter, MemoryRouter, SessionRouter};
use crate::{NoopHooks, SessionHooks, State};

/// Everything a subsystem needs, cloned into each of them. No ambient
/// singletons; tests assemble their own with in-memory parts.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<Mutex<UptermConfig>>,
    pub state: Arc<Mutex<State>>,
    pub router: Arc<dyn SessionRouter>,
    pub hooks: Arc<dyn SessionHooks>,
    pub net: Arc<dyn NetProvider>,
}

impl Services {
    pub async fn new(config: UptermConfig) -> Result<Self> {
        let router: Arc<dyn SessionRouter> = match config.routing.mode {
            RoutingMode::Embedded => Arc::new(MemoryRouter::new()),
            RoutingMode::Consul => Arc::new(
                ConsulRouter::new(
                    &config.routing.consul_url,
                    config.routing.consul_ttl,
                    &config.node_addr,
                )
                .await?,
            ),
        };
        Ok(Self::assemble(
            config,
            router,
            Arc::new(NoopHooks),
            Arc::new(TcpNetProvider),
        ))
    }

    pub fn assemble(
        config: UptermConfig,
        router: Arc<dyn SessionRouter>,
        hooks: Arc<dyn SessionHooks>,
        net: Arc<dyn NetProvider>,
    ) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
            state: State::new(),
            router,
            hooks,
            net,
        }
    }
}
