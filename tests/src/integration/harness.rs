//! # Test Fixtures
//!
//! Everything binds to `127.0.0.1:0`, so tests can run in parallel.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use tunnel_broker::{BrokerConfig, BrokerError, BrokerService, WorkerId};
use tunnel_worker::{RequestHandler, WorkerClient, WorkerConfig, WorkerError, WorkerEvent};

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

/// Broker config bound to loopback
pub fn broker_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.server.host = Ipv4Addr::LOCALHOST.into();
    config.server.port = 0;
    config
}

/// A broker serving on an ephemeral port
pub struct RunningBroker {
    pub service: Arc<BrokerService>,
    pub addr: SocketAddr,
    task: JoinHandle<Result<(), BrokerError>>,
}

impl RunningBroker {
    pub async fn start(config: BrokerConfig) -> Self {
        let service = Arc::new(BrokerService::new(config).expect("valid broker config"));
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind broker");
        let addr = listener.local_addr().expect("local addr");

        let task = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.serve(listener).await })
        };

        Self {
            service,
            addr,
            task,
        }
    }

    pub fn tunnel_url(&self) -> String {
        format!("ws://{}/tunnel", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn worker_count(&self) -> usize {
        self.service.state().registry().len()
    }

    pub fn pending_count(&self) -> usize {
        self.service.state().pending().pending_count()
    }

    /// Poll until exactly `count` workers are registered
    pub async fn wait_for_workers(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.worker_count() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {count} workers, have {}", self.worker_count()));
    }

    pub async fn stop(self) {
        self.service.shutdown();
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("broker stops")
            .expect("broker task")
            .expect("broker serve");
    }
}

/// A worker client running in the background
pub struct RunningWorker {
    pub worker_id: WorkerId,
    pub events: mpsc::Receiver<WorkerEvent>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), WorkerError>>,
}

impl RunningWorker {
    /// Start a client and wait for its first registration
    pub async fn start(config: WorkerConfig, handler: Arc<dyn RequestHandler>) -> Self {
        let (events_tx, mut events) = mpsc::channel(32);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let client = WorkerClient::new(config, handler).with_events(events_tx);
        let task = tokio::spawn(async move { client.run(shutdown_rx).await });

        let worker_id = next_registration(&mut events).await;
        Self {
            worker_id,
            events,
            shutdown,
            task,
        }
    }

    /// Wait for the next `Registered` event, skipping the others
    pub async fn next_registration(&mut self) -> WorkerId {
        next_registration(&mut self.events).await
    }

    pub async fn stop(self) -> Result<(), WorkerError> {
        let _ = self.shutdown.send(true);
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("worker stops")
            .expect("worker task")
    }
}

async fn next_registration(events: &mut mpsc::Receiver<WorkerEvent>) -> WorkerId {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(WorkerEvent::Registered(id)) => return id,
                Some(_) => continue,
                None => panic!("worker stopped before registering"),
            }
        }
    })
    .await
    .expect("worker registers")
}

/// Worker config pointed at `broker` with fast reconnects
pub fn worker_config(broker: &RunningBroker) -> WorkerConfig {
    let mut config = WorkerConfig::new(broker.tunnel_url());
    config.reconnect_base_delay = Duration::from_millis(50);
    config.reconnect_max_delay = Duration::from_millis(200);
    config
}

/// Serve `router` as the worker's local service
pub async fn start_local_service(router: Router) -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind local service");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}
