//! Lifecycle wiring: protocol server, expiry collector, durability.
//!
//! The controller owns the core, the processor, and (when a data dir is
//! configured) the keeper. Both protocol adapters funnel every parsed
//! command through [`Controller::handle`], which appends successful
//! modifying commands to the write-ahead log before the response goes
//! back out.
//!
//! ```text
//! adapter -> Request -> handle -> Processor -> Core -> Storage -> Item
//!                          |
//!                          +-> Keeper (WAL) on successful writes
//! ```

pub mod keeper;
pub mod processor;

pub use keeper::{Keeper, KeeperError, SyncPolicy};
pub use processor::Processor;

use crate::core::{Core, CoreConfig};
use crate::message::{Request, Response, Status};
use crate::server;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Server configuration, assembled by the CLI.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Enables persistence when set.
    pub data_dir: Option<PathBuf>,
    pub sync_policy: SyncPolicy,
    /// Cadence of the background expiry collector.
    pub collect_interval: Duration,
    /// Cadence of WAL-into-snapshot compaction.
    pub merge_wal_interval: Duration,
    /// Serve the HTTP API instead of RESP.
    pub use_http: bool,
    pub core: CoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            data_dir: None,
            sync_policy: SyncPolicy::Sometimes,
            collect_interval: Duration::from_secs(100),
            merge_wal_interval: Duration::from_secs(600),
            use_http: false,
            core: CoreConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Keeper(#[from] KeeperError),
}

/// Ties the protocol server, the command pipeline, and the durability
/// subsystem into one lifecycle.
pub struct Controller {
    config: Config,
    core: Arc<Core>,
    processor: Processor,
    keeper: Option<Arc<Keeper>>,
    running: AtomicBool,
    in_flight: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
}

impl Controller {
    pub fn new(config: Config) -> Arc<Self> {
        let core = Arc::new(Core::new(config.core.clone()));
        let keeper = config.data_dir.as_ref().map(|dir| {
            Arc::new(Keeper::new(
                Arc::clone(&core),
                dir,
                config.sync_policy,
                config.merge_wal_interval,
            ))
        });
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            processor: Processor::new(Arc::clone(&core)),
            core,
            keeper,
            running: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            shutdown_tx,
            config,
        })
    }

    /// The core behind this controller, mostly for inspection in tests.
    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Starts the keeper and the collector, then serves the configured
    /// protocol until [`Controller::shutdown`] fires. In-flight command
    /// handlers are drained before the keeper persists and stops.
    pub async fn run(self: Arc<Self>) -> Result<(), ServeError> {
        if let Some(keeper) = &self.keeper {
            keeper.start()?;
        }
        self.start();

        let collector = tokio::spawn(run_collector(
            Arc::clone(&self.core),
            self.config.collect_interval,
            self.shutdown_tx.subscribe(),
        ));

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(addr = %addr, http = self.config.use_http, "radish ready to serve");

        let served = if self.config.use_http {
            server::http::serve(listener, Arc::clone(&self), self.shutdown_tx.subscribe()).await
        } else {
            server::resp::serve(listener, Arc::clone(&self), self.shutdown_tx.subscribe()).await
        };

        // Stop taking new work and let in-flight handlers finish before
        // the keeper persists.
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let _ = collector.await;

        if let Some(keeper) = &self.keeper {
            keeper.shutdown()?;
        }
        served?;

        info!("goodbye");
        Ok(())
    }

    /// Flags the controller as stopped; `run` unwinds from there.
    pub fn shutdown(&self) {
        info!("shutting down radish");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
    }

    pub(crate) fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Processes one command. Successful modifying commands are handed to
    /// the keeper; a reliable-path WAL failure turns the reply into an
    /// error, since the command cannot be acknowledged as durable.
    pub fn handle(&self, request: Request) -> Response {
        if !self.running.load(Ordering::SeqCst) {
            return Response::error(format!(
                "error processing {:?}: server is shutting down",
                request.cmd
            ));
        }

        let _guard = InFlightGuard::enter(&self.in_flight);

        let response = self.processor.process(&request);
        if response.status() != Status::Ok {
            // Failed commands changed nothing and stay out of the WAL.
            return response;
        }
        if !self.processor.is_modifying(&request) {
            return response;
        }

        if let Some(keeper) = &self.keeper {
            let cmd = request.cmd.clone();
            if let Err(e) = keeper.write_to_wal(request) {
                error!(cmd = %cmd, error = %e, "WAL append failed");
                return Response::error(format!("unable to persist {cmd:?}: {e}"));
            }
        }

        response
    }
}

struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Background expiry collection on a fixed tick.
async fn run_collector(
    core: Arc<Core>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let count = core.collect_expired();
                if count > 0 {
                    debug!(count, "collected expired items");
                }
            }
            _ = shutdown_rx.wait_for(|stop| *stop) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn request(cmd: &str, args: &[&str]) -> Request {
        Request::new(
            cmd,
            args.iter().map(|a| Bytes::copy_from_slice(a.as_bytes())).collect(),
        )
    }

    #[test]
    fn handle_rejects_when_not_running() {
        let controller = Controller::new(Config::default());
        let response = controller.handle(request("SET", &["k", "v"]));
        assert_eq!(response.status(), Status::Error);
    }

    #[test]
    fn handle_routes_to_the_core() {
        let controller = Controller::new(Config::default());
        controller.start();

        assert_eq!(controller.handle(request("SET", &["k", "v"])), Response::ok());
        assert_eq!(
            controller.handle(request("GET", &["k"])),
            Response::Str(Bytes::from("v"))
        );
        assert_eq!(
            controller.handle(request("NONSENSE", &[])).status(),
            Status::InvalidCommand
        );
        assert_eq!(controller.in_flight.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn successful_writes_reach_the_wal() {
        let dir = tempdir().unwrap();
        let config = Config {
            data_dir: Some(dir.path().to_path_buf()),
            sync_policy: SyncPolicy::Always,
            ..Config::default()
        };

        let controller = Controller::new(config.clone());
        controller.keeper.as_ref().unwrap().start().unwrap();
        controller.start();

        assert_eq!(controller.handle(request("SET", &["k", "v"])), Response::ok());
        // Reads and failures do not touch the log.
        controller.handle(request("GET", &["k"]));
        assert_eq!(
            controller.handle(request("HGET", &["k", "f"])).status(),
            Status::TypeMismatch
        );
        controller.keeper.as_ref().unwrap().shutdown().unwrap();

        // A fresh controller over the same data dir sees the write.
        let restarted = Controller::new(config);
        restarted.keeper.as_ref().unwrap().start().unwrap();
        assert_eq!(
            restarted.core().get("k").unwrap(),
            Bytes::from("v")
        );
        restarted.keeper.as_ref().unwrap().shutdown().unwrap();
    }

    #[tokio::test]
    async fn collector_task_stops_on_shutdown() {
        let core = Arc::new(Core::new(CoreConfig::default()));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run_collector(
            Arc::clone(&core),
            Duration::from_millis(5),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
