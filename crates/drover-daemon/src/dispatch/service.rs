use std::net::SocketAddr;
use std::time::Duration;

use drover_core::PoolConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{ConnectionEvent, Dispatch, Dispatcher, Route};
use crate::error::PoolError;
use crate::pool::WorkerId;

/// Hand-offs attempted before a connection is dropped.
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug)]
enum ProxyOutcome {
    Finished(WorkerId),
    Unreachable(WorkerId, ConnectionEvent<TcpStream>),
}

/// Accepts public connections and proxies each one to a Ready worker.
pub struct DispatchService {
    listener: TcpListener,
    dispatcher: Dispatcher<TcpStream>,
    proxies: TaskTracker,
    grace: Duration,
}

impl DispatchService {
    /// Bind the public listener. Failure here is fatal at startup.
    pub async fn bind(addr: SocketAddr, config: &PoolConfig) -> Result<Self, PoolError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| PoolError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            listener,
            dispatcher: Dispatcher::new(config.dispatch_queue_depth, config.max_inflight_per_worker),
            proxies: TaskTracker::new(),
            grace: config.graceful_shutdown_timeout(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` fires or the route publisher goes away.
    pub async fn run(mut self, mut routes: watch::Receiver<Vec<Route>>, shutdown: CancellationToken) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let initial = routes.borrow_and_update().clone();
        let ready = self.dispatcher.update_routes(&initial);
        self.assign(ready, &done_tx);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection accepted");
                        self.offer(ConnectionEvent::new(stream), &done_tx);
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                changed = routes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = routes.borrow_and_update().clone();
                    debug!(ready = current.len(), "routes updated");
                    let ready = self.dispatcher.update_routes(&current);
                    self.assign(ready, &done_tx);
                }
                Some(outcome) = done_rx.recv() => self.on_proxy_done(outcome, &done_tx),
            }
        }

        let dropped = self.dispatcher.drain_queue().len();
        if dropped > 0 {
            info!(dropped, "closing queued connections");
        }
        self.proxies.close();
        if tokio::time::timeout(self.grace, self.proxies.wait()).await.is_err() {
            warn!(open = self.proxies.len(), "proxied connections still open at shutdown");
        }
    }

    fn offer(&mut self, event: ConnectionEvent<TcpStream>, done: &mpsc::UnboundedSender<ProxyOutcome>) {
        match self.dispatcher.dispatch(event) {
            Ok(Dispatch::Assigned(route, event)) => self.spawn_proxy(route, event, done.clone()),
            Ok(Dispatch::Queued { depth }) => debug!(depth, "no worker available, connection queued"),
            Err(rejected) => {
                warn!(error = %rejected.error, "rejecting connection");
                #[cfg(feature = "metrics")]
                drover_core::metrics::counters().rejection();
            }
        }
    }

    fn assign(
        &self,
        ready: Vec<(Route, ConnectionEvent<TcpStream>)>,
        done: &mpsc::UnboundedSender<ProxyOutcome>,
    ) {
        for (route, event) in ready {
            self.spawn_proxy(route, event, done.clone());
        }
    }

    fn on_proxy_done(&mut self, outcome: ProxyOutcome, done: &mpsc::UnboundedSender<ProxyOutcome>) {
        match outcome {
            ProxyOutcome::Finished(id) => {
                let ready = self.dispatcher.complete(id);
                self.assign(ready, done);
            }
            ProxyOutcome::Unreachable(id, mut event) => {
                let ready = self.dispatcher.complete(id);
                self.assign(ready, done);
                event.attempts += 1;
                if event.attempts >= MAX_ATTEMPTS {
                    warn!(attempts = event.attempts, "giving up on connection");
                } else {
                    self.offer(event, done);
                }
            }
        }
    }

    fn spawn_proxy(
        &self,
        route: Route,
        event: ConnectionEvent<TcpStream>,
        done: mpsc::UnboundedSender<ProxyOutcome>,
    ) {
        self.proxies.spawn(async move {
            let waited_ms = u64::try_from(event.arrived_at.elapsed().as_millis()).unwrap_or(u64::MAX);
            let mut upstream = match TcpStream::connect(&route.endpoint).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(worker = %route.id, endpoint = %route.endpoint, error = %e, "worker unreachable");
                    let _ = done.send(ProxyOutcome::Unreachable(route.id, event));
                    return;
                }
            };
            let mut client = event.payload;
            match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                Ok((up, down)) => {
                    debug!(worker = %route.id, bytes_up = up, bytes_down = down, waited_ms, "connection closed");
                }
                Err(e) => debug!(worker = %route.id, error = %e, "proxied connection ended with error"),
            }
            let _ = done.send(ProxyOutcome::Finished(route.id));
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;

    /// Line echo server standing in for a worker.
    async fn echo_worker(tag: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let reply = format!("{tag}:{line}\n");
                        if write.write_all(reply.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn roundtrip(addr: SocketAddr, line: &str) -> String {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        write.write_all(format!("{line}\n").as_bytes()).await.unwrap();
        let mut reply = String::new();
        BufReader::new(read).read_line(&mut reply).await.unwrap();
        reply.trim_end().to_string()
    }

    fn config() -> PoolConfig {
        PoolConfig {
            dispatch_queue_depth: 4,
            graceful_shutdown_timeout_ms: 100,
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn proxies_round_robin_to_workers() {
        let a = echo_worker("a").await;
        let b = echo_worker("b").await;
        let routes = vec![
            Route {
                id: WorkerId::new(1),
                endpoint: a.to_string(),
            },
            Route {
                id: WorkerId::new(2),
                endpoint: b.to_string(),
            },
        ];
        let (_routes_tx, routes_rx) = watch::channel(routes);
        let service = DispatchService::bind("127.0.0.1:0".parse().unwrap(), &config())
            .await
            .unwrap();
        let addr = service.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(service.run(routes_rx, shutdown.clone()));

        assert_eq!(roundtrip(addr, "x").await, "a:x");
        assert_eq!(roundtrip(addr, "y").await, "b:y");
        assert_eq!(roundtrip(addr, "z").await, "a:z");

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn queued_connection_is_served_once_a_worker_is_ready() {
        let (routes_tx, routes_rx) = watch::channel(Vec::new());
        let service = DispatchService::bind("127.0.0.1:0".parse().unwrap(), &config())
            .await
            .unwrap();
        let addr = service.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(service.run(routes_rx, shutdown.clone()));

        let pending = tokio::spawn(roundtrip(addr, "late"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let worker = echo_worker("w").await;
        routes_tx
            .send(vec![Route {
                id: WorkerId::new(1),
                endpoint: worker.to_string(),
            }])
            .unwrap();
        assert_eq!(pending.await.unwrap(), "w:late");

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let err = DispatchService::bind(addr, &config()).await.err();
        assert!(matches!(err, Some(PoolError::Bind { .. })));
    }
}
