//! The Control API: a single HTTP endpoint hosting route CRUD and
//! a streaming log viewer, delegating everything to a
//! [`stevedore_core::Registry`] and the `PumpSupervisor` it wraps.
//!
//! `Server` construction takes a bind address; `run` spawns the
//! listener behind a graceful-shutdown future, `stop` triggers it.

mod handlers;
mod routes;
mod viewer;

pub use server::Server;

mod server {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use stevedore_core::Registry;
    use tokio::sync::oneshot;

    use crate::routes;

    /// Owns the bound address and the graceful-shutdown trigger for
    /// one Control API listener.
    pub struct Server {
        address: SocketAddr,
        registry: Arc<Registry>,
        trigger_cancel: oneshot::Sender<()>,
        cancel_signal: Option<oneshot::Receiver<()>>,
    }

    impl Server {
        pub fn new(address: SocketAddr, registry: Arc<Registry>) -> Server {
            let (trigger_cancel, cancel_signal) = oneshot::channel();
            Server {
                address,
                registry,
                trigger_cancel,
                cancel_signal: Some(cancel_signal),
            }
        }

        pub fn stop(self) {
            let _ = self.trigger_cancel.send(());
        }

        /// Binds and serves until `stop` is called or the returned
        /// future is dropped. Matches the Job Supervisor's
        /// setup-then-run contract: binding happens eagerly so a bad
        /// address is a setup-time error, the actual serve loop runs
        /// to completion (or forever) as the `run` phase.
        pub async fn run(mut self) -> std::io::Result<()> {
            let rx = self
                .cancel_signal
                .take()
                .expect("Server::run called more than once");
            let routes = routes::make_routes(self.registry.clone());
            let (_, server) =
                warp::serve(routes).bind_with_graceful_shutdown(self.address, async move {
                    let _ = rx.await;
                });
            server.await;
            Ok(())
        }
    }
}
