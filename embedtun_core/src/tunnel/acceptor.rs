//! Control-connection acceptor.
//!
//! Runs on the manager's runtime and hands every accepted control connection
//! to the device on its own task. The loop owns the listener; stopping the
//! loop drops it, which closes the socket and unlinks its file. The loop
//! reports that drop separately from its own exit so the owner can close the
//! device only once no new connection can arrive.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use embedtun_ipc::{ControlConnection, ControlListener, IpcResult};

use crate::tunnel::platform::TunnelDevice;
use crate::tunnel::types::{AcceptorState, SharedAcceptorState};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Where the acceptor takes its connections from.
#[async_trait]
pub trait ConnectionSource: Send + Sync + 'static {
    async fn accept(&self) -> IpcResult<ControlConnection>;

    /// Interface the connections are for
    fn interface(&self) -> &str;
}

#[async_trait]
impl ConnectionSource for ControlListener {
    async fn accept(&self) -> IpcResult<ControlConnection> {
        ControlListener::accept(self).await
    }

    fn interface(&self) -> &str {
        ControlListener::interface(self)
    }
}

/// Owner's side of a running acceptor loop.
pub struct AcceptorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    released: Option<oneshot::Receiver<()>>,
    task: Option<JoinHandle<()>>,
    state: SharedAcceptorState,
}

pub struct Acceptor;

impl Acceptor {
    /// Spawn the accept loop for `source` on the current runtime.
    pub fn spawn<S: ConnectionSource>(source: S, device: Arc<dyn TunnelDevice>) -> AcceptorHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (released_tx, released_rx) = oneshot::channel();
        let state = SharedAcceptorState::new();
        let task = tokio::spawn(run(source, device, shutdown_rx, released_tx, state.clone()));

        AcceptorHandle {
            shutdown: Some(shutdown_tx),
            released: Some(released_rx),
            task: Some(task),
            state,
        }
    }
}

async fn run<S: ConnectionSource>(
    source: S,
    device: Arc<dyn TunnelDevice>,
    mut shutdown_rx: oneshot::Receiver<()>,
    released_tx: oneshot::Sender<()>,
    state: SharedAcceptorState,
) {
    let interface = source.interface().to_string();
    info!(interface = %interface, "Accepting control connections");

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_rx => {
                debug!(interface = %interface, "Acceptor received shutdown signal");
                break;
            }

            accept_result = source.accept() => {
                match accept_result {
                    Ok(connection) => {
                        let device = Arc::clone(&device);
                        let interface = interface.clone();
                        tokio::spawn(async move {
                            if let Err(e) = device.handle_control(connection).await {
                                warn!(interface = %interface, error = %e, "Control connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        error!(interface = %interface, error = %e, "Failed to accept control connection");
                        tokio::select! {
                            biased;
                            _ = &mut shutdown_rx => {
                                debug!(interface = %interface, "Acceptor received shutdown signal");
                                break;
                            }
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        }
                    }
                }
            }
        }
    }

    drop(source);
    // The owner may have given up waiting
    let _ = released_tx.send(());
    state.set(AcceptorState::Stopped);
    info!(interface = %interface, "Acceptor stopped");
}

impl AcceptorHandle {
    pub fn state(&self) -> AcceptorState {
        self.state.get()
    }

    /// Signal the loop to close its listener and exit. Does not wait.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            if self.state.get() == AcceptorState::Running {
                self.state.set(AcceptorState::Stopping);
            }
            // The loop may already have exited
            let _ = shutdown.send(());
        }
    }

    /// Stop the loop and wait up to `timeout` for it to drop its listener.
    /// Connections already handed to the device keep running.
    ///
    /// Returns `true` once the listener is gone.
    pub async fn release(&mut self, timeout: Duration) -> bool {
        self.stop();
        let Some(released) = self.released.take() else {
            return true;
        };

        match tokio::time::timeout(timeout, released).await {
            // A dropped sender means the task ended and took the listener with it
            Ok(_) => true,
            Err(_) => false,
        }
    }

    /// Stop the loop and wait up to `timeout` for it to exit.
    ///
    /// Returns `true` if the loop is known to have stopped.
    pub async fn join(mut self, timeout: Duration) -> bool {
        self.stop();
        let Some(task) = self.task.take() else {
            return self.state.get() == AcceptorState::Stopped;
        };

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(error = %e, "Acceptor task failed");
                false
            }
            Err(_) => false,
        }
    }
}

impl Drop for AcceptorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::device::UserspaceDevice;
    use crate::tunnel::platform::VirtualInterface;
    use embedtun_ipc::{ControlClient, IpcError};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Fails the first `failures` accepts, then serves from a real listener
    struct FlakySource {
        listener: ControlListener,
        failures: AtomicUsize,
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConnectionSource for FlakySource {
        async fn accept(&self) -> IpcResult<ControlConnection> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(IpcError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "too many open files",
                )));
            }
            self.listener.accept().await
        }

        fn interface(&self) -> &str {
            self.listener.interface()
        }
    }

    #[derive(Debug)]
    struct NamedInterface(String);

    impl VirtualInterface for NamedInterface {
        fn name(&self) -> &str {
            &self.0
        }
    }

    fn device(name: &str) -> Arc<dyn TunnelDevice> {
        Arc::new(UserspaceDevice::new(Box::new(NamedInterface(name.to_string()))))
    }

    #[tokio::test]
    async fn serves_clients_until_stopped() {
        let dir = tempdir().unwrap();
        let listener = ControlListener::bind(dir.path(), "wg3").await.unwrap();
        let path = listener.path().to_path_buf();
        let acceptor = Acceptor::spawn(listener, device("wg3"));
        assert_eq!(acceptor.state(), AcceptorState::Running);

        // Two clients at once; the first one staying connected blocks nobody
        let mut first = ControlClient::connect(&path).await.unwrap();
        let mut second = ControlClient::connect(&path).await.unwrap();
        assert!(second.get().await.unwrap().is_ok());
        assert!(first.get().await.unwrap().is_ok());

        assert!(acceptor.join(Duration::from_secs(2)).await);
        assert!(!path.exists());
        assert!(ControlClient::connect(&path).await.is_err());
    }

    #[tokio::test]
    async fn stop_does_not_wait() {
        let dir = tempdir().unwrap();
        let listener = ControlListener::bind(dir.path(), "wg4").await.unwrap();
        let mut acceptor = Acceptor::spawn(listener, device("wg4"));

        acceptor.stop();
        assert_ne!(acceptor.state(), AcceptorState::Running);
        // A second stop is harmless
        acceptor.stop();

        assert!(acceptor.join(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn accept_errors_do_not_stop_the_loop() {
        let dir = tempdir().unwrap();
        let listener = ControlListener::bind(dir.path(), "wg6").await.unwrap();
        let path = listener.path().to_path_buf();
        let attempts = Arc::new(AtomicUsize::new(0));
        let source = FlakySource {
            listener,
            failures: AtomicUsize::new(3),
            attempts: Arc::clone(&attempts),
        };
        let acceptor = Acceptor::spawn(source, device("wg6"));

        let mut client = ControlClient::connect(&path).await.unwrap();
        assert!(client.get().await.unwrap().is_ok());
        assert_eq!(acceptor.state(), AcceptorState::Running);
        assert!(attempts.load(Ordering::SeqCst) >= 4);

        assert!(acceptor.join(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn release_returns_once_the_listener_is_gone() {
        let dir = tempdir().unwrap();
        let listener = ControlListener::bind(dir.path(), "wg7").await.unwrap();
        let path = listener.path().to_path_buf();
        let mut acceptor = Acceptor::spawn(listener, device("wg7"));

        assert!(acceptor.release(Duration::from_secs(2)).await);
        assert!(!path.exists());
        assert!(ControlClient::connect(&path).await.is_err());

        // Already released
        assert!(acceptor.release(Duration::from_millis(10)).await);
        assert!(acceptor.join(Duration::from_secs(2)).await);
    }
}
