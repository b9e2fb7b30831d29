use crate::cleaner::BackplaneCleaner;
use crate::dispatcher::{BackplaneHub, DispatcherState};
use crate::error::BackplaneResult;
use crate::heartbeat::Heartbeat;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Background tasks of one process: heartbeat, dispatcher and cleaner,
/// sharing one shutdown signal.
///
/// Dropping the runtime signals shutdown without waiting for the tasks.
pub struct BackplaneRuntime {
    shutdown: watch::Sender<bool>,
    dispatcher_state: watch::Receiver<DispatcherState>,
    tasks: Vec<JoinHandle<()>>,
}

impl BackplaneRuntime {
    /// Register this process as a subscriber, then spawn the background
    /// tasks on the current tokio runtime.
    ///
    /// The cleaner's first cycle runs immediately, so it must already count
    /// this process as active or it would reclaim messages not yet delivered.
    ///
    /// # Errors
    ///
    /// Returns the store error when the registration fails; no task is
    /// started in that case.
    pub async fn spawn(hub: &BackplaneHub) -> BackplaneResult<Self> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let store = hub.store().clone();

        let heartbeat = Heartbeat::new(store.clone());
        heartbeat.register().await?;

        let cleaner = BackplaneCleaner::new(store);
        let dispatcher = hub.dispatcher();
        let dispatcher_state = dispatcher.state();

        let tasks = vec![
            tokio::spawn(heartbeat.run(shutdown_rx.clone())),
            tokio::spawn({
                let shutdown_rx = shutdown_rx.clone();
                async move { dispatcher.run(shutdown_rx).await }
            }),
            tokio::spawn(cleaner.start(shutdown_rx)),
        ];

        info!("Backplane runtime started");

        Ok(Self {
            shutdown,
            dispatcher_state,
            tasks,
        })
    }

    pub fn dispatcher_state(&self) -> watch::Receiver<DispatcherState> {
        self.dispatcher_state.clone()
    }

    /// Signal shutdown and wait for every task to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.send_replace(true);

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "Backplane task terminated abnormally");
            }
        }

        info!("Backplane runtime stopped");
    }
}

impl Drop for BackplaneRuntime {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
