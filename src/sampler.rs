use crate::utils::errors::SampleLoss;
use log::{debug, trace, warn};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Outcome of one poll iteration: a power reading or an explicit loss.
pub type PowerReading = Result<f64, SampleLoss>;

/// Join cap for pure polling loops.
pub const POLLING_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Background producer for one measurement window.
///
/// The worker task is the only writer; it pushes items into a channel that is
/// drained once, after the stop flag is set and the task has been joined.
pub struct BackgroundSampler<T: Send + 'static> {
    /// Cleared to ask the worker to stop
    is_running: Arc<AtomicBool>,
    /// Handle to the worker task
    task_handle: Option<JoinHandle<()>>,
    /// Items produced by the worker
    data_receiver: Option<mpsc::UnboundedReceiver<T>>,
}

impl<T: Send + 'static> BackgroundSampler<T> {
    /// Spawn `worker` on the tokio runtime with a fresh channel and stop flag.
    pub fn commence<F, Fut>(worker: F) -> Self
    where
        F: FnOnce(mpsc::UnboundedSender<T>, Arc<AtomicBool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let is_running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(worker(tx, Arc::clone(&is_running)));

        Self {
            is_running,
            task_handle: Some(handle),
            data_receiver: Some(rx),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Ask the worker to stop without waiting for it.
    pub fn signal_stop(&self) {
        self.is_running.store(false, Ordering::Relaxed);
    }

    /// Stop the worker, wait up to `join_timeout` for it, then drain everything
    /// it produced. A worker that misses the deadline is aborted.
    pub async fn shutdown(&mut self, join_timeout: Duration) -> Vec<T> {
        self.signal_stop();

        if let Some(mut handle) = self.task_handle.take() {
            match tokio::time::timeout(join_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Sampling worker ended abnormally: {}", e),
                Err(_) => {
                    warn!("Sampling worker did not stop within {:?}, aborting it", join_timeout);
                    handle.abort();
                }
            }
        }

        let mut drained = Vec::new();
        if let Some(mut rx) = self.data_receiver.take() {
            while let Ok(item) = rx.try_recv() {
                drained.push(item);
            }
        }
        drained
    }
}

impl<T: Send + 'static> Drop for BackgroundSampler<T> {
    fn drop(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Poll `poll` every `interval` until the stop flag clears. Each reading,
/// successful or lost, is forwarded in order. Actual cadence is the interval
/// plus the time `poll` takes.
pub async fn run_polling_loop<P, Fut>(
    mut poll: P,
    tx: mpsc::UnboundedSender<PowerReading>,
    is_running: Arc<AtomicBool>,
    interval: Duration,
) where
    P: FnMut() -> Fut,
    Fut: Future<Output = PowerReading>,
{
    let mut iteration = 0usize;

    while is_running.load(Ordering::Relaxed) {
        iteration += 1;
        let reading = poll().await;
        if let Err(ref loss) = reading {
            trace!("Poll iteration {} produced no reading: {}", iteration, loss);
        }
        if tx.send(reading).is_err() {
            debug!("Sample receiver dropped, stopping polling loop");
            break;
        }
        tokio::time::sleep(interval).await;
    }

    debug!("Polling loop stopped after {} iterations", iteration);
}

/// Readings of one window split into usable samples and a loss count.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SampleBatch {
    pub samples: Vec<f64>,
    pub lost: usize,
}

impl SampleBatch {
    pub fn from_readings(readings: Vec<PowerReading>) -> Self {
        let mut batch = SampleBatch::default();
        for reading in readings {
            match reading {
                Ok(value) => batch.samples.push(value),
                Err(_) => batch.lost += 1,
            }
        }
        batch
    }
}
