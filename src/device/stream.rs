//! In-order device streams.
//!
//! A [`DeviceStream`] owns a worker thread that runs enqueued jobs one after
//! another. Enqueueing never blocks. The first failing job makes the error
//! sticky: every later job is skipped, and [`DeviceStream::synchronize`]
//! reports the failure. Events are still signalled after a failure so that
//! nobody waits forever on a dead stream.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use tokio::sync::mpsc;

use crate::element::Element;
use crate::error::{DgcError, Result};
use crate::memory::{DeviceArena, PinnedHostBuffer};

use super::Device;

type Job = Box<dyn FnOnce(&StreamContext) -> Result<()> + Send>;

enum Command {
    Run { label: &'static str, job: Job },
    Record(Event),
}

/// What a job sees while it runs on the stream worker.
///
/// Collective operations are futures; a job drives them to completion on
/// the worker's own runtime with [`StreamContext::block_on`].
pub struct StreamContext {
    runtime: tokio::runtime::Runtime,
}

impl StreamContext {
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }
}

#[derive(Default)]
struct Status {
    /// The failure as it happened; handed out once by `synchronize`.
    first_error: Option<DgcError>,
    /// Label and message of that failure, kept for later reports.
    failed: Option<(&'static str, String)>,
}

/// A single in-order work queue bound to a [`Device`].
pub struct DeviceStream {
    device: Arc<Device>,
    tx: Option<mpsc::UnboundedSender<Command>>,
    status: Arc<Mutex<Status>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceStream {
    /// Start a stream and its worker thread.
    pub fn new(device: Arc<Device>) -> Result<Arc<Self>> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| DgcError::device_with_source("stream runtime", e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let status = Arc::new(Mutex::new(Status::default()));
        let worker_status = Arc::clone(&status);
        let ctx = StreamContext { runtime };

        let worker = std::thread::Builder::new()
            .name("dgc-stream".into())
            .spawn(move || run_worker(ctx, rx, worker_status))
            .map_err(|e| DgcError::device_with_source("spawn stream worker", e))?;

        Ok(Arc::new(Self {
            device,
            tx: Some(tx),
            status,
            worker: Mutex::new(Some(worker)),
        }))
    }

    /// The device this stream allocates on.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Queue `job` behind everything already enqueued.
    pub fn enqueue<F>(&self, label: &'static str, job: F) -> Result<()>
    where
        F: FnOnce(&StreamContext) -> Result<()> + Send + 'static,
    {
        self.send(Command::Run {
            label,
            job: Box::new(job),
        })
    }

    /// Record an event that completes once all prior work has run.
    pub fn record_event(&self) -> Result<Event> {
        let event = Event::new();
        self.send(Command::Record(event.clone()))?;
        Ok(event)
    }

    /// Block until all enqueued work has run, then report the sticky error.
    ///
    /// The failing job's own error is returned the first time; later calls
    /// report it as [`DgcError::StreamFailed`].
    pub fn synchronize(&self) -> Result<()> {
        self.record_event()?.wait();
        let mut status = self.status.lock().map_err(|_| DgcError::LockPoisoned("stream status"))?;
        if let Some(err) = status.first_error.take() {
            return Err(err);
        }
        match &status.failed {
            Some((label, reason)) => Err(DgcError::StreamFailed {
                label: *label,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// True once a job on this stream has failed.
    pub fn has_failed(&self) -> bool {
        self.status
            .lock()
            .map(|s| s.failed.is_some())
            .unwrap_or(true)
    }

    /// Fail with [`DgcError::StreamFailed`] once a job on this stream has
    /// failed, without consuming the error `synchronize` reports.
    pub fn check_failed(&self) -> Result<()> {
        let status = self.status.lock().map_err(|_| DgcError::LockPoisoned("stream status"))?;
        match &status.failed {
            Some((label, reason)) => Err(DgcError::StreamFailed {
                label: *label,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Asynchronous host-to-device copy into `dst` at element `offset`.
    ///
    /// The host buffer is read when the stream reaches the copy, so it must
    /// stay untouched until then.
    pub fn copy_to_device<T: Element>(
        &self,
        src: PinnedHostBuffer<T>,
        dst: Arc<DeviceArena>,
        offset: usize,
    ) -> Result<()> {
        self.enqueue("copy_h2d", move |_| {
            let data = src.lock()?;
            dst.write(offset, &data)
        })
    }

    /// Asynchronous device-to-host copy of `len` elements from `offset`.
    pub fn copy_to_host<T: Element>(
        &self,
        src: Arc<DeviceArena>,
        offset: usize,
        len: usize,
        dst: PinnedHostBuffer<T>,
    ) -> Result<()> {
        self.enqueue("copy_d2h", move |_| {
            let data = src.read::<T>(offset, len)?;
            dst.fill_from(&data)
        })
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .as_ref()
            .ok_or_else(|| DgcError::device("stream is shut down"))?
            .send(cmd)
            .map_err(|_| DgcError::device("stream worker exited"))
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.tx.take();
        let handle = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("stream worker panicked during shutdown");
            }
        }
    }
}

impl std::fmt::Debug for DeviceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStream")
            .field("failed", &self.has_failed())
            .finish_non_exhaustive()
    }
}

fn run_worker(
    ctx: StreamContext,
    mut rx: mpsc::UnboundedReceiver<Command>,
    status: Arc<Mutex<Status>>,
) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            Command::Record(event) => event.complete(),
            Command::Run { label, job } => {
                let skip = status
                    .lock()
                    .map(|s| s.failed.is_some())
                    .unwrap_or(true);
                if skip {
                    tracing::trace!(label, "skipping job on failed stream");
                    continue;
                }
                let outcome = match catch_unwind(AssertUnwindSafe(|| job(&ctx))) {
                    Ok(result) => result,
                    Err(_) => Err(DgcError::StreamFailed {
                        label,
                        reason: "job panicked".into(),
                    }),
                };
                if let Err(err) = outcome {
                    tracing::debug!(label, error = %err, "stream job failed");
                    let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
                    s.failed = Some((label, err.to_string()));
                    s.first_error = Some(err);
                }
            }
        }
    }
}

/// Completion marker recorded on a stream.
#[derive(Clone)]
pub struct Event {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Event {
    fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// An event that is already complete.
    pub fn completed() -> Self {
        let event = Self::new();
        event.complete();
        event
    }

    fn complete(&self) {
        let (done, cv) = &*self.inner;
        *done.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cv.notify_all();
    }

    /// Non-blocking completion check.
    pub fn query(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the stream reaches this event.
    pub fn wait(&self) {
        let (done, cv) = &*self.inner;
        let mut guard = done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*guard {
            guard = cv.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("complete", &self.query())
            .finish()
    }
}
