use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::config::RetryConfig;
use crate::crypto::block_id::BlockId;
use crate::error::{CairnError, Result};
use crate::storage::StorageBackend;

/// Catalog-side hook run on the orchestrating thread immediately before an
/// upload is released to the worker. Lets the catalog mark the volume's
/// state transition atomically with respect to the upload attempt.
pub type FlushHook = Box<dyn FnOnce(&Catalog) -> Result<()> + Send>;

/// A remote operation staged by `put`/`delete`, not yet released to the
/// worker thread.
enum PendingOp {
    Put {
        volume_id: i64,
        name: String,
        payload: Vec<u8>,
        hook: Option<FlushHook>,
    },
    Delete {
        volume_id: i64,
        name: String,
        expected_size: Option<u64>,
    },
}

enum WorkerMsg {
    Put {
        volume_id: i64,
        name: String,
        payload: Vec<u8>,
    },
    Delete {
        volume_id: i64,
        name: String,
        expected_size: Option<u64>,
    },
    Shutdown,
}

enum Completion {
    Uploaded {
        volume_id: i64,
        name: String,
        size: u64,
        hash: String,
    },
    Deleted {
        volume_id: i64,
        name: String,
    },
    Failed {
        name: String,
        error: CairnError,
    },
}

/// Ordered asynchronous queue of remote operations.
///
/// `put` and `delete` stage operations locally; `flush_pending` runs each
/// put's flush hook against the catalog and releases the operations to a
/// single FIFO worker thread, so a delete enqueued after a put is never
/// issued before that put has completed. Completions are drained back into
/// the catalog on the orchestrating thread; the worker never touches it.
pub struct RemoteQueue {
    backend: Arc<dyn StorageBackend>,
    work_tx: Sender<WorkerMsg>,
    completion_rx: Receiver<Completion>,
    worker: Option<JoinHandle<()>>,
    pending: VecDeque<PendingOp>,
    in_flight: usize,
    cancel: Arc<AtomicBool>,
    first_error: Option<CairnError>,
}

impl RemoteQueue {
    pub fn new(backend: Arc<dyn StorageBackend>, retry: RetryConfig) -> Self {
        let (work_tx, work_rx) = crossbeam_channel::unbounded::<WorkerMsg>();
        let (completion_tx, completion_rx) = crossbeam_channel::unbounded::<Completion>();
        let cancel = Arc::new(AtomicBool::new(false));

        let worker_backend = Arc::clone(&backend);
        let worker_cancel = Arc::clone(&cancel);
        let worker = std::thread::spawn(move || {
            worker_loop(worker_backend, retry, worker_cancel, work_rx, completion_tx)
        });

        Self {
            backend,
            work_tx,
            completion_rx,
            worker: Some(worker),
            pending: VecDeque::new(),
            in_flight: 0,
            cancel,
            first_error: None,
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Stage an upload. The payload's size and hash are recorded in the
    /// catalog when the upload completes.
    pub fn put(
        &mut self,
        volume_id: i64,
        name: &str,
        payload: Vec<u8>,
        hook: Option<FlushHook>,
    ) -> Result<()> {
        self.check_not_cancelled()?;
        self.pending.push_back(PendingOp::Put {
            volume_id,
            name: name.to_string(),
            payload,
            hook,
        });
        Ok(())
    }

    /// Stage a delete. When `expected_size` is given the worker warns on a
    /// size mismatch before deleting.
    pub fn delete(&mut self, volume_id: i64, name: &str, expected_size: Option<u64>) -> Result<()> {
        self.check_not_cancelled()?;
        self.pending.push_back(PendingOp::Delete {
            volume_id,
            name: name.to_string(),
            expected_size,
        });
        Ok(())
    }

    /// Download a blob. Reads bypass the write queue: they carry no ordering
    /// obligations against puts and deletes staged by the same engine pass.
    pub fn get(&self, name: &str) -> Result<Vec<u8>> {
        self.check_not_cancelled()?;
        self.backend
            .get(name)?
            .ok_or_else(|| CairnError::MissingRemoteFile(name.to_string()))
    }

    /// List every blob name on the backend.
    pub fn list(&self) -> Result<Vec<String>> {
        self.check_not_cancelled()?;
        self.backend.list("")
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || self.in_flight > 0
    }

    /// Release all staged operations to the worker, running each put's flush
    /// hook first. Also drains any completions that have already arrived.
    pub fn flush_pending(&mut self, catalog: &Catalog) -> Result<()> {
        self.check_not_cancelled()?;
        while let Some(op) = self.pending.pop_front() {
            let msg = match op {
                PendingOp::Put {
                    volume_id,
                    name,
                    payload,
                    hook,
                } => {
                    if let Some(hook) = hook {
                        hook(catalog)?;
                    }
                    WorkerMsg::Put {
                        volume_id,
                        name,
                        payload,
                    }
                }
                PendingOp::Delete {
                    volume_id,
                    name,
                    expected_size,
                } => WorkerMsg::Delete {
                    volume_id,
                    name,
                    expected_size,
                },
            };
            self.work_tx
                .send(msg)
                .map_err(|_| CairnError::Other("remote queue worker is gone".into()))?;
            self.in_flight += 1;
        }
        self.drain_completions(catalog)
    }

    /// Block until every released operation has completed, applying state
    /// transitions to the catalog. Propagates the first worker error.
    pub fn wait_for_empty(&mut self, catalog: &Catalog) -> Result<()> {
        self.flush_pending(catalog)?;
        while self.in_flight > 0 {
            let completion = self
                .completion_rx
                .recv()
                .map_err(|_| CairnError::Other("remote queue worker is gone".into()))?;
            self.apply_completion(catalog, completion)?;
        }
        match self.first_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Apply completions that have already arrived, without blocking.
    fn drain_completions(&mut self, catalog: &Catalog) -> Result<()> {
        while let Ok(completion) = self.completion_rx.try_recv() {
            self.apply_completion(catalog, completion)?;
        }
        Ok(())
    }

    fn apply_completion(&mut self, catalog: &Catalog, completion: Completion) -> Result<()> {
        self.in_flight -= 1;
        match completion {
            Completion::Uploaded {
                volume_id,
                name,
                size,
                hash,
            } => {
                debug!(%name, size, "upload complete");
                catalog.update_remote_volume(
                    volume_id,
                    crate::catalog::VolumeState::Uploaded,
                    Some(size),
                    Some(&hash),
                )?;
            }
            Completion::Deleted { volume_id, name } => {
                debug!(%name, "delete complete");
                catalog.update_remote_volume(
                    volume_id,
                    crate::catalog::VolumeState::Deleted,
                    None,
                    None,
                )?;
            }
            Completion::Failed { name, error } => {
                warn!(%name, %error, "remote operation failed");
                if self.first_error.is_none() {
                    self.first_error = Some(error);
                }
            }
        }
        Ok(())
    }

    /// Refuse new submissions; in-flight operations drain to completion.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn check_not_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(CairnError::Cancelled);
        }
        Ok(())
    }
}

impl Drop for RemoteQueue {
    fn drop(&mut self) {
        let _ = self.work_tx.send(WorkerMsg::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    backend: Arc<dyn StorageBackend>,
    retry: RetryConfig,
    cancel: Arc<AtomicBool>,
    work_rx: Receiver<WorkerMsg>,
    completion_tx: Sender<Completion>,
) {
    // once an operation fails terminally, everything behind it in the queue
    // is failed without being issued: a delete must never run when the put
    // ahead of it did not complete
    let mut aborted = false;
    for msg in work_rx.iter() {
        let completion = match msg {
            WorkerMsg::Shutdown => break,
            _ if aborted => {
                let name = match msg {
                    WorkerMsg::Put { name, .. } | WorkerMsg::Delete { name, .. } => name,
                    WorkerMsg::Shutdown => unreachable!(),
                };
                Completion::Failed {
                    name,
                    error: CairnError::Other("skipped after earlier queue failure".into()),
                }
            }
            WorkerMsg::Put {
                volume_id,
                name,
                payload,
            } => {
                let size = payload.len() as u64;
                let hash = BlockId::compute(&payload).to_base64();
                match with_retry(&retry, &cancel, "put", &name, || {
                    backend.put(&name, &payload)
                }) {
                    Ok(()) => Completion::Uploaded {
                        volume_id,
                        name,
                        size,
                        hash,
                    },
                    Err(error) => Completion::Failed { name, error },
                }
            }
            WorkerMsg::Delete {
                volume_id,
                name,
                expected_size,
            } => {
                if let Some(expected) = expected_size {
                    match backend.size(&name) {
                        Ok(Some(actual)) if actual != expected => {
                            warn!(
                                %name,
                                expected, actual, "size mismatch on delete; removing anyway"
                            );
                        }
                        _ => {}
                    }
                }
                match with_retry(&retry, &cancel, "delete", &name, || backend.delete(&name)) {
                    Ok(()) => Completion::Deleted { volume_id, name },
                    Err(error) => Completion::Failed { name, error },
                }
            }
        };
        if matches!(completion, Completion::Failed { .. }) {
            aborted = true;
        }
        if completion_tx.send(completion).is_err() {
            break;
        }
    }
}

/// Retry a backend operation on transient errors with capped exponential
/// backoff. Exceeding the cap surfaces the last error to the caller.
fn with_retry<T>(
    retry: &RetryConfig,
    cancel: &AtomicBool,
    op_name: &str,
    blob_name: &str,
    f: impl Fn() -> Result<T>,
) -> Result<T> {
    let mut delay_ms = retry.retry_delay_ms;
    for attempt in 0..=retry.max_retries {
        if attempt > 0 {
            std::thread::sleep(Duration::from_millis(delay_ms));
            delay_ms = (delay_ms * 2).min(retry.retry_max_delay_ms);
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt < retry.max_retries => {
                if cancel.load(Ordering::SeqCst) {
                    return Err(CairnError::Cancelled);
                }
                warn!(
                    "{op_name} '{blob_name}': transient error (attempt {}/{}), retrying: {e}",
                    attempt + 1,
                    retry.max_retries,
                );
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("retry loop always returns")
}
