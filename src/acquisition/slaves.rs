//! Trigger propagation from a master to its direct slaves.
//!
//! Every master owns one [`Slaves`] handle. Inside its own `trigger`, a master
//! driver calls [`Slaves::trigger_slaves`] to fan out one task per
//! software-triggered slave, does its own work, then joins them with
//! [`Slaves::wait_slaves`]:
//!
//! ```rust,ignore
//! async fn trigger(&self, slaves: &Slaves) -> Result<()> {
//!     slaves.trigger_slaves().await?;
//!     sleep(self.count_time).await;
//!     slaves.wait_slaves().await?;
//!     Ok(())
//! }
//! ```
//!
//! `trigger_slaves` is also the overrun detector: calling it while tasks of the
//! previous round are still running kills those tasks (they end with
//! [`AcqError::AbortedTrigger`]) and fails with [`AcqError::TriggerOverrun`]
//! naming exactly the slaves that were late. A previous task that already
//! finished with an error, but was never joined, surfaces that error instead.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::traits::TriggerType;
use super::AcqObject;
use crate::error::{AcqError, AcqResult};

/// One in-flight slave trigger.
struct TriggerTask {
    slave: AcqObject,
    handle: JoinHandle<AcqResult<()>>,
    kill: Option<oneshot::Sender<AcqError>>,
}

/// Slaves of one master plus the bookkeeping of the current trigger round.
pub struct Slaves {
    master: String,
    members: RwLock<Vec<AcqObject>>,
    in_flight: Mutex<Vec<TriggerTask>>,
    top_level: AtomicBool,
}

impl Slaves {
    pub(crate) fn new(master: &str) -> Self {
        Self {
            master: master.to_string(),
            members: RwLock::new(Vec::new()),
            in_flight: Mutex::new(Vec::new()),
            top_level: AtomicBool::new(true),
        }
    }

    /// Replace the slave list from the chain tree.
    pub(crate) fn sync(&self, members: Vec<AcqObject>, top_level: bool) {
        *self.members.write() = members;
        self.top_level.store(top_level, Ordering::SeqCst);
    }

    /// Name of the owning master.
    pub fn master(&self) -> &str {
        &self.master
    }

    /// Direct slaves, in insertion order.
    pub fn list(&self) -> Vec<AcqObject> {
        self.members.read().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.members
            .read()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// True when the master sits directly below the chain root.
    pub fn is_top_level(&self) -> bool {
        self.top_level.load(Ordering::SeqCst)
    }

    /// Number of trigger tasks of the current round not yet joined.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Start a new trigger round.
    pub async fn trigger_slaves(&self) -> AcqResult<()> {
        let previous = std::mem::take(&mut *self.in_flight.lock());

        let mut late = Vec::new();
        let mut failure = None;
        for mut task in previous {
            if task.handle.is_finished() {
                // a round that was never joined may still hold a failure
                let result = match (&mut task.handle).await {
                    Ok(result) => result,
                    Err(join_err) => Err(join_err.into()),
                };
                match result {
                    Ok(()) if task.slave.trigger_ready() => continue,
                    Ok(()) => {}
                    Err(err) => {
                        debug!(master = %self.master, slave = task.slave.name(), error = %err, "unjoined trigger failed");
                        failure.get_or_insert(err);
                    }
                }
                late.push(task.slave.name().to_string());
            } else {
                late.push(task.slave.name().to_string());
                if let Some(kill) = task.kill.take() {
                    let _ = kill.send(AcqError::AbortedTrigger {
                        master: self.master.clone(),
                        slave: task.slave.name().to_string(),
                    });
                }
                // wait for the stale task to actually terminate
                match task.handle.await {
                    Ok(Err(err)) => debug!(master = %self.master, error = %err, "stale trigger killed"),
                    Ok(Ok(())) => debug!(master = %self.master, slave = task.slave.name(), "stale trigger finished while killed"),
                    Err(err) => debug!(master = %self.master, error = %err, "stale trigger task failed"),
                }
            }
        }

        if let Some(err) = failure {
            warn!(master = %self.master, slaves = ?late, "previous trigger round failed");
            return Err(err);
        }
        if !late.is_empty() {
            warn!(master = %self.master, slaves = ?late, "previous trigger round not done");
            return Err(AcqError::TriggerOverrun {
                master: self.master.clone(),
                slaves: late,
            });
        }

        let members = self.members.read().clone();
        let tasks: Vec<TriggerTask> = members
            .into_iter()
            .filter(|slave| slave.trigger_type() == TriggerType::Software)
            .map(spawn_trigger)
            .collect();
        debug!(master = %self.master, count = tasks.len(), "slaves triggered");
        *self.in_flight.lock() = tasks;
        Ok(())
    }

    /// Join every task of the current round. The first error, in slave order,
    /// is returned once all of them have finished.
    pub async fn wait_slaves(&self) -> AcqResult<()> {
        let tasks = std::mem::take(&mut *self.in_flight.lock());

        let mut first_error = None;
        for task in tasks {
            let result = match task.handle.await {
                Ok(result) => result,
                Err(join_err) => Err(join_err.into()),
            };
            if let Err(err) = result {
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    debug!(master = %self.master, slave = task.slave.name(), error = %err, "additional slave failure");
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Wait for the `prepare` of every slave still in flight. Only useful with
    /// parallel prepare, where a master is not ordered after its slaves. The
    /// first failure, in slave order, is returned once all of them are done.
    pub async fn wait_slaves_prepare(&self) -> AcqResult<()> {
        let members = self.list();
        let results =
            futures::future::join_all(members.iter().map(|s| s.wait_prepared())).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Wait until every slave reports ready for another trigger.
    pub async fn wait_slaves_ready(&self) -> AcqResult<()> {
        let members = self.list();
        let results = futures::future::join_all(members.iter().map(|s| s.wait_ready())).await;
        for result in results {
            result?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Slaves {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slaves")
            .field("master", &self.master)
            .field("members", &self.names())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

fn spawn_trigger(slave: AcqObject) -> TriggerTask {
    let (kill_tx, kill_rx) = oneshot::channel();
    let target = slave.clone();
    let handle = tokio::spawn(async move {
        tokio::select! {
            biased;
            err = killed(kill_rx) => Err(err),
            result = target.trigger() => result,
        }
    });
    TriggerTask {
        slave,
        handle,
        kill: Some(kill_tx),
    }
}

/// Resolves with the injected error; never resolves if the sender is dropped.
async fn killed(rx: oneshot::Receiver<AcqError>) -> AcqError {
    match rx.await {
        Ok(err) => err,
        Err(_) => std::future::pending().await,
    }
}
