//! Scan driver.
//!
//! A [`Scan`] runs every top-level master of a chain concurrently, one
//! [`ChainIterator`] each:
//!
//! 1. `next()` then `prepare()` on every iterator (the prepare hook runs once,
//!    with the first iterator)
//! 2. one task per iterator: `start()`, then `next → prepare → start` until
//!    the iterator is exhausted
//! 3. the run ends when a stopper's task finishes, when every task finished or
//!    on the first error; remaining tasks are aborted
//! 4. `stop()` on every iterator, whatever happened before
//!
//! Progress is observable through a `tokio::sync::watch` channel of
//! [`ScanState`].

use futures::future::{join_all, BoxFuture};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::acquisition::Advance;
use crate::chain::{Chain, ChainIterator};
use crate::error::{AcqError, AcqResult};

/// Lifecycle of a [`Scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Preparing,
    Starting,
    Stopping,
    Done,
    Failed,
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ScanState::Idle => "idle",
            ScanState::Preparing => "preparing",
            ScanState::Starting => "starting",
            ScanState::Stopping => "stopping",
            ScanState::Done => "done",
            ScanState::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

type SharedIterator = Arc<Mutex<ChainIterator>>;

pub struct Scan {
    run_id: Uuid,
    chain: Chain,
    prepare_hook: Option<BoxFuture<'static, anyhow::Result<()>>>,
    state: watch::Sender<ScanState>,
}

impl Scan {
    pub fn new(chain: Chain) -> Self {
        let (state, _) = watch::channel(ScanState::Idle);
        Self {
            run_id: Uuid::new_v4(),
            chain,
            prepare_hook: None,
            state,
        }
    }

    /// Work run concurrently with the chain presets at the first prepare
    /// (writer setup, metadata collection).
    pub fn with_prepare_hook<F>(mut self, hook: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.prepare_hook = Some(Box::pin(hook));
        self
    }

    /// Unique identifier of this scan, attached to its log span.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn state(&self) -> ScanState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ScanState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ScanState) {
        info!(%state, "scan state");
        self.state.send_replace(state);
    }

    /// Run the scan to completion.
    #[instrument(skip(self), fields(run_id = %self.run_id), err)]
    pub async fn run(&mut self) -> AcqResult<()> {
        let stoppers: Vec<bool> = self
            .chain
            .top_masters()
            .iter()
            .map(|master| self.chain.is_stopper(master))
            .collect();
        let iterators: Vec<SharedIterator> = self
            .chain
            .iter_list()
            .into_iter()
            .map(|it| Arc::new(Mutex::new(it)))
            .collect();
        info!(iterators = iterators.len(), "scan started");

        let result = self.drive(&iterators, &stoppers).await;
        if let Err(err) = &result {
            error!(error = %err, "scan aborted");
        }

        self.set_state(ScanState::Stopping);
        let stopped = join_all(iterators.iter().map(|it| async move { it.lock().await.stop().await })).await;
        let mut first_stop_error = None;
        for result in stopped {
            if let Err(err) = result {
                warn!(error = %err, "stop failed");
                first_stop_error.get_or_insert(err);
            }
        }

        let outcome = match (result, first_stop_error) {
            (Err(err), _) | (Ok(()), Some(err)) => Err(err),
            (Ok(()), None) => Ok(()),
        };
        self.set_state(if outcome.is_ok() {
            ScanState::Done
        } else {
            ScanState::Failed
        });
        outcome
    }

    async fn drive(&mut self, iterators: &[SharedIterator], stoppers: &[bool]) -> AcqResult<()> {
        let mut active = Vec::new();
        for (i, it) in iterators.iter().enumerate() {
            match it.lock().await.next().await? {
                Advance::Point => active.push(i),
                Advance::Exhausted => info!(iterator = i, "nothing to acquire"),
            }
        }
        if active.is_empty() {
            return Ok(());
        }

        self.set_state(ScanState::Preparing);
        let mut hook = self.prepare_hook.take();
        let prepares = active.iter().map(|i| {
            let it = iterators[*i].clone();
            let hook = hook.take();
            async move {
                let mut it = it.lock().await;
                match hook {
                    Some(hook) => it.prepare_with(hook).await,
                    None => it.prepare().await,
                }
            }
        });
        let mut first_error = None;
        for result in join_all(prepares).await {
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        self.set_state(ScanState::Starting);
        let mut tasks = JoinSet::new();
        for i in active {
            let it = iterators[i].clone();
            tasks.spawn(async move { (i, run_iterator(it).await) });
        }

        let mut outcome = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let (i, result) = match joined {
                Ok(done) => done,
                Err(join_err) => {
                    outcome = Err(AcqError::from(join_err));
                    break;
                }
            };
            if let Err(err) = result {
                outcome = Err(err);
                break;
            }
            if stoppers.get(i).copied().unwrap_or(true) {
                info!(iterator = i, "stopper finished");
                break;
            }
            info!(iterator = i, "iterator finished");
        }
        tasks.shutdown().await;
        outcome
    }
}

impl std::fmt::Debug for Scan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scan")
            .field("run_id", &self.run_id)
            .field("chain", &self.chain)
            .field("state", &self.state())
            .finish()
    }
}

async fn run_iterator(it: SharedIterator) -> AcqResult<()> {
    let mut it = it.lock().await;
    it.start().await?;
    while it.next().await? == Advance::Point {
        it.prepare().await?;
        it.start().await?;
    }
    Ok(())
}
