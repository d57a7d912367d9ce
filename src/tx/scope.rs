//! Call-stack transaction state.
//!
//! A [`TxScope`] is the explicit replacement for thread-bound transaction
//! synchronization: every unit of work receives the scope of its caller and
//! performs nested transactional calls through it. Each call pushes one frame
//! and pops it when the call completes.
//!
//! A frame either owns a physical transaction, participates in one owned by a
//! lower frame, holds a savepoint inside one, or runs without a transaction.
//! A transaction owned by a frame that is not the topmost frame of its side is
//! suspended; popping the frames above it resumes it.
//!
//! Dropping a scope mid-call (for example when its future is cancelled) drops
//! the sessions it owns, which rolls back their open transactions.

use crate::db::manager::{TransactionManager, TransactionSession};
use crate::error::{TxError, TxResult};
use crate::models::{
    CompletionStatus, Isolation, Propagation, Side, TransactionConfiguration,
    TransactionDefinition,
};
use futures_util::future::BoxFuture;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, warn};

type CompletionCallback = Box<dyn FnOnce(CompletionStatus) + Send>;

/// How a new frame relates to the transactions already on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Participation {
    /// Join the transaction owned by the frame at this index.
    Join(usize),
    /// Savepoint inside the transaction owned by the frame at this index.
    Savepoint(usize),
    /// Begin a new physical transaction.
    New,
    /// Run without a transaction.
    NonTransactional,
}

enum FrameKind<S> {
    Owner {
        session: S,
        isolation: Isolation,
        read_only: bool,
        global_rollback_only: bool,
        callbacks: Vec<CompletionCallback>,
    },
    Participant {
        owner: usize,
    },
    Savepoint {
        owner: usize,
        name: String,
        /// Owner's rollback-only mark when the savepoint was set, restored
        /// when the segment rolls back.
        owner_rollback_only: bool,
    },
    NonTransactional {
        /// Opened on first use.
        session: Option<S>,
        callbacks: Vec<CompletionCallback>,
    },
}

struct Frame<S> {
    side: Side,
    propagation: Propagation,
    rollback_only: bool,
    kind: FrameKind<S>,
}

/// Transactions active on one logical call stack.
pub struct TxScope<M: TransactionManager> {
    write: Arc<M>,
    read: Arc<M>,
    frames: Vec<Frame<M::Session>>,
    savepoint_counter: usize,
}

impl<M: TransactionManager> std::fmt::Debug for TxScope<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxScope")
            .field("write", &self.write.name())
            .field("read", &self.read.name())
            .field("depth", &self.frames.len())
            .finish_non_exhaustive()
    }
}

impl<M: TransactionManager> TxScope<M> {
    pub(crate) fn new(write: Arc<M>, read: Arc<M>) -> Self {
        Self {
            write,
            read,
            frames: Vec::new(),
            savepoint_counter: 0,
        }
    }

    /// Run `work` as a nested write call.
    pub async fn write<T, F>(&mut self, config: &TransactionConfiguration, work: F) -> TxResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut TxScope<M>) -> BoxFuture<'c, TxResult<T>> + Send,
    {
        crate::tx::service::execute(self, Side::Write, config, work).await
    }

    /// Run `work` as a nested read call, bound to the read-side manager.
    pub async fn read<T, F>(&mut self, config: &TransactionConfiguration, work: F) -> TxResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut TxScope<M>) -> BoxFuture<'c, TxResult<T>> + Send,
    {
        crate::tx::service::execute(self, Side::Read, config, work).await
    }

    /// The session of the current frame.
    ///
    /// Participants and savepoints share their owner's session. A frame
    /// without a transaction opens an auto-commit session on first use.
    pub async fn session(&mut self) -> TxResult<&mut M::Session> {
        let top = self
            .frames
            .len()
            .checked_sub(1)
            .ok_or_else(|| TxError::internal("No call in progress on this scope"))?;
        let target = self.session_frame(top);

        let needs_open = matches!(
            self.frames[target].kind,
            FrameKind::NonTransactional { session: None, .. }
        );
        if needs_open {
            let manager = self.manager(self.frames[target].side).clone();
            let opened = manager.open().await?;
            if let FrameKind::NonTransactional { session, .. } = &mut self.frames[target].kind {
                *session = Some(opened);
            }
        }

        match &mut self.frames[target].kind {
            FrameKind::Owner { session, .. } => Ok(session),
            FrameKind::NonTransactional {
                session: Some(session),
                ..
            } => Ok(session),
            _ => Err(TxError::internal("Frame has no session")),
        }
    }

    /// True when the current call runs inside a transaction.
    pub fn is_transaction_active(&self) -> bool {
        self.frames
            .last()
            .is_some_and(|f| !matches!(f.kind, FrameKind::NonTransactional { .. }))
    }

    /// True when a transaction is active for `side`, whichever frame is current.
    pub fn is_active_on(&self, side: Side) -> bool {
        self.active_owner(side).is_some()
    }

    pub fn is_read_only(&self) -> bool {
        let Some(top) = self.frames.len().checked_sub(1) else {
            return false;
        };
        match &self.frames[self.session_frame(top)].kind {
            FrameKind::Owner { read_only, .. } => *read_only,
            _ => self.frames[top].side == Side::Read,
        }
    }

    /// Isolation of the current transaction, if any.
    pub fn isolation(&self) -> Option<Isolation> {
        let top = self.frames.len().checked_sub(1)?;
        match &self.frames[self.session_frame(top)].kind {
            FrameKind::Owner { isolation, .. } => Some(*isolation),
            _ => None,
        }
    }

    /// Number of calls currently on the stack.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn current_side(&self) -> Option<Side> {
        self.frames.last().map(|f| f.side)
    }

    pub fn current_propagation(&self) -> Option<Propagation> {
        self.frames.last().map(|f| f.propagation)
    }

    pub fn is_rollback_only(&self) -> bool {
        let Some(frame) = self.frames.last() else {
            return false;
        };
        if frame.rollback_only {
            return true;
        }
        let owner = match &frame.kind {
            FrameKind::Participant { owner } => *owner,
            FrameKind::Owner {
                global_rollback_only,
                ..
            } => return *global_rollback_only,
            _ => return false,
        };
        matches!(
            self.frames[owner].kind,
            FrameKind::Owner {
                global_rollback_only: true,
                ..
            }
        )
    }

    /// Request rollback without failing the current call.
    ///
    /// An owning frame rolls back silently when it completes, a savepoint
    /// frame rolls back to its savepoint. A participant marks the whole
    /// transaction rollback-only, so its owner fails with
    /// [`TxError::UnexpectedRollback`] if it tries to commit.
    pub fn set_rollback_only(&mut self) {
        let owner = match self.frames.last_mut() {
            None => return,
            Some(frame) => match frame.kind {
                FrameKind::Participant { owner } => Some(owner),
                _ => {
                    frame.rollback_only = true;
                    None
                }
            },
        };
        if let Some(owner) = owner {
            self.mark_global_rollback_only(owner);
        }
    }

    /// Run `callback` once the transaction of the current call finishes.
    ///
    /// Callbacks of participants and savepoints run when the owning
    /// transaction finishes. Callbacks of calls without a transaction run
    /// when that call ends.
    pub fn on_completion<C>(&mut self, callback: C) -> TxResult<()>
    where
        C: FnOnce(CompletionStatus) + Send + 'static,
    {
        let top = self
            .frames
            .len()
            .checked_sub(1)
            .ok_or_else(|| TxError::internal("No call in progress on this scope"))?;
        let target = self.session_frame(top);
        match &mut self.frames[target].kind {
            FrameKind::Owner { callbacks, .. } | FrameKind::NonTransactional { callbacks, .. } => {
                callbacks.push(Box::new(callback));
                Ok(())
            }
            _ => Err(TxError::internal("Frame cannot hold completion callbacks")),
        }
    }

    /// Index of the frame owning the active transaction of `side`.
    pub(crate) fn active_owner(&self, side: Side) -> Option<usize> {
        let (index, frame) = self
            .frames
            .iter()
            .enumerate()
            .rev()
            .find(|(_, f)| f.side == side)?;
        match frame.kind {
            FrameKind::Owner { .. } => Some(index),
            FrameKind::Participant { owner } | FrameKind::Savepoint { owner, .. } => Some(owner),
            FrameKind::NonTransactional { .. } => None,
        }
    }

    pub(crate) async fn push(
        &mut self,
        side: Side,
        propagation: Propagation,
        participation: Participation,
        definition: &TransactionDefinition,
    ) -> TxResult<()> {
        let kind = match participation {
            Participation::Join(owner) => FrameKind::Participant { owner },
            Participation::Savepoint(owner) => {
                self.savepoint_counter += 1;
                let name = format!("SAVEPOINT_{}", self.savepoint_counter);
                self.owner_session(owner)?.create_savepoint(&name).await?;
                debug!(side = %side, savepoint = %name, "Savepoint created");
                FrameKind::Savepoint {
                    owner,
                    name,
                    owner_rollback_only: self.global_rollback_only(owner),
                }
            }
            Participation::New => {
                let manager = self.manager(side).clone();
                let session = manager.begin(definition).await?;
                FrameKind::Owner {
                    session,
                    isolation: definition.isolation,
                    read_only: definition.read_only,
                    global_rollback_only: false,
                    callbacks: Vec::new(),
                }
            }
            Participation::NonTransactional => FrameKind::NonTransactional {
                session: None,
                callbacks: Vec::new(),
            },
        };
        self.frames.push(Frame {
            side,
            propagation,
            rollback_only: false,
            kind,
        });
        Ok(())
    }

    /// Complete the current call with `result`, committing or rolling back
    /// whatever the call's frame owns.
    pub(crate) async fn pop<T>(&mut self, result: TxResult<T>) -> TxResult<T> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| TxError::internal("Scope frame stack is empty"))?;
        let side = frame.side;

        match frame.kind {
            FrameKind::Owner {
                mut session,
                global_rollback_only,
                callbacks,
                ..
            } => {
                let mut committed = false;
                let outcome = match result {
                    Err(err) => {
                        debug!(side = %side, error = %err, "Rolling back after failure");
                        if let Err(rollback_err) = session.rollback().await {
                            warn!(
                                side = %side,
                                error = %rollback_err,
                                "Rollback failed, returning original error"
                            );
                        }
                        Err(err)
                    }
                    Ok(value) if frame.rollback_only => {
                        debug!(side = %side, "Rolling back transaction marked rollback-only");
                        session.rollback().await.map(|_| value)
                    }
                    Ok(_) if global_rollback_only => {
                        debug!(side = %side, "Participant marked transaction rollback-only");
                        match session.rollback().await {
                            Ok(()) => Err(TxError::unexpected_rollback(
                                "Transaction rolled back because it has been marked as rollback-only",
                            )),
                            Err(e) => Err(e),
                        }
                    }
                    Ok(value) => {
                        let committed_result = session.commit().await;
                        committed = committed_result.is_ok();
                        committed_result.map(|_| value)
                    }
                };
                let status = if committed {
                    CompletionStatus::Committed
                } else {
                    CompletionStatus::RolledBack
                };
                run_callbacks(callbacks, status);
                outcome
            }
            FrameKind::Participant { owner } => {
                if result.is_err() || frame.rollback_only {
                    debug!(side = %side, "Participating call failed, marking transaction rollback-only");
                    self.mark_global_rollback_only(owner);
                }
                result
            }
            FrameKind::Savepoint {
                owner,
                name,
                owner_rollback_only,
            } => {
                let session = self.owner_session(owner)?;
                let outcome = match result {
                    Ok(value) if !frame.rollback_only => {
                        session.release_savepoint(&name).await?;
                        return Ok(value);
                    }
                    Ok(value) => {
                        rollback_savepoint(session, &name).await?;
                        Ok(value)
                    }
                    Err(err) => {
                        debug!(side = %side, savepoint = %name, "Rolling back to savepoint");
                        match rollback_savepoint(session, &name).await {
                            Ok(()) => Err(err),
                            Err(rollback_err) => {
                                warn!(
                                    side = %side,
                                    savepoint = %name,
                                    error = %rollback_err,
                                    "Savepoint rollback failed, returning original error"
                                );
                                return Err(err);
                            }
                        }
                    }
                };
                // Marks left by participants inside the segment are undone with it
                self.set_global_rollback_only(owner, owner_rollback_only);
                outcome
            }
            FrameKind::NonTransactional { session, callbacks } => {
                drop(session);
                let status = if result.is_ok() && !frame.rollback_only {
                    CompletionStatus::Committed
                } else {
                    CompletionStatus::RolledBack
                };
                run_callbacks(callbacks, status);
                result
            }
        }
    }

    fn manager(&self, side: Side) -> &Arc<M> {
        match side {
            Side::Write => &self.write,
            Side::Read => &self.read,
        }
    }

    /// Frame whose session serves the frame at `index`.
    fn session_frame(&self, index: usize) -> usize {
        match &self.frames[index].kind {
            FrameKind::Participant { owner } | FrameKind::Savepoint { owner, .. } => *owner,
            _ => index,
        }
    }

    fn owner_session(&mut self, owner: usize) -> TxResult<&mut M::Session> {
        match self.frames.get_mut(owner).map(|f| &mut f.kind) {
            Some(FrameKind::Owner { session, .. }) => Ok(session),
            _ => Err(TxError::internal(format!(
                "Frame {owner} does not own a transaction"
            ))),
        }
    }

    fn mark_global_rollback_only(&mut self, owner: usize) {
        self.set_global_rollback_only(owner, true);
    }

    fn global_rollback_only(&self, owner: usize) -> bool {
        matches!(
            self.frames.get(owner).map(|f| &f.kind),
            Some(FrameKind::Owner {
                global_rollback_only: true,
                ..
            })
        )
    }

    fn set_global_rollback_only(&mut self, owner: usize, value: bool) {
        if let Some(Frame {
            kind: FrameKind::Owner {
                global_rollback_only,
                ..
            },
            ..
        }) = self.frames.get_mut(owner)
        {
            *global_rollback_only = value;
        }
    }
}

async fn rollback_savepoint<S: TransactionSession>(session: &mut S, name: &str) -> TxResult<()> {
    session.rollback_to_savepoint(name).await?;
    session.release_savepoint(name).await
}

fn run_callbacks(callbacks: Vec<CompletionCallback>, status: CompletionStatus) {
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(status))).is_err() {
            warn!(status = ?status, "Completion callback panicked");
        }
    }
}
