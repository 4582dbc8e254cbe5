//! # Output Scheduling
//!
//! Buffer recycling and deferred flushing for the send path.
//!
//! Outgoing traffic is dominated by many small logical messages; sending each
//! as its own frame wastes header bytes and socket writes. Connections
//! registered for autosend accumulate messages into a pending batch, and a
//! single short timer flushes every registered connection at once.
//!
//! ## Deregistration
//! Unregistering only flips the protocol's flag; the entry stays in the list
//! until the next [`OutputMessagePool::send_all`] pass compacts it together
//! with entries whose protocol has died. Registration is rare and flushing is
//! hot, so the cleanup cost is paid where the list is already being walked.

use crate::config::PoolConfig;
use crate::core::output::OutputMessage;
use crate::protocol::Protocol;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// Delay between a scheduling request and the flush pass. Long enough to
/// coalesce the messages of one game tick, short enough to stay invisible
/// next to network latency.
pub const SCHEDULER_TICK: Duration = Duration::from_millis(10);

/// Shared pool of recycled output buffers plus the autosend registry.
pub struct OutputMessagePool {
    idle: Mutex<Vec<OutputMessage>>,
    autosend: Mutex<Vec<Weak<Protocol>>>,
    flush_scheduled: AtomicBool,
    max_idle: usize,
}

impl OutputMessagePool {
    pub fn new(config: &PoolConfig) -> Arc<Self> {
        let mut idle = Vec::with_capacity(config.preallocated);
        idle.resize_with(config.preallocated, OutputMessage::new);
        Arc::new(Self {
            idle: Mutex::new(idle),
            autosend: Mutex::new(Vec::new()),
            flush_scheduled: AtomicBool::new(false),
            max_idle: config.max_idle,
        })
    }

    /// Take a buffer from the pool, allocating only when it is empty.
    pub fn get_output_message(&self) -> OutputMessage {
        let recycled = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match recycled {
            Some(mut msg) => {
                msg.reset();
                msg
            }
            None => {
                trace!("idle pool empty, allocating output buffer");
                OutputMessage::new()
            }
        }
    }

    /// Return a buffer after its frame has been delivered. Buffers beyond
    /// the idle ceiling are dropped instead of retained.
    pub fn recycle(&self, mut msg: OutputMessage) {
        msg.reset();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(msg);
        }
    }

    /// Number of buffers currently idle in the pool.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Register a connection for batched flushing.
    pub fn add_protocol_to_autosend(&self, protocol: &Arc<Protocol>) {
        protocol.mark_autosend(true);
        self.autosend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(protocol));
        debug!("protocol registered for autosend");
    }

    /// Deregister a connection. Cheap; the registry entry is compacted on
    /// the next flush pass.
    pub fn remove_protocol_from_autosend(&self, protocol: &Protocol) {
        protocol.mark_autosend(false);
    }

    /// Flush the pending batch of every registered connection and compact
    /// dead or deregistered entries out of the registry.
    pub fn send_all(&self) {
        let targets: Vec<Arc<Protocol>> = {
            let mut autosend = self.autosend.lock().unwrap_or_else(PoisonError::into_inner);
            let mut targets = Vec::with_capacity(autosend.len());
            autosend.retain(|weak| match weak.upgrade() {
                Some(protocol) if protocol.is_autosend() => {
                    targets.push(protocol);
                    true
                }
                _ => false,
            });
            targets
        };
        for protocol in targets {
            protocol.flush_pending();
        }
    }

    /// Request a flush pass one [`SCHEDULER_TICK`] from now. Calls while a
    /// pass is already pending are absorbed, so any burst of queued messages
    /// costs exactly one timer and one [`Self::send_all`].
    pub fn schedule_send_all(self: &Arc<Self>) {
        if self.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(SCHEDULER_TICK).await;
            pool.flush_scheduled.store(false, Ordering::Release);
            pool.send_all();
        });
    }
}

impl std::fmt::Debug for OutputMessagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputMessagePool")
            .field("idle", &self.idle_count())
            .field("max_idle", &self.max_idle)
            .field("flush_scheduled", &self.flush_scheduled.load(Ordering::Relaxed))
            .finish()
    }
}
