// ========================================================================================
//
//                     Stage hand-off: bounded FIFO queues and completion flags
//
// ========================================================================================
//
// Every stage of the pipeline talks to its neighbour through exactly one of these
// queues. The upstream stage owns the `QueueSender` and pushes; dropping it is the
// "nothing more will come" signal. The downstream stage owns the `ThreadSafeQueue` and
// pops until the queue is both finished and empty. That pair of conditions is the
// whole termination protocol of the pipeline.
//
// The queues are bounded, so a fast upstream stage blocks in `push` instead of piling
// up batches. If the downstream stage goes away, `push` fails instead of blocking.

use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A write-once boolean shared between threads.
///
/// The single writer calls [`CompletionFlag::set`]; any number of readers may call
/// [`CompletionFlag::is_set`]. Everything the writer did before `set` is visible to a
/// reader that observes `true`.
#[derive(Debug, Default)]
pub struct CompletionFlag(AtomicBool);

impl CompletionFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Raises the flag. Returns `true` only for the call that actually raised it.
    pub fn set(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The pushing end of a [`ThreadSafeQueue`]. There is exactly one per queue.
///
/// Dropping it (or calling [`QueueSender::finish`]) marks the queue exhausted, so the
/// owning stage signals its downstream on every exit path, including `?` returns and
/// unwinding.
#[derive(Debug)]
pub struct QueueSender<T> {
    sender: Sender<T>,
    exhausted: Arc<CompletionFlag>,
}

impl<T> QueueSender<T> {
    /// Appends `item` to the tail, waiting while the queue is full.
    ///
    /// Hands the item back if the receiving stage has already gone away.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.sender.send(item).map_err(|e| e.into_inner())
    }

    /// Marks the queue exhausted. Equivalent to dropping the sender.
    pub fn finish(self) {
        drop(self);
    }
}

impl<T> Drop for QueueSender<T> {
    fn drop(&mut self) {
        // Raised before the channel disconnects, so a receiver woken by the
        // disconnect always sees it.
        self.exhausted.set();
    }
}

/// The popping end of a bounded FIFO shared by one upstream and one downstream stage.
///
/// `pop` never waits; callers that want to wait use [`ThreadSafeQueue::pop_wait`],
/// which sleeps until an item arrives or the sender is gone.
#[derive(Debug)]
pub struct ThreadSafeQueue<T> {
    receiver: Receiver<T>,
    exhausted: Arc<CompletionFlag>,
}

impl<T> ThreadSafeQueue<T> {
    /// Creates a queue holding at most `depth` items and returns both of its ends.
    pub fn bounded(depth: usize) -> (QueueSender<T>, Self) {
        let (sender, receiver) = bounded(depth);
        let exhausted = Arc::new(CompletionFlag::new());
        (
            QueueSender {
                sender,
                exhausted: Arc::clone(&exhausted),
            },
            Self {
                receiver,
                exhausted,
            },
        )
    }

    /// Removes the head item, or returns `None` immediately if the queue is empty.
    pub fn pop(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Whether the sender has finished. Items pushed before that may still be queued.
    pub fn is_finished(&self) -> bool {
        self.exhausted.is_set()
    }

    /// Blocks until an item is available or the queue is finished and drained.
    ///
    /// `None` is returned only once no item can ever arrive again.
    pub fn pop_wait(&self) -> Option<T> {
        self.receiver.recv().ok()
    }
}
