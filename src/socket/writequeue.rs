//! Outbound write queue.

use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;

/// Identity of a queued write, echoed back in `ConnEvent::Write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriteId(u64);

impl WriteId {
    pub fn get(self) -> u64 {
        self.0
    }
}

pub(crate) type ReleaseFn = Box<dyn FnOnce(Bytes)>;

struct QueuedWrite {
    id: WriteId,
    data: Bytes,
    sent: usize,
    release: Option<ReleaseFn>,
}

/// A buffer that left the queue, sent in full or discarded.
pub(crate) struct Finished {
    pub id: WriteId,
    data: Bytes,
    release: Option<ReleaseFn>,
}

impl Finished {
    /// Hand the buffer back to its owner, if one asked for it.
    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release(std::mem::take(&mut self.data));
        }
    }
}

#[derive(Default)]
pub(crate) struct WriteQueue {
    entries: VecDeque<QueuedWrite>,
    next_id: u64,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: Bytes, release: Option<ReleaseFn>) -> WriteId {
        self.next_id += 1;
        let id = WriteId(self.next_id);
        self.entries.push_back(QueuedWrite {
            id,
            data,
            sent: 0,
            release,
        });
        id
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unsent remainder of the head buffer.
    pub fn front(&self) -> Option<Bytes> {
        self.entries.front().map(|e| e.data.slice(e.sent..))
    }

    /// Record `n` bytes of the head as sent; returns the head once complete.
    pub fn advance(&mut self, n: usize) -> Option<Finished> {
        let head = self.entries.front_mut()?;
        head.sent = (head.sent + n).min(head.data.len());
        if head.sent < head.data.len() {
            return None;
        }
        self.entries.pop_front().map(|e| Finished {
            id: e.id,
            data: e.data,
            release: e.release,
        })
    }

    /// Empty the queue without sending. Partial writes are abandoned.
    pub fn drain(&mut self) -> Vec<Finished> {
        self.entries
            .drain(..)
            .map(|e| Finished {
                id: e.id,
                data: e.data,
                release: e.release,
            })
            .collect()
    }
}

impl fmt::Debug for WriteQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteQueue")
            .field("pending", &self.entries.len())
            .field("bytes", &self.entries.iter().map(|e| e.data.len() - e.sent).sum::<usize>())
            .finish()
    }
}
