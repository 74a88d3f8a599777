//! Type-specific storage behind the queue.
//!
//! The queue core is generic over these backings; the mapping is fixed at
//! construction. Direct mode stores nothing — the enqueue path invokes the
//! consumer on the producer's thread before ever reaching a backing.

use std::collections::VecDeque;

use crate::stream::{StreamReader, StreamWriter};
use crate::Bufferable;

use super::QueueError;

#[derive(Debug)]
pub(super) enum Backing<T: Bufferable> {
    FixedArray {
        buf: Vec<Option<T>>,
        head: usize,
        tail: usize,
    },
    LinkedList(VecDeque<T>),
    Disk {
        write: StreamWriter,
        read: StreamReader,
    },
    Direct,
}

impl<T: Bufferable> Backing<T> {
    pub(super) fn fixed_array(capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(capacity);
        buf.resize_with(capacity, || None);
        Backing::FixedArray {
            buf,
            head: 0,
            tail: 0,
        }
    }

    pub(super) fn linked_list() -> Self {
        Backing::LinkedList(VecDeque::new())
    }

    pub(super) fn disk(write: StreamWriter, read: StreamReader) -> Self {
        Backing::Disk { write, read }
    }

    /// Appends one item. The caller accounts for size and guarantees the
    /// fixed ring is not full.
    pub(super) fn add(&mut self, item: T) -> Result<(), QueueError> {
        match self {
            Backing::FixedArray { buf, tail, .. } => {
                debug_assert!(buf[*tail].is_none());
                buf[*tail] = Some(item);
                *tail = (*tail + 1) % buf.len();
                Ok(())
            }
            Backing::LinkedList(list) => {
                list.push_back(item);
                Ok(())
            }
            Backing::Disk { write, .. } => {
                item.serialize(write)?;
                write.flush()?;
                Ok(())
            }
            Backing::Direct => unreachable!("direct queues never buffer"),
        }
    }

    /// Removes the head item. The caller guarantees a nonzero size.
    pub(super) fn del(&mut self) -> Result<T, QueueError> {
        match self {
            Backing::FixedArray { buf, head, .. } => {
                let item = buf[*head].take();
                *head = (*head + 1) % buf.len();
                item.ok_or(QueueError::Corrupted)
            }
            Backing::LinkedList(list) => list.pop_front().ok_or(QueueError::Corrupted),
            Backing::Disk { read, .. } => Ok(T::deserialize(read)?),
            Backing::Direct => unreachable!("direct queues never buffer"),
        }
    }

    pub(super) fn disk_streams(&mut self) -> Option<(&mut StreamWriter, &mut StreamReader)> {
        match self {
            Backing::Disk { write, read } => Some((write, read)),
            _ => None,
        }
    }
}
