use std::time::Duration;

use bincode::config;
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::byteorder::BigEndian;
use heed::types::{Bytes, U64};
use heed::{Database, Env};
use serde::{Deserialize, Serialize};

use super::{current_timestamp_ms, LmdbStateStore, StoreError};
use crate::paths::AppPaths;

type TaskId = U64<BigEndian>;

/// At-least-once task delivery between the accept path and the worker pool.
///
/// Delivery is lease-based: a dequeued task stays in the queue, invisible
/// until its lease expires. `ack` removes it, `nack` makes it immediately
/// visible again, and a crashed worker's lease simply times out.
pub trait Queue: Send + Sync {
    fn enqueue(&self, payload: &[u8]) -> Result<(), StoreError>;

    fn dequeue(&self, visibility: Duration) -> Result<Option<(QueuedTask, Lease)>, StoreError>;

    fn ack(&self, lease: &Lease) -> Result<(), StoreError>;

    fn nack(&self, lease: &Lease) -> Result<(), StoreError>;

    fn pending_len(&self) -> Result<usize, StoreError>;
}

/// Opaque handle identifying a leased task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    id: u64,
}

/// A dequeued task with its redelivery count.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub payload: Vec<u8>,
    pub delivery_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueItem {
    payload: Vec<u8>,
    leased_until_ms: Option<i64>,
    delivery_count: u32,
}

/// LMDB-backed `Queue`, sharing the environment of the state store.
#[derive(Debug)]
pub struct LmdbQueue {
    env: Env,
    items: Database<TaskId, Bytes>,
}

impl LmdbQueue {
    pub fn open(paths: &AppPaths) -> Result<Self, StoreError> {
        let state = LmdbStateStore::open(paths)?;
        Self::with_env(state.env_handle())
    }

    /// Open against an existing environment so state and queue share one
    /// LMDB map (one write lock, one file set).
    pub fn with_env(env: Env) -> Result<Self, StoreError> {
        let items = {
            let rtxn = env.read_txn()?;
            let opened = env.open_database::<TaskId, Bytes>(&rtxn, Some("queue"))?;
            drop(rtxn);
            match opened {
                Some(existing) => existing,
                None => {
                    let mut wtxn = env.write_txn()?;
                    let db = env.create_database::<TaskId, Bytes>(&mut wtxn, Some("queue"))?;
                    wtxn.commit()?;
                    db
                }
            }
        };
        Ok(Self { env, items })
    }
}

impl Queue for LmdbQueue {
    fn enqueue(&self, payload: &[u8]) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn()?;
        let next_id = match self.items.last(&wtxn)? {
            Some((id, _)) => id.saturating_add(1),
            None => 0,
        };
        let item = QueueItem {
            payload: payload.to_vec(),
            leased_until_ms: None,
            delivery_count: 0,
        };
        let encoded = encode_to_vec(&item, config::standard())?;
        self.items.put(&mut wtxn, &next_id, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    fn dequeue(&self, visibility: Duration) -> Result<Option<(QueuedTask, Lease)>, StoreError> {
        let now_ms = current_timestamp_ms();
        let mut wtxn = self.env.write_txn()?;

        let mut picked: Option<(u64, QueueItem)> = None;
        {
            let iter = self.items.iter(&wtxn)?;
            for entry in iter {
                let (id, raw) = entry?;
                let (item, _) = decode_from_slice::<QueueItem, _>(raw, config::standard())?;
                let leased = matches!(item.leased_until_ms, Some(until) if until > now_ms);
                if !leased {
                    picked = Some((id, item));
                    break;
                }
            }
        }

        let Some((id, mut item)) = picked else {
            return Ok(None);
        };

        item.leased_until_ms = Some(now_ms + visibility.as_millis() as i64);
        item.delivery_count = item.delivery_count.saturating_add(1);
        let task = QueuedTask {
            payload: item.payload.clone(),
            delivery_count: item.delivery_count,
        };
        let encoded = encode_to_vec(&item, config::standard())?;
        self.items.put(&mut wtxn, &id, encoded.as_slice())?;
        wtxn.commit()?;

        Ok(Some((task, Lease { id })))
    }

    fn ack(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn()?;
        let removed = self.items.delete(&mut wtxn, &lease.id)?;
        wtxn.commit()?;
        if removed {
            Ok(())
        } else {
            Err(StoreError::LeaseGone(lease.id))
        }
    }

    fn nack(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn()?;
        let Some(raw) = self.items.get(&wtxn, &lease.id)? else {
            return Err(StoreError::LeaseGone(lease.id));
        };
        let (mut item, _) = decode_from_slice::<QueueItem, _>(raw, config::standard())?;
        item.leased_until_ms = None;
        let encoded = encode_to_vec(&item, config::standard())?;
        self.items.put(&mut wtxn, &lease.id, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    fn pending_len(&self) -> Result<usize, StoreError> {
        let now_ms = current_timestamp_ms();
        let rtxn = self.env.read_txn()?;
        let mut count = 0_usize;
        for entry in self.items.iter(&rtxn)? {
            let (_, raw) = entry?;
            let (item, _) = decode_from_slice::<QueueItem, _>(raw, config::standard())?;
            let leased = matches!(item.leased_until_ms, Some(until) if until > now_ms);
            if !leased {
                count = count.saturating_add(1);
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_queue() -> (TempDir, LmdbQueue) {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let queue = LmdbQueue::open(&paths).expect("open queue");
        (temp, queue)
    }

    #[test]
    fn fifo_order_and_ack_removes() {
        let (_temp, queue) = open_queue();
        queue.enqueue(b"first").expect("enqueue");
        queue.enqueue(b"second").expect("enqueue");

        let (task, lease) = queue
            .dequeue(Duration::from_secs(60))
            .expect("dequeue")
            .expect("task present");
        assert_eq!(task.payload, b"first");
        assert_eq!(task.delivery_count, 1);
        queue.ack(&lease).expect("ack");

        let (task, lease) = queue
            .dequeue(Duration::from_secs(60))
            .expect("dequeue")
            .expect("task present");
        assert_eq!(task.payload, b"second");
        queue.ack(&lease).expect("ack");

        assert!(queue.dequeue(Duration::from_secs(60)).expect("dequeue").is_none());
    }

    #[test]
    fn leased_task_is_invisible_until_nack() {
        let (_temp, queue) = open_queue();
        queue.enqueue(b"task").expect("enqueue");

        let (_, lease) = queue
            .dequeue(Duration::from_secs(60))
            .expect("dequeue")
            .expect("task present");
        assert!(queue.dequeue(Duration::from_secs(60)).expect("dequeue").is_none());

        queue.nack(&lease).expect("nack");
        let (task, _) = queue
            .dequeue(Duration::from_secs(60))
            .expect("dequeue")
            .expect("redelivered");
        assert_eq!(task.payload, b"task");
        assert_eq!(task.delivery_count, 2);
    }

    #[test]
    fn expired_lease_is_redelivered() {
        let (_temp, queue) = open_queue();
        queue.enqueue(b"task").expect("enqueue");

        let _ = queue
            .dequeue(Duration::from_millis(0))
            .expect("dequeue")
            .expect("task present");

        let (task, _) = queue
            .dequeue(Duration::from_secs(60))
            .expect("dequeue")
            .expect("redelivered after lease expiry");
        assert_eq!(task.delivery_count, 2);
    }

    #[test]
    fn ack_of_unknown_lease_errors() {
        let (_temp, queue) = open_queue();
        queue.enqueue(b"task").expect("enqueue");
        let (_, lease) = queue
            .dequeue(Duration::from_secs(60))
            .expect("dequeue")
            .expect("task present");
        queue.ack(&lease).expect("ack");
        assert!(matches!(queue.ack(&lease), Err(StoreError::LeaseGone(_))));
    }
}
