//! Pending-request table - correlates outbound request ids with awaiters.
//!
//! Every uid-carrying request registers a completion here before it is
//! enqueued, so a response can never race its own registration. The
//! table is the only id allocator: ids come from a monotonically
//! increasing counter truncated into the 16-bit id space, with a short
//! probe on collision.
//!
//! When the connection dies the table is *poisoned*: every pending
//! completion fails with the close reason, and every later `register`
//! fails immediately with the same reason. Poisoning is irreversible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::codec::PayloadEncoding;
use crate::connection::CloseReason;
use crate::error::{Result, SockwireError};

/// Number of usable request ids (1..=0xFFFF; 0 is never allocated).
const ID_SPACE: u32 = 0xFFFF;

/// A response body awaiting typed decoding by the caller.
#[derive(Debug)]
pub struct ResponsePayload {
    /// Codec named by the response header (default json).
    pub encoding: PayloadEncoding,
    /// Raw body bytes.
    pub body: Bytes,
}

impl ResponsePayload {
    /// Decode the body into the expected return type.
    ///
    /// A decode failure is a local protocol error; it never reaches the
    /// wire.
    pub fn decode<R: serde::de::DeserializeOwned>(&self) -> Result<R> {
        self.encoding.decode(&self.body).map_err(|e| {
            SockwireError::Protocol(format!("Undecodable response body: {}", e))
        })
    }
}

/// What a pending awaiter eventually receives.
pub type ResponseResult = Result<ResponsePayload>;

pub(crate) type Completion = oneshot::Sender<ResponseResult>;

struct Inner {
    /// Outstanding completions keyed by uid.
    slots: HashMap<u32, Completion>,
    /// Set once the connection dies; all later registration fails.
    poison: Option<CloseReason>,
}

/// Thread-safe map from request uid to completion.
pub struct PendingTable {
    inner: Mutex<Inner>,
    /// Monotonic id source, truncated into [`ID_SPACE`].
    next: AtomicU32,
}

impl PendingTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                poison: None,
            }),
            next: AtomicU32::new(0),
        }
    }

    /// Allocate a uid and register a completion for it.
    ///
    /// This is the only way ids are allocated. On collision the
    /// allocator probes forward; with the whole id space occupied the
    /// call fails with a transient error.
    ///
    /// # Errors
    ///
    /// Fails with the close reason once the table is poisoned, or with
    /// [`SockwireError::IdSpaceExhausted`] when every id is in use.
    pub fn register(&self) -> Result<(u32, oneshot::Receiver<ResponseResult>)> {
        let mut inner = self.inner.lock();

        if let Some(reason) = &inner.poison {
            return Err(reason.to_error());
        }
        if inner.slots.len() as u32 >= ID_SPACE {
            return Err(SockwireError::IdSpaceExhausted);
        }

        // The occupancy check above bounds this probe loop.
        loop {
            let raw = self.next.fetch_add(1, Ordering::Relaxed);
            let uid = (raw % ID_SPACE) + 1;
            if let std::collections::hash_map::Entry::Vacant(slot) = inner.slots.entry(uid) {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                return Ok((uid, rx));
            }
        }
    }

    /// Remove and return the completion for a uid, at most once.
    pub fn take(&self, uid: u32) -> Option<Completion> {
        self.inner.lock().slots.remove(&uid)
    }

    /// Poison the table: fail every pending completion with the close
    /// reason and make all later `register` calls fail the same way.
    ///
    /// Idempotent; the first reason wins.
    pub fn fail_all(&self, reason: CloseReason) {
        let drained: Vec<Completion> = {
            let mut inner = self.inner.lock();
            if inner.poison.is_none() {
                inner.poison = Some(reason.clone());
            }
            inner.slots.drain().map(|(_, tx)| tx).collect()
        };

        for tx in drained {
            // Awaiter may have given up; nothing to do then.
            let _ = tx.send(Err(reason.to_error()));
        }
    }

    /// Number of outstanding entries.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Check if no entries are outstanding.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().slots.is_empty()
    }

    /// Check if the table has been poisoned.
    pub fn is_poisoned(&self) -> bool {
        self.inner.lock().poison.is_some()
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::CloseKind;

    fn transport_loss() -> CloseReason {
        CloseReason {
            graceful: false,
            description: "connection reset".to_string(),
            kind: CloseKind::Transport,
        }
    }

    #[test]
    fn test_register_allocates_distinct_ids() {
        let table = PendingTable::new();

        let (uid1, _rx1) = table.register().unwrap();
        let (uid2, _rx2) = table.register().unwrap();
        let (uid3, _rx3) = table.register().unwrap();

        assert_ne!(uid1, uid2);
        assert_ne!(uid2, uid3);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_ids_never_zero() {
        let table = PendingTable::new();
        for _ in 0..1000 {
            let (uid, _rx) = table.register().unwrap();
            assert_ne!(uid, 0);
            table.take(uid);
        }
    }

    #[test]
    fn test_take_at_most_once() {
        let table = PendingTable::new();
        let (uid, _rx) = table.register().unwrap();

        assert!(table.take(uid).is_some());
        assert!(table.take(uid).is_none());
    }

    #[test]
    fn test_take_unknown_uid() {
        let table = PendingTable::new();
        assert!(table.take(12345).is_none());
    }

    #[tokio::test]
    async fn test_completion_delivery() {
        let table = PendingTable::new();
        let (uid, rx) = table.register().unwrap();

        let tx = table.take(uid).unwrap();
        tx.send(Ok(ResponsePayload {
            encoding: PayloadEncoding::Json,
            body: Bytes::from_static(b"5"),
        }))
        .unwrap();

        let payload = rx.await.unwrap().unwrap();
        let value: i32 = payload.decode().unwrap();
        assert_eq!(value, 5);
    }

    #[test]
    fn test_collision_probes_forward() {
        let table = PendingTable::new();

        // Occupy the id the counter will hand out next.
        let (first, _rx) = table.register().unwrap();
        // Rewind the counter so the next allocation collides with `first`.
        table.next.store(first - 1, Ordering::Relaxed);

        let (second, _rx2) = table.register().unwrap();
        assert_ne!(second, first);
    }

    #[tokio::test]
    async fn test_fail_all_poisons() {
        let table = PendingTable::new();
        let (_uid1, rx1) = table.register().unwrap();
        let (_uid2, rx2) = table.register().unwrap();

        table.fail_all(transport_loss());

        for rx in [rx1, rx2] {
            let err = rx.await.unwrap().unwrap_err();
            assert!(matches!(err, SockwireError::ConnectionLost(_)));
            assert!(err.to_string().contains("connection reset"));
        }

        assert!(table.is_poisoned());
        assert!(table.is_empty());

        // Registration after poisoning fails with the same reason.
        let err = table.register().unwrap_err();
        assert!(matches!(err, SockwireError::ConnectionLost(_)));
    }

    #[test]
    fn test_fail_all_first_reason_wins() {
        let table = PendingTable::new();
        table.fail_all(transport_loss());

        table.fail_all(CloseReason {
            graceful: true,
            description: "bye".to_string(),
            kind: CloseKind::Shutdown,
        });

        let err = table.register().unwrap_err();
        assert!(matches!(err, SockwireError::ConnectionLost(_)));
    }

    #[test]
    fn test_saturation_is_transient_error() {
        let table = PendingTable::new();
        let mut receivers = Vec::with_capacity(ID_SPACE as usize);
        for _ in 0..ID_SPACE {
            receivers.push(table.register().unwrap());
        }

        let err = table.register().unwrap_err();
        assert!(matches!(err, SockwireError::IdSpaceExhausted));

        // Freeing one slot makes registration possible again.
        let freed = receivers[0].0;
        table.take(freed);
        assert!(table.register().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_reason_maps_to_was_shutdown() {
        let table = PendingTable::new();
        let (_uid, rx) = table.register().unwrap();

        table.fail_all(CloseReason {
            graceful: false,
            description: "bye".to_string(),
            kind: CloseKind::Shutdown,
        });

        let err = rx.await.unwrap().unwrap_err();
        match err {
            SockwireError::WasShutdown { reason } => assert_eq!(reason, "bye"),
            other => panic!("expected WasShutdown, got {:?}", other),
        }
    }
}
