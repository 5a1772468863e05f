//! Request/response correlation by message id

use super::error::NetError;
use super::message::Message;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use std::future::IntoFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

type Slot = oneshot::Sender<Result<Message, NetError>>;

/// Pending correlated requests of one connection.
///
/// Whichever of resolve, timeout or connection close removes an entry first
/// completes it; the others find nothing and do nothing.
#[derive(Clone, Default)]
pub struct ResponseCorrelator {
    pending: Arc<DashMap<u32, Slot>>,
    next_id: Arc<AtomicU32>,
}

impl ResponseCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a correlation id. Never returns 0 or an id still pending.
    pub fn next_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 && !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register interest in the response to `id`, failing it after `timeout`.
    pub fn register(&self, id: u32, timeout: Duration) -> Result<PendingResponse, NetError> {
        if id == 0 {
            return Err(NetError::invalid("correlation id 0 is reserved"));
        }

        let (tx, rx) = oneshot::channel();
        match self.pending.entry(id) {
            Entry::Occupied(_) => {
                return Err(NetError::invalid(format!("request {} already pending", id)));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        Ok(PendingResponse {
            id,
            rx,
            deadline: Instant::now() + timeout,
            pending: self.pending.clone(),
            done: false,
        })
    }

    /// Complete the request matching `msg.id`.
    ///
    /// Returns the message back when nothing was waiting for it (uncorrelated,
    /// late or duplicate), so the caller can dispatch it normally.
    pub fn resolve(&self, msg: Message) -> Option<Message> {
        if msg.id == 0 {
            return Some(msg);
        }

        match self.pending.remove(&msg.id) {
            Some((_, tx)) => {
                // Receiver gone means the waiter was dropped; nothing to do
                let _ = tx.send(Ok(msg));
                None
            }
            None => Some(msg),
        }
    }

    /// Fail every pending request (connection closed).
    pub fn fail_all(&self) {
        let ids: Vec<u32> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(NetError::ConnectionClosed));
            }
        }
        debug!("Failed pending requests on close");
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Handle to an awaited response. Await it (or call `wait`) to get the reply,
/// `DispatchTimeout` or `ConnectionClosed`. Dropping it unregisters the request.
pub struct PendingResponse {
    id: u32,
    rx: oneshot::Receiver<Result<Message, NetError>>,
    deadline: Instant,
    pending: Arc<DashMap<u32, Slot>>,
    done: bool,
}

impl PendingResponse {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub async fn wait(mut self) -> Result<Message, NetError> {
        let result = match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NetError::ConnectionClosed),
            Err(_) => {
                if self.pending.remove(&self.id).is_some() {
                    Err(NetError::DispatchTimeout(self.id))
                } else {
                    // Resolved between the deadline firing and the removal
                    self.rx
                        .try_recv()
                        .unwrap_or(Err(NetError::DispatchTimeout(self.id)))
                }
            }
        };

        self.done = true;
        result
    }
}

impl IntoFuture for PendingResponse {
    type Output = Result<Message, NetError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.done {
            self.pending.remove(&self.id);
        }
    }
}
