//! Request/response correlation for long-running client calls.
//!
//! A call registers itself in a [`RequestTable`] and gets back a
//! [`PendingRequest`]. The reader task resolves it by id when the reply
//! arrives. The caller can cancel through the request's token, and every
//! request carries its own timeout.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::CollabError;

/// Handle to an in-flight request.
#[derive(Debug)]
pub struct PendingRequest<T> {
    id: Uuid,
    rx: oneshot::Receiver<Result<T, CollabError>>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl<T> PendingRequest<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Token that aborts [`wait`](Self::wait) when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<T, CollabError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CollabError::Cancelled),
            _ = tokio::time::sleep(self.timeout) => Err(CollabError::TimedOut(self.timeout)),
            reply = self.rx => match reply {
                Ok(result) => result,
                Err(_) => Err(CollabError::Connection("request dropped".into())),
            },
        }
    }
}

/// Requests waiting for a reply, keyed by id.
#[derive(Debug)]
pub struct RequestTable<T> {
    waiting: Mutex<HashMap<Uuid, oneshot::Sender<Result<T, CollabError>>>>,
}

impl<T> Default for RequestTable<T> {
    fn default() -> Self {
        Self {
            waiting: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> RequestTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid, timeout: Duration) -> PendingRequest<T> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut waiting) = self.waiting.lock() {
            waiting.insert(id, tx);
        }
        PendingRequest {
            id,
            rx,
            cancel: CancellationToken::new(),
            timeout,
        }
    }

    /// Deliver a reply. Returns false when nobody was waiting for `id`.
    pub fn resolve(&self, id: Uuid, result: Result<T, CollabError>) -> bool {
        let sender = match self.waiting.lock() {
            Ok(mut waiting) => waiting.remove(&id),
            Err(_) => None,
        };
        match sender {
            Some(tx) => tx.send(result).is_ok(),
            None => {
                log::debug!("No request waiting for reply {id}");
                false
            }
        }
    }

    /// Fail every waiting request, e.g. when the connection drops.
    pub fn fail_all(&self, error: CollabError) -> usize {
        let drained: Vec<_> = match self.waiting.lock() {
            Ok(mut waiting) => waiting.drain().map(|(_, tx)| tx).collect(),
            Err(_) => Vec::new(),
        };
        let n = drained.len();
        for tx in drained {
            let _ = tx.send(Err(error.clone()));
        }
        n
    }

    pub fn len(&self) -> usize {
        self.waiting.lock().map_or(0, |w| w.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_delivers() {
        let table = RequestTable::<u32>::new();
        let id = Uuid::new_v4();
        let pending = table.register(id, Duration::from_secs(1));
        assert!(table.resolve(id, Ok(7)));
        assert_eq!(pending.wait().await, Ok(7));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_reply_ignored() {
        let table = RequestTable::<u32>::new();
        assert!(!table.resolve(Uuid::new_v4(), Ok(1)));
    }

    #[tokio::test]
    async fn test_timeout() {
        let table = RequestTable::<u32>::new();
        let pending = table.register(Uuid::new_v4(), Duration::from_millis(20));
        assert_eq!(
            pending.wait().await,
            Err(CollabError::TimedOut(Duration::from_millis(20)))
        );
    }

    #[tokio::test]
    async fn test_cancel() {
        let table = RequestTable::<u32>::new();
        let pending = table.register(Uuid::new_v4(), Duration::from_secs(5));
        let token = pending.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        assert_eq!(pending.wait().await, Err(CollabError::Cancelled));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let table = RequestTable::<u32>::new();
        let a = table.register(Uuid::new_v4(), Duration::from_secs(5));
        let b = table.register(Uuid::new_v4(), Duration::from_secs(5));
        assert_eq!(table.fail_all(CollabError::Connection("gone".into())), 2);
        assert!(a.wait().await.is_err());
        assert!(matches!(b.wait().await, Err(CollabError::Connection(_))));
    }
}
