use std::sync::Arc;

use tokio::sync::watch;

use crate::message::Credentials;

/// Process-local holder of the platform credentials.
///
/// Writers replace the whole value, so readers never observe half of an
/// update. Cloning yields another handle to the same store.
#[derive(Clone, Debug)]
pub struct CredentialStore {
    tx: Arc<watch::Sender<Credentials>>,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore {
    /// An empty store; `is_ready()` is false until credentials arrive.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Credentials::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn with_credentials(creds: Credentials) -> Self {
        let store = Self::new();
        store.replace(creds);
        store
    }

    /// Copy of the current credentials.
    pub fn snapshot(&self) -> Credentials {
        self.tx.borrow().clone()
    }

    /// Unconditional overwrite. Returns `true` if the value changed, so a
    /// repeated identical update is observable as a no-op.
    pub fn replace(&self, creds: Credentials) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == creds {
                false
            } else {
                *current = creds;
                true
            }
        })
    }

    /// Token and worker id are both non-empty.
    pub fn is_ready(&self) -> bool {
        self.tx.borrow().is_complete()
    }

    pub fn subscribe(&self) -> watch::Receiver<Credentials> {
        self.tx.subscribe()
    }

    /// Resolves once the store holds complete credentials.
    pub async fn wait_ready(&self) -> Credentials {
        let mut rx = self.subscribe();
        match rx.wait_for(Credentials::is_complete).await {
            Ok(creds) => creds.clone(),
            // the sender lives in `self`, so it cannot be dropped while we wait
            Err(_) => self.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn empty_store_is_not_ready() {
        let store = CredentialStore::new();
        assert!(!store.is_ready());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn half_filled_credentials_are_not_ready() {
        let store = CredentialStore::with_credentials(Credentials::new("t1", ""));
        assert!(!store.is_ready());
    }

    #[test]
    fn replace_is_idempotent() {
        let store = CredentialStore::new();
        assert!(store.replace(Credentials::new("t1", "w1")));
        assert!(!store.replace(Credentials::new("t1", "w1")));
        assert_eq!(store.snapshot(), Credentials::new("t1", "w1"));
        assert!(store.is_ready());
    }

    #[test]
    fn clones_share_state() {
        let a = CredentialStore::new();
        let b = a.clone();
        a.replace(Credentials::new("t2", "w2"));
        assert_eq!(b.snapshot().auth_token, "t2");
    }

    #[tokio::test]
    async fn wait_ready_resolves_after_update() {
        let store = CredentialStore::new();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_ready().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.replace(Credentials::new("t3", "w3"));
        let creds = waiter.await.unwrap();
        assert_eq!(creds.worker_id, "w3");
    }
}
