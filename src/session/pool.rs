//! Round-robin pool of sessions, one per credential.
//!
//! Each session logs in lazily, the first time it is handed out. Logins for
//! the same credential are serialized so concurrent `acquire` calls never log
//! in twice.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{Credential, RestSession, Session, SessionSettings};
use crate::error::StreamError;

struct PoolEntry {
    credential: Credential,
    session: RestSession,
    login_lock: Mutex<()>,
}

/// Sessions handed out in round-robin order over a list of credentials.
pub struct SessionPool {
    entries: Vec<PoolEntry>,
    next: AtomicUsize,
}

impl SessionPool {
    /// Creates a pool with one logged-out session per credential.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Internal` if an HTTP client fails to initialize.
    pub fn new(credentials: Vec<Credential>, settings: &SessionSettings) -> Result<Self, StreamError> {
        let entries = credentials
            .into_iter()
            .map(|credential| -> Result<PoolEntry, StreamError> {
                let mut entry_settings = settings.clone();
                if let Some(login_url) = &credential.login_url {
                    entry_settings.login_url = login_url.clone();
                }
                Ok(PoolEntry {
                    credential,
                    session: RestSession::new(entry_settings)?,
                    login_lock: Mutex::new(()),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!("[POOL] Created pool with {} credential(s)", entries.len());
        Ok(Self {
            entries,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the next session in rotation, logging it in if needed.
    ///
    /// # Errors
    ///
    /// - `StreamError::NoCredentials` - The pool is empty
    /// - Any login error of the selected credential
    pub async fn acquire(&self) -> Result<RestSession, StreamError> {
        if self.entries.is_empty() {
            return Err(StreamError::NoCredentials);
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.entries.len();
        let entry = &self.entries[index];

        let _guard = entry.login_lock.lock().await;
        if !entry.session.is_logged_in().await {
            info!("[POOL] Logging in session {}", index);
            entry
                .session
                .login(&entry.credential.username, &entry.credential.password)
                .await?;
        }

        Ok(entry.session.clone())
    }

    /// Logs out every logged-in session.
    ///
    /// Every session is attempted; the first failure is returned.
    pub async fn logout_all(&self) -> Result<(), StreamError> {
        let mut first_error = None;
        for (index, entry) in self.entries.iter().enumerate() {
            let _guard = entry.login_lock.lock().await;
            if let Err(e) = entry.session.logout().await {
                warn!("[POOL] Logout of session {} failed: {}", index, e);
                first_error.get_or_insert(e);
            }
        }
        info!("[POOL] All sessions logged out");
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let usernames: Vec<&str> = self
            .entries
            .iter()
            .map(|e| e.credential.username.as_str())
            .collect();
        f.debug_struct("SessionPool")
            .field("usernames", &usernames)
            .finish_non_exhaustive()
    }
}
