//! Rotating credential provider
//!
//! Passwords are tried front to back. Advancing moves a cursor but never drops
//! earlier entries, so a rotation in progress does not break sessions that
//! authenticated with an older password.

use parking_lot::Mutex;

/// Source of login passwords for one host
pub trait CredentialProvider: Send + Sync {
    /// Current candidate password, if any remain
    fn peek(&self) -> Option<String>;

    /// Move to the next candidate. Returns false when none are left.
    fn advance(&self) -> bool;

    /// Append a new password at the back of the queue
    fn push(&self, password: String);

    /// Go back to the first password
    fn rewind(&self);
}

#[derive(Debug, Default)]
struct CredentialQueue {
    passwords: Vec<String>,
    cursor: usize,
}

/// Default [`CredentialProvider`] backed by an in-memory queue
#[derive(Debug, Default)]
pub struct RotatingCredentials {
    inner: Mutex<CredentialQueue>,
}

impl RotatingCredentials {
    pub fn new(passwords: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: Mutex::new(CredentialQueue {
                passwords: passwords.into_iter().collect(),
                cursor: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().passwords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CredentialProvider for RotatingCredentials {
    fn peek(&self) -> Option<String> {
        let queue = self.inner.lock();
        queue.passwords.get(queue.cursor).cloned()
    }

    fn advance(&self) -> bool {
        let mut queue = self.inner.lock();
        if queue.cursor < queue.passwords.len() {
            queue.cursor += 1;
        }
        queue.cursor < queue.passwords.len()
    }

    fn push(&self, password: String) {
        self.inner.lock().passwords.push(password);
    }

    fn rewind(&self) {
        self.inner.lock().cursor = 0;
    }
}
