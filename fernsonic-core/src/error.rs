//! Error types for Fernsonic.

use std::cell::RefCell;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid handle")]
    InvalidHandle,

    #[error("Handle is of the wrong type: {0}")]
    HandleType(String),

    #[error("Property value has the wrong type: {0}")]
    PropertyType(String),

    #[error("Property value out of range: {0}")]
    Range(String),

    #[error("No such property: {0}")]
    PropertyDoesNotExist(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

thread_local! {
    static LAST_ERROR: RefCell<Option<Error>> = const { RefCell::new(None) };
}

impl Error {
    /// Stores a copy of this error in the calling thread's last-error slot
    /// and returns it, so API boundaries can `return Err(e.record())`.
    pub fn record(self) -> Self {
        LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(self.clone()));
        self
    }
}

/// The most recent error recorded on this thread, if any.
pub fn last_error() -> Option<Error> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// The most recent error message recorded on this thread.
pub fn last_error_message() -> Option<String> {
    last_error().map(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_error_is_thread_local() {
        let _ = Error::InvalidHandle.record();
        assert_eq!(last_error(), Some(Error::InvalidHandle));

        std::thread::spawn(|| {
            assert_eq!(last_error(), None);
        })
        .join()
        .unwrap();
    }
}
