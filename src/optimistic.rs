//! Optimistic local mutations.
//!
//! Apply a change locally so the UI sees it at once, push it to the
//! dashboard, and undo the local change if the push fails.

use std::future::Future;
use tracing::warn;

pub struct OptimisticAction<A, R> {
    label: &'static str,
    apply: A,
    revert: R,
}

impl<A, R, T, E> OptimisticAction<A, R>
where
    A: FnOnce() -> Result<T, E>,
    R: FnOnce(T) -> Result<(), E>,
    E: std::fmt::Display,
{
    /// `apply` returns whatever `revert` needs to restore the old state.
    pub fn new(label: &'static str, apply: A, revert: R) -> Self {
        Self { label, apply, revert }
    }

    /// Run the local mutation, then `remote`. On remote failure the mutation
    /// is reverted and the remote error returned. A failed revert is logged;
    /// the remote error still wins.
    pub async fn run<F, V>(self, remote: F) -> Result<V, E>
    where
        F: Future<Output = Result<V, E>>,
    {
        let undo = (self.apply)()?;
        match remote.await {
            Ok(value) => Ok(value),
            Err(remote_err) => {
                if let Err(revert_err) = (self.revert)(undo) {
                    warn!(
                        action = self.label,
                        error = %revert_err,
                        "Failed to revert optimistic update"
                    );
                }
                Err(remote_err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[tokio::test]
    async fn keeps_change_on_success() {
        let favorites = RefCell::new(vec!["margherita".to_string()]);

        let result = OptimisticAction::new(
            "add_favorite",
            || {
                favorites.borrow_mut().push("diavola".into());
                Ok::<_, String>(favorites.borrow().len() - 1)
            },
            |idx| {
                favorites.borrow_mut().remove(idx);
                Ok(())
            },
        )
        .run(async { Ok::<_, String>("saved") })
        .await;

        assert_eq!(result.unwrap(), "saved");
        assert_eq!(favorites.borrow().len(), 2);
    }

    #[tokio::test]
    async fn reverts_on_remote_failure() {
        let favorites = RefCell::new(vec!["margherita".to_string()]);

        let result: Result<(), String> = OptimisticAction::new(
            "add_favorite",
            || {
                favorites.borrow_mut().push("diavola".into());
                Ok(favorites.borrow().len() - 1)
            },
            |idx| {
                favorites.borrow_mut().remove(idx);
                Ok(())
            },
        )
        .run(async { Err("Cannot reach admin dashboard".to_string()) })
        .await;

        assert_eq!(result.unwrap_err(), "Cannot reach admin dashboard");
        assert_eq!(*favorites.borrow(), vec!["margherita".to_string()]);
    }

    #[tokio::test]
    async fn failed_apply_skips_remote() {
        let mut called = false;
        let result: Result<(), String> = OptimisticAction::new(
            "noop",
            || Err::<(), _>("locked".to_string()),
            |_| Ok(()),
        )
        .run(async {
            called = true;
            Ok(())
        })
        .await;

        assert!(result.is_err());
        assert!(!called);
    }
}
