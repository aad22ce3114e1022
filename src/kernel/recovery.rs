//! Panic isolation for handler and subscriber tasks.
//!
//! A panicking topic subscriber, host handler or orchestrated computation must
//! surface as an error on its own task and leave the rest of the host running.

use crate::types::{Error, Result};
use futures::FutureExt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Execute a function with panic recovery.
///
/// # Example
/// ```
/// use switchyard::kernel::with_recovery;
///
/// let result = with_recovery(|| Ok(7), "compute");
/// assert_eq!(result.unwrap(), 7);
/// ```
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(panic_payload) => Err(panic_error(operation_name, &panic_payload)),
    }
}

/// Await a future, converting a panic during any poll into `Error::Internal`.
pub async fn recover_async<Fut, T>(future: Fut, operation_name: &str) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic_payload) => Err(panic_error(operation_name, &panic_payload)),
    }
}

fn panic_error(operation_name: &str, payload: &Box<dyn std::any::Any + Send>) -> Error {
    let panic_msg = extract_panic_message(payload);
    tracing::error!(
        operation = operation_name,
        panic = %panic_msg,
        "panic_recovered"
    );
    Error::internal(format!("panic in {}: {}", operation_name, panic_msg))
}

/// Extract panic message from panic payload.
fn extract_panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic (no message)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_recovery_success() {
        assert_eq!(with_recovery(|| Ok(42), "op").unwrap(), 42);
    }

    #[test]
    fn test_with_recovery_error_passes_through() {
        let result: Result<()> = with_recovery(|| Err(Error::validation("bad")), "op");
        assert_eq!(result.unwrap_err(), Error::validation("bad"));
    }

    #[test]
    #[allow(clippy::panic)]
    fn test_with_recovery_catches_panic() {
        let result: Result<()> = with_recovery(|| panic!("boom"), "explode");
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(err.to_string().contains("explode"));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    #[allow(clippy::panic)]
    async fn test_recover_async_catches_panic_after_await() {
        let result: Result<u32> = recover_async(
            async {
                tokio::task::yield_now().await;
                let fail = true;
                if fail {
                    panic!("late {}", "boom");
                }
                Ok(1)
            },
            "subscriber",
        )
        .await;
        assert!(result.unwrap_err().to_string().contains("late boom"));
    }

    #[tokio::test]
    async fn test_recover_async_success() {
        let result = recover_async(async { Ok::<_, Error>("ok") }, "op").await;
        assert_eq!(result.unwrap(), "ok");
    }
}
