//! Call routing: `<domain>/<procedure>` targets and forwarding.
//!
//! The backplane registers one prefix handler per domain.  Every invocation
//! arriving through any of them carries the originally addressed procedure,
//! which is split here into the owning domain and the procedure to call on
//! that domain's session.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

use crate::application::rpc::{Invocation, RpcConnection};

/// Why a proxied invocation could not be forwarded.
///
/// The `Display` strings are what the caller receives as the call error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no procedure specified")]
    NoProcedure,
    #[error("no domain specified")]
    NoDomain,
    #[error("target domain is unknown")]
    UnknownDomain,
    #[error("too many forwarded calls in flight")]
    Busy,
}

/// Splits a call target into `(domain, procedure)` at the first `/`.
///
/// Both halves must be non-empty.  Only the first `/` separates, so
/// `"alpha/math/add"` routes `"math/add"` to `alpha`.
///
/// # Errors
///
/// - [`RouteError::NoProcedure`] when the router did not disclose the target.
/// - [`RouteError::NoDomain`] when the target has no usable domain part.
pub fn parse_target(procedure: Option<&str>) -> Result<(&str, &str), RouteError> {
    let procedure = procedure.ok_or(RouteError::NoProcedure)?;
    match procedure.split_once('/') {
        Some((domain, rest)) if !domain.is_empty() && !rest.is_empty() => Ok((domain, rest)),
        _ => Err(RouteError::NoDomain),
    }
}

/// Calls `procedure` on `target` and completes `invocation` with the outcome.
///
/// The result is passed back unmodified; a failure is passed back as its
/// message.  The permit is released before the caller is answered.
pub async fn forward_call(
    permit: OwnedSemaphorePermit,
    target: Arc<dyn RpcConnection>,
    procedure: String,
    mut invocation: Invocation,
) {
    let (args, kwargs) = invocation.take_arguments();
    let outcome = target.call(&procedure, args, kwargs).await;
    drop(permit);
    match outcome {
        Ok(result) => invocation.result(result),
        Err(e) => {
            debug!(%procedure, error = %e, "forwarded call failed");
            invocation.error(e.to_string());
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::rpc::{CallResult, KwArgs};
    use crate::infrastructure::rpc::mock::MockConnection;
    use serde_json::json;
    use tokio::sync::Semaphore;

    #[test]
    fn test_parse_target_splits_at_first_slash() {
        assert_eq!(parse_target(Some("alpha/add")), Ok(("alpha", "add")));
        assert_eq!(parse_target(Some("alpha/math/add")), Ok(("alpha", "math/add")));
    }

    #[test]
    fn test_parse_target_without_procedure_metadata() {
        assert_eq!(parse_target(None), Err(RouteError::NoProcedure));
    }

    #[test]
    fn test_parse_target_rejects_missing_or_empty_components() {
        for target in ["justaname", "", "/add", "alpha/", "/"] {
            assert_eq!(parse_target(Some(target)), Err(RouteError::NoDomain), "target {target:?}");
        }
    }

    #[test]
    fn test_route_error_messages() {
        assert_eq!(RouteError::NoProcedure.to_string(), "no procedure specified");
        assert_eq!(RouteError::NoDomain.to_string(), "no domain specified");
        assert_eq!(RouteError::UnknownDomain.to_string(), "target domain is unknown");
        assert_eq!(RouteError::Busy.to_string(), "too many forwarded calls in flight");
    }

    #[tokio::test]
    async fn test_forward_call_returns_result_unmodified() {
        // Arrange
        let target = Arc::new(MockConnection::new("alpha"));
        let expected = CallResult {
            args: vec![json!(800)],
            kwargs: KwArgs::new(),
        };
        target.respond_with("add", Ok(expected.clone()));
        let permit = Arc::new(Semaphore::new(1)).try_acquire_owned().unwrap();
        let (inv, rx) = Invocation::new(
            Some("alpha/add".to_string()),
            vec![json!(23), json!(777)],
            KwArgs::new(),
        );

        // Act
        forward_call(permit, target.clone(), "add".to_string(), inv).await;

        // Assert
        assert_eq!(rx.await.unwrap(), Ok(expected));
        let calls = target.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].procedure, "add");
        assert_eq!(calls[0].args, vec![json!(23), json!(777)]);
    }

    #[tokio::test]
    async fn test_forward_call_passes_remote_error_message_back() {
        // Arrange
        let target = Arc::new(MockConnection::new("alpha"));
        target.respond_with("div", Err("division by zero".to_string()));
        let permit = Arc::new(Semaphore::new(1)).try_acquire_owned().unwrap();
        let (inv, rx) = Invocation::new(Some("alpha/div".to_string()), vec![], KwArgs::new());

        // Act
        forward_call(permit, target, "div".to_string(), inv).await;

        // Assert
        assert_eq!(rx.await.unwrap(), Err("division by zero".to_string()));
    }

    #[tokio::test]
    async fn test_forward_call_releases_permit_when_done() {
        // Arrange
        let target = Arc::new(MockConnection::new("alpha"));
        let limit = Arc::new(Semaphore::new(1));
        let permit = limit.clone().try_acquire_owned().unwrap();
        let (inv, _rx) = Invocation::new(Some("alpha/x".to_string()), vec![], KwArgs::new());
        assert_eq!(limit.available_permits(), 0);

        // Act
        forward_call(permit, target, "x".to_string(), inv).await;

        // Assert
        assert_eq!(limit.available_permits(), 1);
    }
}
