//! Named request/response surface over the lease core.
//!
//! Thin glue for an RPC transport: requests arrive as a tagged structure
//! with typed params, responses carry either a structured result or an
//! error payload whose code discriminates the error taxonomy. The
//! transport's wire encoding is out of scope; anything that can carry
//! serde-serializable values can carry these.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::lease::LeaseStore;
use crate::leadership::{Checker, Claimer, LeadershipError};
use crate::manager::LeaseManagerHandle;
use crate::time::StoreClock;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request", content = "params")]
pub enum Request {
    ClaimLeadership {
        namespace: String,
        holder: String,
        duration_ms: u64,
    },
    LeadershipCheck {
        namespace: String,
        holder: String,
    },
    BlockUntilLeadershipReleased {
        namespace: String,
    },
    ApplicationLeaders,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Ok {
        #[serde(skip_serializing_if = "Value::is_null", default)]
        result: Value,
    },
    Error {
        error: ErrorPayload,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    NotValid,
    ClaimDenied,
    NotLeader,
    BlockCancelled,
    ManagerStopped,
    Contended,
    Unavailable,
}

fn error_response(err: LeadershipError) -> Response {
    let code = match &err {
        LeadershipError::NotValid(_) => ErrorCode::NotValid,
        LeadershipError::ClaimDenied => ErrorCode::ClaimDenied,
        LeadershipError::NotLeader { .. } => ErrorCode::NotLeader,
        LeadershipError::BlockCancelled => ErrorCode::BlockCancelled,
        LeadershipError::ManagerStopped => ErrorCode::ManagerStopped,
        LeadershipError::ExcessiveContention(_) => ErrorCode::Contended,
        LeadershipError::Store(_) | LeadershipError::Clock(_) => ErrorCode::Unavailable,
    };
    Response::Error {
        error: ErrorPayload {
            code,
            message: err.to_string(),
        },
    }
}

fn ok() -> Response {
    Response::Ok { result: Value::Null }
}

/// Dispatches named leadership requests to the core components.
#[derive(Clone)]
pub struct LeadershipFacade {
    claimer: Claimer,
    checker: Checker,
    manager: LeaseManagerHandle,
    leases: LeaseStore,
    clock: Arc<StoreClock>,
}

impl LeadershipFacade {
    pub fn new(
        claimer: Claimer,
        checker: Checker,
        manager: LeaseManagerHandle,
        leases: LeaseStore,
        clock: Arc<StoreClock>,
    ) -> Self {
        Self {
            claimer,
            checker,
            manager,
            leases,
            clock,
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        debug!(?request, "facade request");
        match request {
            Request::ClaimLeadership {
                namespace,
                holder,
                duration_ms,
            } => {
                let duration = Duration::from_millis(duration_ms);
                match self
                    .claimer
                    .claim_leadership(&namespace, &holder, duration)
                    .await
                {
                    Ok(()) => ok(),
                    Err(e) => error_response(e),
                }
            }
            Request::LeadershipCheck { namespace, holder } => {
                // A live token cannot cross a transport boundary, so the
                // facade performs a one-shot check on the caller's behalf.
                let token = self.checker.leadership_check(namespace, holder);
                match token.check(None).await {
                    Ok(()) => ok(),
                    Err(e) => error_response(e),
                }
            }
            Request::BlockUntilLeadershipReleased { namespace } => {
                match self
                    .manager
                    .block_until_leadership_released(&namespace, None)
                    .await
                {
                    Ok(()) => ok(),
                    Err(e) => error_response(e),
                }
            }
            Request::ApplicationLeaders => {
                let now = match self.clock.now().await {
                    Ok(now) => now,
                    Err(e) => return error_response(e.into()),
                };
                match self.leases.application_leaders(now).await {
                    Ok(leaders) => Response::Ok {
                        result: json!(leaders),
                    },
                    Err(e) => error_response(e.into()),
                }
            }
        }
    }
}
