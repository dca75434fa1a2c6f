//! Scripted test doubles for the driver and approval boundaries.
//!
//! Both doubles are cheap to clone and share their script, so a test can
//! hand one clone to the scheduler and inspect the other afterwards.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::approval::{ApprovalDecision, Approver};
use crate::driver::{DriverRequest, DriverResponse, RoleDriver};
use crate::error::{Result, TetradError};
use crate::policy::Verdict;
use crate::tools::ActionRequest;

/// One scripted driver turn.
#[derive(Debug, Clone)]
pub enum Scripted {
    Respond(DriverResponse),
    /// Fail the turn as a malformed response.
    Fail(String),
    /// Sleep before answering; long enough delays trip the deadline.
    Delay(Duration, DriverResponse),
}

#[derive(Debug, Default)]
struct DriverScript {
    turns: VecDeque<Scripted>,
    fallback: Option<DriverResponse>,
    requests: Vec<DriverRequest>,
}

/// Driver that replays a fixed script of turns.
///
/// # Example
///
/// ```rust,ignore
/// let driver = ScriptedDriver::new()
///     .respond(DriverResponse::approve())
///     .fail("garbled")
///     .respond(DriverResponse::reject());
///
/// let drivers = DriverSet::new().with_default(Arc::new(driver.clone()));
/// ```
///
/// Once the script runs dry every turn fails, unless a fallback was set
/// with [`ScriptedDriver::always_approve`] or [`ScriptedDriver::otherwise`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedDriver {
    script: Arc<Mutex<DriverScript>>,
}

impl ScriptedDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A driver that approves every turn.
    #[must_use]
    pub fn always_approve() -> Self {
        Self::new().otherwise(DriverResponse::approve())
    }

    #[must_use]
    pub fn respond(self, response: DriverResponse) -> Self {
        self.push(Scripted::Respond(response))
    }

    #[must_use]
    pub fn fail(self, error: impl Into<String>) -> Self {
        self.push(Scripted::Fail(error.into()))
    }

    #[must_use]
    pub fn delay(self, delay: Duration, response: DriverResponse) -> Self {
        self.push(Scripted::Delay(delay, response))
    }

    /// Response used once the script is exhausted.
    #[must_use]
    pub fn otherwise(self, response: DriverResponse) -> Self {
        self.lock().fallback = Some(response);
        self
    }

    #[must_use]
    pub fn push(self, turn: Scripted) -> Self {
        self.lock().turns.push_back(turn);
        self
    }

    /// Number of turns taken so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.lock().requests.len()
    }

    /// Every request received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<DriverRequest> {
        self.lock().requests.clone()
    }

    /// Turns still queued.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.lock().turns.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DriverScript> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RoleDriver for ScriptedDriver {
    async fn invoke(&self, request: DriverRequest) -> Result<DriverResponse> {
        let role = request.role;
        let turn = {
            let mut script = self.lock();
            script.requests.push(request);
            script
                .turns
                .pop_front()
                .or_else(|| script.fallback.clone().map(Scripted::Respond))
        };

        match turn {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(error)) => Err(TetradError::malformed(role, error)),
            Some(Scripted::Delay(delay, response)) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            None => Err(TetradError::driver(role, "script exhausted")),
        }
    }
}

/// Approver that replays a fixed list of decisions, then defers.
#[derive(Debug, Clone, Default)]
pub struct ScriptedApprover {
    decisions: Arc<Mutex<VecDeque<ApprovalDecision>>>,
    asked: Arc<Mutex<Vec<String>>>,
}

impl ScriptedApprover {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn approve(self) -> Self {
        self.then(ApprovalDecision::Approve)
    }

    #[must_use]
    pub fn deny(self, reason: impl Into<String>) -> Self {
        self.then(ApprovalDecision::deny(reason))
    }

    #[must_use]
    pub fn then(self, decision: ApprovalDecision) -> Self {
        self.decisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(decision);
        self
    }

    /// Number of times a decision was requested.
    #[must_use]
    pub fn asked(&self) -> usize {
        self.asked.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Descriptions of the actions a decision was requested for.
    #[must_use]
    pub fn questions(&self) -> Vec<String> {
        self.asked.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Approver for ScriptedApprover {
    async fn decide(&self, _task_id: &str, request: &ActionRequest, _verdict: &Verdict) -> ApprovalDecision {
        self.asked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.action.describe());
        self.decisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(ApprovalDecision::Defer)
    }
}
