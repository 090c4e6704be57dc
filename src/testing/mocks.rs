//! Scripted oracles.
//!
//! These doubles stand in for the validation and fix oracles so sessions
//! can be driven deterministically.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::error::FixloopError;
use crate::oracle::{FixOracle, FixRequest};
use crate::validation::{PassOutcome, ValidationOracle, ValidationPass};

type PassScript = Box<dyn Fn(&Path, ValidationPass) -> PassOutcome + Send + Sync>;
type FailureScript = Box<dyn Fn(ValidationPass) -> Option<FixloopError> + Send + Sync>;

/// Validation oracle answering from a closure.
///
/// # Example
///
/// ```rust,ignore
/// let oracle = ScriptedValidationOracle::new(|sub_root, pass| match pass {
///     ValidationPass::TypeCheck if !sub_root.join("src/a.ts").exists() => {
///         PassOutcome::failed(["src/b.ts(1,1): error TS2307: Cannot find module './a'."])
///     }
///     _ => PassOutcome::passed(),
/// });
/// ```
pub struct ScriptedValidationOracle {
    script: PassScript,
    failures: Option<FailureScript>,
    calls: Mutex<HashMap<ValidationPass, u32>>,
}

impl ScriptedValidationOracle {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&Path, ValidationPass) -> PassOutcome + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            failures: None,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Every pass succeeds.
    #[must_use]
    pub fn clean() -> Self {
        Self::new(|_, _| PassOutcome::passed())
    }

    /// Passes for which the closure returns an error fail with it; the rest
    /// succeed.
    pub fn failing<F>(failures: F) -> Self
    where
        F: Fn(ValidationPass) -> Option<FixloopError> + Send + Sync + 'static,
    {
        let mut oracle = Self::clean();
        oracle.failures = Some(Box::new(failures));
        oracle
    }

    /// Number of times a pass ran.
    #[must_use]
    pub fn calls(&self, pass: ValidationPass) -> u32 {
        self.calls
            .lock()
            .map(|calls| calls.get(&pass).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl ValidationOracle for ScriptedValidationOracle {
    async fn run_pass(&self, sub_root: &Path, pass: ValidationPass) -> Result<PassOutcome> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(pass).or_insert(0) += 1;
        }
        if let Some(err) = self.failures.as_ref().and_then(|f| f(pass)) {
            return Err(err.into());
        }
        Ok((self.script)(sub_root, pass))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

type Responder = Box<dyn Fn(&FixRequest) -> String + Send + Sync>;

/// Fix oracle with queued or computed responses.
///
/// Queued responses are used first, then the responder, then the default
/// response.
pub struct MockFixOracle {
    queue: Mutex<VecDeque<String>>,
    responder: Option<Responder>,
    default_response: String,
    error: Option<String>,
    call_count: AtomicU32,
    requests: Mutex<Vec<FixRequest>>,
}

impl Default for MockFixOracle {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            responder: None,
            default_response: String::new(),
            error: None,
            call_count: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl MockFixOracle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Oracle that always reports it cannot fix anything.
    #[must_use]
    pub fn always_failing() -> Self {
        Self::new().with_default_response(r#"{"success": false, "explanation": "cannot fix"}"#)
    }

    /// Queue a response.
    #[must_use]
    pub fn with_response(self, response: &str) -> Self {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(response.to_string());
        }
        self
    }

    /// Response used once the queue is empty.
    #[must_use]
    pub fn with_default_response(mut self, response: &str) -> Self {
        self.default_response = response.to_string();
        self
    }

    /// Compute responses from requests.
    #[must_use]
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&FixRequest) -> String + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Fail every call with this message.
    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    #[must_use]
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<FixRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl FixOracle for MockFixOracle {
    async fn invoke(&self, request: &FixRequest) -> Result<String> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if let Some(error) = &self.error {
            bail!("{}", error);
        }
        if let Some(queued) = self.queue.lock().ok().and_then(|mut q| q.pop_front()) {
            return Ok(queued);
        }
        if let Some(responder) = &self.responder {
            return Ok(responder(request));
        }
        Ok(self.default_response.clone())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::FixScope;

    fn request() -> FixRequest {
        FixRequest {
            error_summary: String::new(),
            local_code: String::new(),
            context: String::new(),
            manifest_context: String::new(),
            scope: FixScope::File {
                path: "a.ts".to_string(),
            },
            clarification: None,
        }
    }

    #[tokio::test]
    async fn test_mock_fix_oracle_order() {
        let oracle = MockFixOracle::new()
            .with_response("first")
            .with_responder(|req| format!("computed {}", req.scope.path()))
            .with_default_response("unused");
        assert_eq!(oracle.invoke(&request()).await.unwrap(), "first");
        assert_eq!(oracle.invoke(&request()).await.unwrap(), "computed a.ts");
        assert_eq!(oracle.call_count(), 2);
        assert_eq!(oracle.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_scripted_validation_counts_calls() {
        let oracle = ScriptedValidationOracle::clean();
        oracle.run_pass(Path::new("."), ValidationPass::Lint).await.unwrap();
        oracle.run_pass(Path::new("."), ValidationPass::Lint).await.unwrap();
        assert_eq!(oracle.calls(ValidationPass::Lint), 2);
        assert_eq!(oracle.calls(ValidationPass::Test), 0);
    }
}
