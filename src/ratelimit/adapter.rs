//! Call conventions for request handlers.
//!
//! `enforce` turns a denial into an error so handlers can bail out with `?`.
//! `respond` turns a denial into a ready-made "too many requests" response and
//! leaves the allowed path to the caller.

use super::clock::Clock;
use super::limiter::{Decision, RateLimiter};
use super::window::WindowStore;
use crate::error::{Result, WindowgateError};

/// HTTP status code for rate-limited responses.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Header carrying the retry delay in seconds.
pub const RETRY_AFTER_HEADER: &str = "Retry-After";
/// Header carrying the policy ceiling.
pub const LIMIT_HEADER: &str = "X-RateLimit-Limit";
/// Header carrying the admissions left in the window.
pub const REMAINING_HEADER: &str = "X-RateLimit-Remaining";

/// A standard rate-limit-exceeded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TooManyRequests {
    /// Always 429
    pub status: u16,
    /// Seconds before the next attempt is expected to succeed
    pub retry_after: u64,
    /// Denial message of the policy that rejected the request
    pub message: String,
}

impl TooManyRequests {
    pub fn new(message: impl Into<String>, retry_after: u64) -> Self {
        Self {
            status: TOO_MANY_REQUESTS,
            retry_after,
            message: message.into(),
        }
    }

    /// Response headers, `Retry-After` first.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![(RETRY_AFTER_HEADER, self.retry_after.to_string())]
    }

    /// JSON response body.
    pub fn body(&self) -> String {
        serde_json::json!({
            "error": self.message,
            "retry_after": self.retry_after,
        })
        .to_string()
    }
}

impl WindowgateError {
    /// The 429 response for a rate limit denial, `None` for any other error.
    pub fn to_response(&self) -> Option<TooManyRequests> {
        match self {
            WindowgateError::RateLimitExceeded {
                message,
                retry_after,
                ..
            } => Some(TooManyRequests::new(message.clone(), *retry_after)),
            _ => None,
        }
    }
}

impl Decision {
    /// Informational rate limit headers for this decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (LIMIT_HEADER, self.limit.to_string()),
            (REMAINING_HEADER, self.remaining.to_string()),
        ];
        if !self.allowed {
            headers.push((RETRY_AFTER_HEADER, self.retry_after.to_string()));
        }
        headers
    }
}

impl<C: Clock, S: WindowStore> RateLimiter<C, S> {
    /// Check the policy and fail with `RateLimitExceeded` when denied.
    pub fn enforce(&self, identifier: &str, policy_name: &str) -> Result<Decision> {
        let policy = self.registry().get(policy_name)?;
        let decision = self.check_policy(identifier, &policy);

        if decision.allowed {
            Ok(decision)
        } else {
            Err(WindowgateError::RateLimitExceeded {
                policy: policy.name().to_string(),
                message: policy.denial_message().to_string(),
                retry_after: decision.retry_after,
            })
        }
    }

    /// Check the policy and build a 429 response when denied.
    ///
    /// Returns `Ok(None)` when the request is admitted.
    pub fn respond(
        &self,
        identifier: &str,
        policy_name: &str,
    ) -> Result<Option<TooManyRequests>> {
        let policy = self.registry().get(policy_name)?;
        let decision = self.check_policy(identifier, &policy);

        if decision.allowed {
            return Ok(None);
        }
        Ok(Some(TooManyRequests::new(
            policy.denial_message(),
            decision.retry_after,
        )))
    }
}
