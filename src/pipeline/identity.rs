//! Request identity (user-agent) selection.
//!
//! The fetcher asks its [`IdentityProvider`] once per attempt. Rotating the
//! user-agent between retries makes a run look less like a single scripted
//! client to fingerprint-based blockers; tests plug in [`FixedIdentity`] to
//! keep requests deterministic.

use rand::seq::SliceRandom;
use std::sync::Arc;

/// Browser user-agents the rotating provider picks from.
pub const BROWSER_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:124.0) Gecko/20100101 Firefox/124.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.2478.51",
];

/// Supplies the user-agent for one request attempt.
pub trait IdentityProvider: Send + Sync {
    /// `attempt` is 1-based and counts every request made for the page,
    /// including rate-limit retries.
    fn user_agent(&self, attempt: u32) -> String;
}

/// Uniformly random pick from [`BROWSER_USER_AGENTS`] on every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct RotatingUserAgents;

impl IdentityProvider for RotatingUserAgents {
    fn user_agent(&self, _attempt: u32) -> String {
        BROWSER_USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(BROWSER_USER_AGENTS[0])
            .to_string()
    }
}

/// Always the same user-agent.
#[derive(Debug, Clone)]
pub struct FixedIdentity(pub String);

impl IdentityProvider for FixedIdentity {
    fn user_agent(&self, _attempt: u32) -> String {
        self.0.clone()
    }
}

/// Provider for a run: fixed when the user pinned a user-agent, rotating
/// otherwise.
pub fn identity_for(user_agent: Option<&str>) -> Arc<dyn IdentityProvider> {
    match user_agent {
        Some(ua) => Arc::new(FixedIdentity(ua.to_string())),
        None => Arc::new(RotatingUserAgents),
    }
}
