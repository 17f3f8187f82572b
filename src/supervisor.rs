// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! Watches a single broker connection for its close notification. When the
//! closure is significant (an actionable broker code, or a clean closure while
//! the consumer is already known to be unhealthy) the supervisor runs the
//! injected `Recoverer` until it succeeds. It never re-arms: every new
//! connection gets its own supervisor.

use crate::{
    backoff::RetryPolicy,
    classifier::classify,
    connection::{CloseNotice, CloseSignal},
    errors::AmqpError,
};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{task::JoinHandle, time::sleep};
use tracing::{error, info, warn};

/// Re-establishes consumer state after a disruptive closure.
///
/// Implementations must be idempotent, the supervisor calls `recover` again after
/// every failure.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Recoverer: Send + Sync {
    async fn recover(&self) -> Result<(), AmqpError>;
}

/// Shared view of whether the consumer channel is believed healthy.
///
/// Starts healthy. The dispatch loop marks it lost when its delivery stream
/// breaks and a successful consumer registration marks it active again.
#[derive(Debug, Clone)]
pub struct ConsumerHealth {
    active: Arc<AtomicBool>,
}

impl Default for ConsumerHealth {
    fn default() -> Self {
        ConsumerHealth {
            active: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl ConsumerHealth {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn mark_active(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn mark_lost(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// How a supervisor task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// The closure did not warrant a recovery.
    Ignored,
    /// The recoverer succeeded after `attempts` calls.
    Recovered { attempts: u32 },
}

pub struct ConnectionSupervisor {
    recoverer: Arc<dyn Recoverer>,
    health: ConsumerHealth,
    policy: RetryPolicy,
}

impl ConnectionSupervisor {
    /// Creates a supervisor with the recovery policy.
    ///
    /// # Parameters
    /// * `recoverer` - Re-establishes consumer state, called until it succeeds
    /// * `health` - Decides whether a closure without error needs recovery
    pub fn new(recoverer: Arc<dyn Recoverer>, health: ConsumerHealth) -> Self {
        ConnectionSupervisor {
            recoverer,
            health,
            policy: RetryPolicy::recovery(),
        }
    }

    /// Overrides the delays applied between failed recoveries.
    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Runs the supervisor as a background task.
    pub fn spawn(self, signal: CloseSignal) -> JoinHandle<SupervisorOutcome> {
        tokio::spawn(self.supervise(signal))
    }

    /// Waits for the closure, classifies it and recovers when needed.
    ///
    /// # Returns
    /// `SupervisorOutcome::Ignored` for closures that need no recovery,
    /// otherwise the number of recovery attempts it took.
    pub async fn supervise(self, signal: CloseSignal) -> SupervisorOutcome {
        // A notifier dropped without firing means the connection went away quietly.
        let notice = signal.await.unwrap_or(None);

        if !self.is_significant(notice.as_ref()) {
            info!("connection closure does not require recovery");
            return SupervisorOutcome::Ignored;
        }

        let attempts = self.recover_until_success().await;
        SupervisorOutcome::Recovered { attempts }
    }

    fn is_significant(&self, notice: Option<&CloseNotice>) -> bool {
        match notice {
            Some(notice) => {
                let class = classify(notice.code);
                let err = AmqpError::from(notice);
                error!(error = err.to_string(), class = ?class, "rmq connection closed");
                class.is_actionable()
            }
            None => {
                let active = self.health.is_active();
                warn!(consumer_active = active, "rabbitmq connection closed, no error reported");
                !active
            }
        }
    }

    async fn recover_until_success(&self) -> u32 {
        let mut delays = self.policy.delays();
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.recoverer.recover().await {
                Ok(()) => {
                    info!(attempts, "rmq consumers restored");
                    return attempts;
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        attempt = attempts,
                        "failed to restore rmq consumers"
                    );
                }
            }

            if let Some(delay) = delays.next() {
                sleep(delay).await;
            }
        }
    }
}
