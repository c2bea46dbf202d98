//! One-shot watchdog armed around a single sandbox call.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lambda_common::RequestContext;
use tokio::task::JoinHandle;
use tracing::warn;

/// Resolve the timeout for one request from the global limit and the
/// per-function override (`<= 0` on either side means unset):
///
/// - global unset: the override decides (possibly "no deadline");
/// - override unset: the global limit applies;
/// - both set: the stricter of the two.
pub(crate) fn effective_timeout_ms(default_ms: i64, override_ms: i64) -> i64 {
    if default_ms <= 0 {
        override_ms
    } else if override_ms <= 0 {
        default_ms
    } else {
        override_ms.min(default_ms)
    }
}

pub(crate) fn is_finite_timeout(ms: i64) -> bool {
    ms > 0
}

#[derive(Debug, Default)]
struct BrokerState {
    fired: bool,
    disarmed: bool,
}

/// Suicide timer for an in-flight request. If the timer wins the race it
/// cancels the request context and records that it fired; if `disarm` wins,
/// the timer is stopped and never observes the request. The mutex guarantees
/// exactly one side wins, so the cancel handle runs at most once.
#[derive(Debug)]
pub(crate) struct TimeoutBroker {
    state: Arc<Mutex<BrokerState>>,
    timer: JoinHandle<()>,
}

impl TimeoutBroker {
    /// `sandbox_id` labels the warning if the timer fires.
    pub(crate) fn arm(
        duration: Duration,
        context: Arc<RequestContext>,
        sandbox_id: String,
    ) -> Self {
        let state = Arc::new(Mutex::new(BrokerState::default()));
        let timer = tokio::spawn({
            let state = state.clone();
            async move {
                tokio::time::sleep(duration).await;
                Self::fire(&state, &context, &sandbox_id);
            }
        });
        Self { state, timer }
    }

    fn fire(state: &Mutex<BrokerState>, context: &RequestContext, sandbox_id: &str) {
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        if state.disarmed {
            return;
        }
        state.disarmed = true;
        state.fired = true;
        warn!(
            "lambda instance sandbox {} timed out; cancelling its request",
            sandbox_id
        );
        context.cancel();
    }

    /// Called when the request returns normally. Idempotent.
    pub(crate) fn disarm(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.disarmed = true;
        drop(state);
        self.timer.abort();
    }

    /// Whether the timer won the race. Read this only after `disarm`.
    pub(crate) fn fired(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).fired
    }
}
