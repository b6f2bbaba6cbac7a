pub mod agent;
pub mod builders;
pub mod client;
pub mod cluster_agent;
pub mod cluster_checks_runner;
pub mod datadog_agent;
pub mod defaults;
pub mod dependencies;
pub mod hash;
pub mod helpers;
pub mod status;

#[cfg(test)]
mod testing;

use std::time::Duration;

use kube::runtime::controller::Action;

/// What a reconciler step asks of the loop once it returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    /// Nothing pending; continue with the next step.
    No,
    /// Stop the pass and run another one right away.
    Now,
    /// Stop the pass and run another one after the delay.
    After(Duration),
}

impl Requeue {
    pub fn is_requested(self) -> bool {
        !matches!(self, Self::No)
    }

    /// Map to a controller action. `No` falls back to the polling period.
    pub fn into_action(self, period: Duration) -> Action {
        match self {
            Self::No => Action::requeue(period),
            Self::Now => Action::requeue(Duration::ZERO),
            Self::After(delay) => Action::requeue(delay),
        }
    }
}
