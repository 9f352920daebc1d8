//! The Job Supervisor: setup-then-run orchestration of the Pump
//! Supervisor, the Route Registry, and the Control API. Setup happens
//! synchronously in `main` before a [`JobSupervisor`] is even built;
//! this type's only job is running the three long-lived futures
//! concurrently and reporting whichever terminates first.

use std::error::Error as StdError;
use std::fmt;

/// One of the three supervised jobs, named so a fatal log line can be
/// traced straight back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobName {
    PumpSupervisor,
    RouteRegistry,
    ControlApi,
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobName::PumpSupervisor => "pump supervisor",
            JobName::RouteRegistry => "route registry",
            JobName::ControlApi => "control api",
        };
        f.write_str(name)
    }
}

/// Which job terminated and why. The engine's own jobs are expected to
/// run forever, so *any* of these three futures resolving is a fatal,
/// process-ending condition.
pub struct Terminated {
    pub job: JobName,
    pub cause: Box<dyn StdError + Send + Sync>,
}

impl fmt::Display for Terminated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} terminated: {}", self.job, self.cause)
    }
}

/// Runs the three supervised jobs concurrently to completion. Returns
/// as soon as the first one does, carrying its name and cause; the
/// other two are dropped (and, for tasks backed by a `JoinHandle`,
/// aborted) at that point, since a single terminated job already means
/// the process is shutting down.
pub async fn run_until_first_terminates(
    pump_supervisor: impl std::future::Future<Output = Result<(), stevedore_core::FatalEngineError>>,
    route_registry: impl std::future::Future<Output = Result<(), stevedore_core::FatalEngineError>>,
    control_api: impl std::future::Future<Output = std::io::Result<()>>,
) -> Terminated {
    tokio::select! {
        result = pump_supervisor => Terminated {
            job: JobName::PumpSupervisor,
            cause: outcome_to_cause(result),
        },
        result = route_registry => Terminated {
            job: JobName::RouteRegistry,
            cause: outcome_to_cause(result),
        },
        result = control_api => Terminated {
            job: JobName::ControlApi,
            cause: outcome_to_cause(result),
        },
    }
}

fn outcome_to_cause<E: StdError + Send + Sync + 'static>(result: Result<(), E>) -> Box<dyn StdError + Send + Sync> {
    match result {
        Ok(()) => Box::new(UnexpectedExit),
        Err(err) => Box::new(err),
    }
}

/// A supervised job's `run` future is only ever supposed to resolve by
/// erroring; resolving with `Ok(())` still means the job stopped doing
/// its work, which is just as fatal.
#[derive(Debug)]
struct UnexpectedExit;

impl fmt::Display for UnexpectedExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("job returned without error, but was expected to run forever")
    }
}

impl StdError for UnexpectedExit {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_future_to_resolve_wins() {
        let terminated = run_until_first_terminates(
            std::future::ready(Err(stevedore_core::FatalEngineError::EventStreamClosed)),
            std::future::pending(),
            std::future::pending(),
        )
        .await;
        assert_eq!(terminated.job, JobName::PumpSupervisor);
    }

    #[tokio::test]
    async fn ok_completion_is_still_reported_as_terminated() {
        let terminated =
            run_until_first_terminates(std::future::pending(), std::future::pending(), std::future::ready(Ok(()))).await;
        assert_eq!(terminated.job, JobName::ControlApi);
        assert!(terminated.cause.to_string().contains("expected to run forever"));
    }
}
