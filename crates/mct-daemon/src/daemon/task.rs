//! Resumable task: a cooperatively cancellable step loop
//!
//! A [`Resumable`] owns whatever it needs to make progress and is handed its
//! state by value on every step. [`run`] keeps stepping until the stepper
//! reports [`Step::Complete`] or the cancellation token is raised.
//!
//! ## Rules
//! - Cancellation is observed **between** steps only; an in-flight step is
//!   never pre-empted, so a cancelled loop reports the last state a step
//!   returned
//! - A step error ends the loop immediately and is returned to the caller
//!   unchanged; there is no retry here

use std::future::Future;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of a single step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<S> {
    /// Run another step with this state
    Continue(S),
    /// Stop; this is the final state
    Complete(S),
}

/// How a loop ended without error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<S> {
    /// A step returned [`Step::Complete`]
    Completed(S),
    /// Cancellation was observed between steps
    Cancelled(S),
}

impl<S> Outcome<S> {
    pub fn into_state(self) -> S {
        match self {
            Self::Completed(s) | Self::Cancelled(s) => s,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// A state machine driven by [`run`].
///
/// Uses RPITIT with an explicit Send bound so steppers can run on the
/// multi-threaded runtime.
pub trait Resumable: Send {
    type State: Send;
    type Error: Send;

    /// Advance the state machine by one step.
    fn step(
        &mut self,
        state: Self::State,
    ) -> impl Future<Output = Result<Step<Self::State>, Self::Error>> + Send;
}

/// Drive `stepper` from `initial` until it completes, fails, or `cancel` is raised.
pub async fn run<R: Resumable>(
    mut stepper: R,
    initial: R::State,
    cancel: CancellationToken,
) -> Result<Outcome<R::State>, R::Error> {
    let mut state = initial;
    loop {
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled(state));
        }
        match stepper.step(state).await? {
            Step::Continue(next) => state = next,
            Step::Complete(done) => return Ok(Outcome::Completed(done)),
        }
    }
}

/// Failure of a spawned resumable task
#[derive(Debug, Error)]
pub enum TaskError<E>
where
    E: std::error::Error + 'static,
{
    /// A step returned an error
    #[error("task {name} failed: {source}")]
    Failed {
        name: String,
        #[source]
        source: E,
    },

    /// The task panicked or was aborted
    #[error("task {name} did not finish: {source}")]
    Join {
        name: String,
        #[source]
        source: JoinError,
    },
}

/// A [`run`] loop spawned onto the tokio runtime, with its stop signal.
pub struct ResumableTask<S, E> {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<Result<Outcome<S>, E>>,
}

impl<S, E> ResumableTask<S, E>
where
    S: Send + 'static,
    E: std::error::Error + Send + 'static,
{
    /// Spawn `stepper` on the current runtime.
    pub fn spawn<R>(
        name: impl Into<String>,
        stepper: R,
        initial: S,
        cancel: CancellationToken,
    ) -> Self
    where
        R: Resumable<State = S, Error = E> + 'static,
    {
        let name = name.into();
        debug!("Spawning task {}", name);
        let handle = tokio::spawn(run(stepper, initial, cancel.clone()));
        Self {
            name,
            cancel,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the loop to stop after its current step.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to end.
    pub async fn join(self) -> Result<Outcome<S>, TaskError<E>> {
        let name = self.name;
        match self.handle.await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(source)) => Err(TaskError::Failed { name, source }),
            Err(source) => Err(TaskError::Join { name, source }),
        }
    }
}
