//! Ordered teardown of resources acquired during a benchmark.
//!
//! Runners register a named undo action whenever they acquire something that has to be released
//! again (an installed package, written documents, temporary files). The [`CleanupChain`] fixes
//! the execution order up front, independent of the order in which resources were acquired, and
//! runs every registered action at most once. Failing actions do not stop the chain; their errors
//! are collected into a [`MultiError`].

use std::fmt;
use std::future::Future;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::error::{Error, Result};

/// A type-erased, single-use cleanup action.
pub type CleanupAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct CleanupStep {
    name: &'static str,
    action: Option<CleanupAction>,
}

/// A fixed sequence of named cleanup slots.
pub struct CleanupChain {
    steps: Vec<CleanupStep>,
}

impl CleanupChain {
    /// Creates a chain whose steps execute in the given order.
    pub fn new(order: &[&'static str]) -> Self {
        let steps = order
            .iter()
            .map(|&name| CleanupStep { name, action: None })
            .collect();
        Self { steps }
    }

    /// Fills the slot `name` with an action, replacing any previously registered one.
    ///
    /// Names that were not part of the declared order are appended to the end of the chain.
    pub fn register<F, Fut>(&mut self, name: &'static str, action: F)
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let action: CleanupAction = Box::new(move || action().boxed());

        match self.steps.iter_mut().find(|step| step.name == name) {
            Some(step) => step.action = Some(action),
            None => {
                tracing::warn!(step = name, "cleanup step not declared, running it last");
                self.steps.push(CleanupStep {
                    name,
                    action: Some(action),
                });
            }
        }
    }

    /// Returns `true` if an action is pending in the slot `name`.
    pub fn is_registered(&self, name: &str) -> bool {
        self.steps
            .iter()
            .any(|step| step.name == name && step.action.is_some())
    }

    /// Drops all pending actions without running them.
    pub fn discard(&mut self) {
        for step in &mut self.steps {
            step.action = None;
        }
    }

    /// Runs every pending action in declared order.
    ///
    /// Each action is taken out of its slot before it is awaited, so a second call only runs
    /// actions registered in the meantime.
    pub async fn run(&mut self) -> Result<(), MultiError> {
        let mut errors = MultiError::default();

        for step in &mut self.steps {
            let Some(action) = step.action.take() else {
                continue;
            };

            tracing::debug!(step = step.name, "running cleanup step");
            if let Err(error) = action().await {
                tracing::error!(
                    step = step.name,
                    error = &error as &dyn std::error::Error,
                    "cleanup step failed"
                );
                errors.push(step.name, error);
            }
        }

        errors.into_result()
    }
}

impl fmt::Debug for CleanupChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for step in &self.steps {
            match step.action {
                Some(_) => list.entry(&format_args!("{} (pending)", step.name)),
                None => list.entry(&step.name),
            };
        }
        list.finish()
    }
}

/// A failed cleanup step.
#[derive(Debug)]
pub struct StepFailure {
    /// Name of the step that failed.
    pub step: &'static str,
    /// The error the step returned.
    pub error: Error,
}

/// The aggregated failures of a [`CleanupChain`] run.
#[derive(Debug, Default)]
pub struct MultiError {
    failures: Vec<StepFailure>,
}

impl MultiError {
    fn push(&mut self, step: &'static str, error: Error) {
        self.failures.push(StepFailure { step, error });
    }

    fn into_result(self) -> Result<(), Self> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// The individual failures, in execution order.
    pub fn failures(&self) -> &[StepFailure] {
        &self.failures
    }

    /// Number of failed steps.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Returns `true` if no step failed.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, failure) in self.failures.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(f, "[{index}] {}: {}", failure.step, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn recording(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
        fail: bool,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static {
        let log = Arc::clone(log);
        move || {
            async move {
                log.lock().unwrap().push(name);
                if fail {
                    Err(Error::Data(format!("{name} exploded")))
                } else {
                    Ok(())
                }
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn continues_past_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = CleanupChain::new(&["first", "second", "third"]);
        chain.register("first", recording(&log, "first", false));
        chain.register("second", recording(&log, "second", true));
        chain.register("third", recording(&log, "third", false));

        let error = chain.run().await.unwrap_err();

        assert_eq!(*log.lock().unwrap(), ["first", "second", "third"]);
        assert_eq!(error.len(), 1);
        assert_eq!(error.failures()[0].step, "second");

        let rendered = error.to_string();
        assert_eq!(rendered, "[0] second: second exploded");
        assert_eq!(rendered.matches('[').count(), 1);
    }

    #[tokio::test]
    async fn runs_in_declared_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = CleanupChain::new(&["persist", "remove", "wipe", "clear"]);
        chain.register("clear", recording(&log, "clear", false));
        chain.register("wipe", recording(&log, "wipe", false));
        chain.register("persist", recording(&log, "persist", false));

        chain.run().await.unwrap();

        assert_eq!(*log.lock().unwrap(), ["persist", "wipe", "clear"]);
    }

    #[tokio::test]
    async fn runs_each_action_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = CleanupChain::new(&["remove"]);
        chain.register("remove", recording(&log, "remove", false));
        assert!(chain.is_registered("remove"));

        chain.run().await.unwrap();
        chain.run().await.unwrap();

        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(!chain.is_registered("remove"));
    }

    #[tokio::test]
    async fn discard_skips_pending_actions() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = CleanupChain::new(&["remove", "wipe"]);
        chain.register("remove", recording(&log, "remove", true));
        chain.register("wipe", recording(&log, "wipe", true));

        chain.discard();
        chain.run().await.unwrap();

        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn undeclared_steps_run_last() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = CleanupChain::new(&["remove"]);
        chain.register("extra", recording(&log, "extra", false));
        chain.register("remove", recording(&log, "remove", false));

        chain.run().await.unwrap();

        assert_eq!(*log.lock().unwrap(), ["remove", "extra"]);
    }
}
