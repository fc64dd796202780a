//! Failure rules and the rule-building DSL.
//!
//! ```ignore
//! let mut rules = FailureRuleCollection::new();
//! rules.on::<TimeoutError>().or::<IoError>().retry_now(2);
//! rules.on::<DbConflict>().schedule_retry(&[secs(1), secs(5), secs(30)]);
//! rules.on_where(|e| e.to_string().contains("poison")).discard();
//! ```
//!
//! Rules are attempt-indexed: attempt *n* uses slot *n*. Attempts beyond the
//! configured slots go to the error queue whatever the rule says.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::ContinuationKind;
use crate::envelope::Envelope;

/// Predicate over a failure.
pub type ErrorPredicate = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;

/// Whether `error`, or anything in its source chain, is an `E`.
fn is_error_type<E: StdError + 'static>(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        if err.is::<E>() {
            return true;
        }
        current = err.source();
    }
    false
}

// =============================================================================
// Rule
// =============================================================================

/// One (predicate → continuation slots) mapping.
#[derive(Clone)]
pub struct FailureRule {
    description: String,
    predicates: Vec<ErrorPredicate>,
    slots: Vec<ContinuationKind>,
    indefinite: Option<ContinuationKind>,
}

impl fmt::Debug for FailureRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureRule")
            .field("description", &self.description)
            .field("slots", &self.slots)
            .field("indefinite", &self.indefinite)
            .finish()
    }
}

impl FailureRule {
    pub fn matches(&self, error: &(dyn StdError + 'static)) -> bool {
        self.predicates.iter().any(|predicate| predicate(error))
    }

    /// Continuation for a failed attempt number (1-based).
    pub fn continuation_for(&self, attempts: u32) -> ContinuationKind {
        if let Some(kind) = &self.indefinite {
            return kind.clone();
        }
        let slot = attempts.saturating_sub(1) as usize;
        self.slots
            .get(slot)
            .cloned()
            .unwrap_or(ContinuationKind::MoveToErrorQueue)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

// =============================================================================
// Collection
// =============================================================================

/// Ordered failure rules plus an optional default.
#[derive(Debug, Clone, Default)]
pub struct FailureRuleCollection {
    rules: Vec<FailureRule>,
    default: Option<ContinuationKind>,
}

impl FailureRuleCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a rule matching errors of type `E` (searched through the source chain).
    pub fn on<E: StdError + 'static>(&mut self) -> FailureRuleBuilder<'_> {
        let predicate: ErrorPredicate = Arc::new(is_error_type::<E>);
        FailureRuleBuilder {
            collection: self,
            predicates: vec![predicate],
            description: std::any::type_name::<E>().to_string(),
        }
    }

    /// Start a rule matching errors accepted by `predicate`.
    pub fn on_where<F>(&mut self, predicate: F) -> FailureRuleBuilder<'_>
    where
        F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        let predicate: ErrorPredicate = Arc::new(predicate);
        FailureRuleBuilder {
            collection: self,
            predicates: vec![predicate],
            description: "custom predicate".to_string(),
        }
    }

    /// Continuation used when no rule matches.
    pub fn otherwise(&mut self, kind: ContinuationKind) -> &mut Self {
        self.default = Some(kind);
        self
    }

    pub fn add(&mut self, rule: FailureRule) -> &mut Self {
        self.rules.push(rule);
        self
    }

    /// Append another collection's rules after this one's.
    pub fn extend(&mut self, other: &FailureRuleCollection) {
        self.rules.extend(other.rules.iter().cloned());
        if self.default.is_none() {
            self.default = other.default.clone();
        }
    }

    /// First matching rule's decision for the envelope's current attempt.
    pub fn determine(
        &self,
        error: &(dyn StdError + 'static),
        envelope: &Envelope,
    ) -> Option<ContinuationKind> {
        self.rules
            .iter()
            .find(|rule| rule.matches(error))
            .map(|rule| rule.continuation_for(envelope.attempts))
            .or_else(|| self.default.clone())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.default.is_none()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Finishes a rule started with `on`/`on_where`.
pub struct FailureRuleBuilder<'a> {
    collection: &'a mut FailureRuleCollection,
    predicates: Vec<ErrorPredicate>,
    description: String,
}

impl fmt::Debug for FailureRuleBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureRuleBuilder")
            .field("description", &self.description)
            .finish()
    }
}

impl<'a> FailureRuleBuilder<'a> {
    /// Also match errors of type `E`.
    pub fn or<E: StdError + 'static>(mut self) -> Self {
        self.predicates.push(Arc::new(is_error_type::<E>));
        self.description = format!("{} or {}", self.description, std::any::type_name::<E>());
        self
    }

    /// Requeue until the envelope has been attempted `max_attempts` times.
    pub fn requeue(self, max_attempts: u32) -> &'a mut FailureRuleCollection {
        let slots = max_attempts.saturating_sub(1) as usize;
        self.slots(vec![ContinuationKind::Requeue { delay: None }; slots])
    }

    pub fn requeue_indefinitely(self) -> &'a mut FailureRuleCollection {
        self.finish(Vec::new(), Some(ContinuationKind::Requeue { delay: None }))
    }

    /// Retry in place up to `times` more times.
    pub fn retry_now(self, times: u32) -> &'a mut FailureRuleCollection {
        self.slots(vec![ContinuationKind::RetryNow; times as usize])
    }

    /// One scheduled retry per delay, in order.
    pub fn schedule_retry(self, delays: &[Duration]) -> &'a mut FailureRuleCollection {
        let slots = delays
            .iter()
            .map(|delay| ContinuationKind::ScheduleRetry(*delay))
            .collect();
        self.slots(slots)
    }

    pub fn move_to_error_queue(self) -> &'a mut FailureRuleCollection {
        self.finish(Vec::new(), Some(ContinuationKind::MoveToErrorQueue))
    }

    pub fn discard(self) -> &'a mut FailureRuleCollection {
        self.finish(Vec::new(), Some(ContinuationKind::Discard))
    }

    /// Pause the listener, then requeue the envelope, on every matching failure.
    pub fn pause_then_requeue(self, pause: Duration) -> &'a mut FailureRuleCollection {
        let kind = ContinuationKind::Composite(vec![
            ContinuationKind::PauseListener(pause),
            ContinuationKind::Requeue { delay: None },
        ]);
        self.finish(Vec::new(), Some(kind))
    }

    /// Explicit attempt slots.
    pub fn slots(self, slots: Vec<ContinuationKind>) -> &'a mut FailureRuleCollection {
        self.finish(slots, None)
    }

    fn finish(
        self,
        slots: Vec<ContinuationKind>,
        indefinite: Option<ContinuationKind>,
    ) -> &'a mut FailureRuleCollection {
        let FailureRuleBuilder {
            collection,
            predicates,
            description,
        } = self;
        collection.add(FailureRule {
            description,
            predicates,
            slots,
            indefinite,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[derive(Debug, thiserror::Error)]
    #[error("bad image format")]
    struct BadImageFormat;

    #[derive(Debug, thiserror::Error)]
    #[error("divide by zero")]
    struct DivideByZero;

    #[derive(Debug, thiserror::Error)]
    #[error("wrapped")]
    struct Wrapper(#[source] DivideByZero);

    fn attempt(n: u32) -> Envelope {
        let mut envelope = Envelope::new("a", Vec::<u8>::new());
        envelope.attempts = n;
        envelope
    }

    #[test]
    fn test_or_chaining_matches_either_type() {
        let mut rules = FailureRuleCollection::new();
        rules.on::<BadImageFormat>().or::<DivideByZero>().requeue(3);

        assert!(rules.determine(&BadImageFormat, &attempt(1)).is_some());
        assert!(rules.determine(&DivideByZero, &attempt(1)).is_some());
        assert!(rules.determine(&std::fmt::Error, &attempt(1)).is_none());
    }

    #[test]
    fn test_matches_through_source_chain() {
        let mut rules = FailureRuleCollection::new();
        rules.on::<DivideByZero>().discard();
        assert_eq!(
            rules.determine(&Wrapper(DivideByZero), &attempt(1)),
            Some(ContinuationKind::Discard)
        );
    }

    #[test]
    fn test_first_registered_rule_wins() {
        let mut rules = FailureRuleCollection::new();
        rules.on::<DivideByZero>().discard();
        rules.on::<DivideByZero>().move_to_error_queue();
        assert_eq!(
            rules.determine(&DivideByZero, &attempt(1)),
            Some(ContinuationKind::Discard)
        );
    }

    #[test]
    fn test_requeue_falls_back_after_max_attempts() {
        let mut rules = FailureRuleCollection::new();
        rules.on::<DivideByZero>().requeue(3);

        let requeue = Some(ContinuationKind::Requeue { delay: None });
        assert_eq!(rules.determine(&DivideByZero, &attempt(1)), requeue);
        assert_eq!(rules.determine(&DivideByZero, &attempt(2)), requeue);
        assert_eq!(
            rules.determine(&DivideByZero, &attempt(3)),
            Some(ContinuationKind::MoveToErrorQueue)
        );
    }

    #[test]
    fn test_schedule_retry_uses_delay_per_attempt() {
        let mut rules = FailureRuleCollection::new();
        rules
            .on::<DivideByZero>()
            .schedule_retry(&[Duration::from_secs(1), Duration::from_secs(5)]);
        assert_eq!(
            rules.determine(&DivideByZero, &attempt(2)),
            Some(ContinuationKind::ScheduleRetry(Duration::from_secs(5)))
        );
        assert_eq!(
            rules.determine(&DivideByZero, &attempt(3)),
            Some(ContinuationKind::MoveToErrorQueue)
        );
    }

    #[test]
    fn test_on_where_and_default() {
        let mut rules = FailureRuleCollection::new();
        rules
            .on_where(|e| e.to_string().contains("poison"))
            .discard()
            .otherwise(ContinuationKind::RetryNow);

        let poison = std::io::Error::new(std::io::ErrorKind::Other, "poison pill");
        assert_eq!(
            rules.determine(&poison, &attempt(1)),
            Some(ContinuationKind::Discard)
        );
        assert_eq!(
            rules.determine(&DivideByZero, &attempt(1)),
            Some(ContinuationKind::RetryNow)
        );
    }

    #[test]
    fn test_pause_then_requeue_is_composite() {
        let mut rules = FailureRuleCollection::new();
        rules
            .on::<DivideByZero>()
            .pause_then_requeue(Duration::from_secs(10));
        match rules.determine(&DivideByZero, &attempt(7)) {
            Some(ContinuationKind::Composite(parts)) => assert_eq!(parts.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    proptest! {
        #[test]
        fn prop_requeue_indefinitely_never_dead_letters(attempts in 0u32..10_000) {
            let mut rules = FailureRuleCollection::new();
            rules.on::<DivideByZero>().requeue_indefinitely();
            prop_assert_eq!(
                rules.determine(&DivideByZero, &attempt(attempts)),
                Some(ContinuationKind::Requeue { delay: None })
            );
        }

        #[test]
        fn prop_retry_now_slots_are_bounded(times in 0u32..20, attempts in 1u32..40) {
            let mut rules = FailureRuleCollection::new();
            rules.on::<DivideByZero>().retry_now(times);
            let kind = rules.determine(&DivideByZero, &attempt(attempts));
            if attempts <= times {
                prop_assert_eq!(kind, Some(ContinuationKind::RetryNow));
            } else {
                prop_assert_eq!(kind, Some(ContinuationKind::MoveToErrorQueue));
            }
        }
    }
}
