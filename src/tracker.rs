//! Cleanup tracking for entities created during a test.
//!
//! A test registers every identifier it gets back from a create call. At
//! teardown [`ResourceTracker::flush`] tries to delete each one in
//! registration order. One failed (or panicking) deletion never stops the
//! rest, and the tracking list is always empty afterwards.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use crate::error::TrackingError;

/// Identifier of a remote entity, as returned by its create endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceId {
    Number(i64),
    Text(String),
}

impl ResourceId {
    /// Read an identifier out of a JSON value (number or non-empty string)
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(ResourceId::Number),
            serde_json::Value::String(s) if !s.trim().is_empty() => {
                Some(ResourceId::Text(s.clone()))
            }
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ResourceId::Text(s) if s.trim().is_empty())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ResourceId::Number(n) => Some(*n),
            ResourceId::Text(s) => s.parse().ok(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Number(n) => write!(f, "{}", n),
            ResourceId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ResourceId {
    fn from(id: i64) -> Self {
        ResourceId::Number(id)
    }
}

impl From<i32> for ResourceId {
    fn from(id: i32) -> Self {
        ResourceId::Number(id.into())
    }
}

impl From<u32> for ResourceId {
    fn from(id: u32) -> Self {
        ResourceId::Number(id.into())
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        ResourceId::Text(id.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        ResourceId::Text(id)
    }
}

/// One entity awaiting cleanup
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedResource {
    pub kind: String,
    pub identifier: ResourceId,
    pub registered_at: DateTime<Utc>,
}

/// Result of one deletion attempt during a flush
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupOutcome {
    pub kind: String,
    pub identifier: ResourceId,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CleanupOutcome {
    pub fn success(kind: impl Into<String>, identifier: impl Into<ResourceId>) -> Self {
        Self {
            kind: kind.into(),
            identifier: identifier.into(),
            succeeded: true,
            error: None,
        }
    }

    pub fn failure(
        kind: impl Into<String>,
        identifier: impl Into<ResourceId>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            identifier: identifier.into(),
            succeeded: false,
            error: Some(error.into()),
        }
    }
}

/// Deletes a remote entity by kind and identifier
pub trait ResourceDeleter {
    type Error: fmt::Display;

    fn delete(
        &self,
        kind: &str,
        identifier: &ResourceId,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Per-test list of created entities
#[derive(Debug, Default)]
pub struct ResourceTracker {
    resources: Vec<TrackedResource>,
    owner: Option<String>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker whose leak warning names its owner, e.g. a test session
    pub fn owned_by(owner: impl Into<String>) -> Self {
        Self {
            resources: Vec::new(),
            owner: Some(owner.into()),
        }
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Track a created entity. Call it right after parsing the create
    /// response, before any assertion can fail.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        identifier: impl Into<ResourceId>,
    ) -> Result<(), TrackingError> {
        let kind = kind.into();
        let identifier = identifier.into();

        if kind.trim().is_empty() {
            return Err(TrackingError::EmptyKind);
        }
        if identifier.is_empty() {
            return Err(TrackingError::EmptyIdentifier { kind });
        }

        if self.is_tracked(&kind, &identifier) {
            tracing::debug!(
                kind = %kind,
                identifier = %identifier,
                "Resource registered twice; it will be deleted twice"
            );
        }

        tracing::trace!(kind = %kind, identifier = %identifier, "Tracking resource");
        self.resources.push(TrackedResource {
            kind,
            identifier,
            registered_at: Utc::now(),
        });
        Ok(())
    }

    /// Stop tracking the first matching entry, e.g. after a test deleted it itself
    pub fn forget(&mut self, kind: &str, identifier: &ResourceId) -> bool {
        match self
            .resources
            .iter()
            .position(|r| r.kind == kind && &r.identifier == identifier)
        {
            Some(index) => {
                self.resources.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn is_tracked(&self, kind: &str, identifier: &ResourceId) -> bool {
        self.resources
            .iter()
            .any(|r| r.kind == kind && &r.identifier == identifier)
    }

    pub fn pending_count(&self) -> usize {
        self.resources.len()
    }

    pub fn pending(&self) -> &[TrackedResource] {
        &self.resources
    }

    /// Delete every tracked entity through `deleter` and clear the list
    pub async fn flush<D>(&mut self, deleter: &D) -> Vec<CleanupOutcome>
    where
        D: ResourceDeleter,
    {
        self.drain(move |resource| async move {
            deleter
                .delete(&resource.kind, &resource.identifier)
                .await
                .map_err(|e| e.to_string())
        })
        .await
    }

    /// Same as [`flush`](Self::flush) with a plain async callback
    pub async fn flush_with<F, Fut, E>(&mut self, mut delete_fn: F) -> Vec<CleanupOutcome>
    where
        F: FnMut(&str, &ResourceId) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        self.drain(|resource| {
            let pending = delete_fn(resource.kind.as_str(), &resource.identifier);
            async move { pending.await.map_err(|e| e.to_string()) }
        })
        .await
    }

    async fn drain<F, Fut>(&mut self, mut attempt: F) -> Vec<CleanupOutcome>
    where
        F: FnMut(TrackedResource) -> Fut,
        Fut: Future<Output = Result<(), String>>,
    {
        // Cleared up front: failed entries are not retried
        let resources = std::mem::take(&mut self.resources);
        if resources.is_empty() {
            return Vec::new();
        }

        let total = resources.len();
        tracing::debug!(count = total, "Cleaning up tracked resources");

        let mut outcomes = Vec::with_capacity(total);
        for resource in resources {
            let kind = resource.kind.clone();
            let identifier = resource.identifier.clone();

            let result = AssertUnwindSafe(async { attempt(resource).await })
                .catch_unwind()
                .await;

            let outcome = match result {
                Ok(Ok(())) => {
                    tracing::debug!(kind = %kind, identifier = %identifier, "Deleted tracked resource");
                    CleanupOutcome::success(kind, identifier)
                }
                Ok(Err(error)) => {
                    tracing::warn!(
                        kind = %kind,
                        identifier = %identifier,
                        error = %error,
                        "Failed to delete tracked resource"
                    );
                    CleanupOutcome::failure(kind, identifier, error)
                }
                Err(panic) => {
                    let error = format!("deletion panicked: {}", panic_message(panic.as_ref()));
                    tracing::warn!(
                        kind = %kind,
                        identifier = %identifier,
                        error = %error,
                        "Failed to delete tracked resource"
                    );
                    CleanupOutcome::failure(kind, identifier, error)
                }
            };
            outcomes.push(outcome);
        }

        let failed = outcomes.iter().filter(|o| !o.succeeded).count();
        if failed > 0 {
            tracing::warn!(
                "{} of {} tracked resources could not be deleted and may be left behind",
                failed,
                total
            );
        } else {
            tracing::debug!("All {} tracked resources deleted", total);
        }

        outcomes
    }
}

impl Drop for ResourceTracker {
    fn drop(&mut self) {
        if !self.resources.is_empty() {
            let leaked: Vec<String> = self
                .resources
                .iter()
                .map(|r| format!("{}:{}", r.kind, r.identifier))
                .collect();
            tracing::warn!(
                owner = self.owner.as_deref().unwrap_or("unowned"),
                "Resource tracker dropped without flush, {} resources left behind: {}",
                leaked.len(),
                leaked.join(", ")
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Deleter that records every attempt and fails for chosen identifiers
    #[derive(Default)]
    struct RecordingDeleter {
        attempts: Mutex<Vec<(String, ResourceId)>>,
        failing: HashSet<ResourceId>,
        panicking: HashSet<ResourceId>,
    }

    impl RecordingDeleter {
        fn failing_on(ids: &[i64]) -> Self {
            Self {
                failing: ids.iter().map(|id| ResourceId::from(*id)).collect(),
                ..Self::default()
            }
        }

        fn attempts(&self) -> Vec<(String, ResourceId)> {
            self.attempts.lock().unwrap().clone()
        }
    }

    impl ResourceDeleter for RecordingDeleter {
        type Error = String;

        async fn delete(&self, kind: &str, identifier: &ResourceId) -> Result<(), String> {
            self.attempts
                .lock()
                .unwrap()
                .push((kind.to_string(), identifier.clone()));

            if self.panicking.contains(identifier) {
                panic!("connection pool poisoned");
            }
            if self.failing.contains(identifier) {
                return Err(format!("cannot delete {} {}", kind, identifier));
            }
            Ok(())
        }
    }

    #[test]
    fn test_resource_id_from_json() {
        assert_eq!(ResourceId::from_json(&json!(42)), Some(ResourceId::Number(42)));
        assert_eq!(
            ResourceId::from_json(&json!("a1b2")),
            Some(ResourceId::Text("a1b2".to_string()))
        );
        assert_eq!(ResourceId::from_json(&json!("")), None);
        assert_eq!(ResourceId::from_json(&json!(null)), None);
        assert_eq!(ResourceId::from_json(&json!(1.5)), None);
    }

    #[test]
    fn test_resource_id_display_and_serde() {
        assert_eq!(ResourceId::from(7).to_string(), "7");
        assert_eq!(ResourceId::from("abc").to_string(), "abc");
        assert_eq!(serde_json::to_value(ResourceId::from(7)).unwrap(), json!(7));
        assert_eq!(ResourceId::from("12").as_i64(), Some(12));
    }

    #[test]
    fn test_register_rejects_empty_identifier() {
        let mut tracker = ResourceTracker::new();

        assert_eq!(
            tracker.register("keyword", ""),
            Err(TrackingError::EmptyIdentifier {
                kind: "keyword".to_string()
            })
        );
        assert_eq!(tracker.register("", 1), Err(TrackingError::EmptyKind));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_forget_removes_single_entry() {
        let mut tracker = ResourceTracker::new();
        tracker.register("category", 1).unwrap();
        tracker.register("category", 1).unwrap();

        assert!(tracker.forget("category", &ResourceId::from(1)));
        assert_eq!(tracker.pending_count(), 1);
        assert!(!tracker.forget("keyword", &ResourceId::from(1)));

        tracker.forget("category", &ResourceId::from(1));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_continues_after_failure() {
        let mut tracker = ResourceTracker::new();
        tracker.register("category", 1).unwrap();
        tracker.register("category", 2).unwrap();
        tracker.register("category", 3).unwrap();

        let deleter = RecordingDeleter::failing_on(&[2]);
        let outcomes = tracker.flush(&deleter).await;

        assert_eq!(deleter.attempts().len(), 3);
        assert_eq!(
            outcomes,
            vec![
                CleanupOutcome::success("category", 1),
                CleanupOutcome::failure("category", 2, "cannot delete category 2"),
                CleanupOutcome::success("category", 3),
            ]
        );
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_follows_registration_order() {
        let mut tracker = ResourceTracker::new();
        tracker.register("keyword", 10).unwrap();
        tracker.register("category", 5).unwrap();
        tracker.register("station", "st-9").unwrap();

        let deleter = RecordingDeleter::default();
        tracker.flush(&deleter).await;

        assert_eq!(
            deleter.attempts(),
            vec![
                ("keyword".to_string(), ResourceId::from(10)),
                ("category".to_string(), ResourceId::from(5)),
                ("station".to_string(), ResourceId::from("st-9")),
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_registration_deletes_twice() {
        let mut tracker = ResourceTracker::new();
        tracker.register("category", 42).unwrap();
        tracker.register("category", 42).unwrap();

        let deleter = RecordingDeleter::default();
        let outcomes = tracker.flush(&deleter).await;

        assert_eq!(
            deleter.attempts(),
            vec![
                ("category".to_string(), ResourceId::from(42)),
                ("category".to_string(), ResourceId::from(42)),
            ]
        );
        assert!(outcomes.iter().all(|o| o.succeeded));
    }

    #[tokio::test]
    async fn test_panicking_deletion_is_isolated() {
        let mut tracker = ResourceTracker::new();
        tracker.register("vehicle", 1).unwrap();
        tracker.register("vehicle", 2).unwrap();

        let deleter = RecordingDeleter {
            panicking: [ResourceId::from(1)].into_iter().collect(),
            ..RecordingDeleter::default()
        };
        let outcomes = tracker.flush(&deleter).await;

        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].succeeded);
        assert_eq!(
            outcomes[0].error.as_deref(),
            Some("deletion panicked: connection pool poisoned")
        );
        assert!(outcomes[1].succeeded);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_with_closure() {
        let mut tracker = ResourceTracker::new();
        tracker.register("keyword", 7).unwrap();
        tracker.register("keyword", 8).unwrap();

        let outcomes = tracker
            .flush_with(|_kind: &str, identifier: &ResourceId| {
                let missing = identifier.as_i64() == Some(7);
                async move {
                    if missing {
                        Err("not found")
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!(
            outcomes,
            vec![
                CleanupOutcome::failure("keyword", 7, "not found"),
                CleanupOutcome::success("keyword", 8),
            ]
        );
    }

    #[tokio::test]
    async fn test_flush_empty_tracker() {
        let mut tracker = ResourceTracker::new();
        let outcomes = tracker.flush(&RecordingDeleter::default()).await;
        assert!(outcomes.is_empty());
    }

    #[test]
    fn test_outcome_serialization() {
        let value = serde_json::to_value(CleanupOutcome::failure("keyword", 7, "not found")).unwrap();
        assert_eq!(
            value,
            json!({"kind": "keyword", "identifier": 7, "succeeded": false, "error": "not found"})
        );

        let value = serde_json::to_value(CleanupOutcome::success("keyword", 8)).unwrap();
        assert!(value.get("error").is_none());
    }

    proptest! {
        #[test]
        fn prop_flush_attempts_everything_in_order(
            ids in proptest::collection::vec(0i64..50, 0..20),
            failing in proptest::collection::hash_set(0i64..50, 0..10),
        ) {
            let mut tracker = ResourceTracker::new();
            for id in &ids {
                tracker.register("event", *id).unwrap();
            }

            let deleter = RecordingDeleter {
                failing: failing.iter().map(|id| ResourceId::from(*id)).collect(),
                ..RecordingDeleter::default()
            };
            let outcomes = tokio_test::block_on(tracker.flush(&deleter));

            let attempted: Vec<ResourceId> = deleter.attempts().into_iter().map(|(_, id)| id).collect();
            let expected: Vec<ResourceId> = ids.iter().map(|id| ResourceId::from(*id)).collect();
            prop_assert_eq!(attempted, expected);
            prop_assert_eq!(outcomes.len(), ids.len());
            for (outcome, id) in outcomes.iter().zip(&ids) {
                prop_assert_eq!(outcome.succeeded, !failing.contains(id));
            }
            prop_assert_eq!(tracker.pending_count(), 0);
        }
    }
}
