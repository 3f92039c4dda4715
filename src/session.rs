//! Per-test fixture tying a resource client to a cleanup tracker.
//!
//! Every entity created through [`TestSession::create`] is registered before
//! the id is handed back, so a later failed assertion still leaves it tracked.

use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::error::Result;
use crate::tracker::{CleanupOutcome, ResourceId, ResourceTracker};

pub struct TestSession {
    id: Uuid,
    client: Arc<ApiClient>,
    tracker: ResourceTracker,
}

impl TestSession {
    pub fn new(client: Arc<ApiClient>) -> Self {
        let id = Uuid::new_v4();
        tracing::debug!(session = %id, "Test session started");
        Self {
            id,
            client,
            tracker: ResourceTracker::owned_by(format!("session {}", id)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut ResourceTracker {
        &mut self.tracker
    }

    /// Create a resource and track it for teardown
    pub async fn create(&mut self, kind: &str, body: &Value) -> Result<ResourceId> {
        let identifier = self.client.create(kind, body).await?;
        self.tracker.register(kind, identifier.clone())?;
        Ok(identifier)
    }

    /// Track a resource created some other way
    pub fn track(
        &mut self,
        kind: impl Into<String>,
        identifier: impl Into<ResourceId>,
    ) -> Result<()> {
        self.tracker.register(kind, identifier)?;
        Ok(())
    }

    /// Delete everything this session created
    pub async fn teardown(mut self) -> Vec<CleanupOutcome> {
        let outcomes = self.tracker.flush(self.client.as_ref()).await;
        tracing::debug!(
            session = %self.id,
            deleted = outcomes.iter().filter(|o| o.succeeded).count(),
            failed = outcomes.iter().filter(|o| !o.succeeded).count(),
            "Test session finished"
        );
        outcomes
    }
}
