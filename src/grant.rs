//! Defines the capability grant attached to each invocation, and the
//! scoped handles through which an invocation reaches the object
//! store and the classification capability.
//!
//! A grant is issued once per invocation and never changes. The only
//! way for an invocation to read objects or call the classifier is
//! through [`Capabilities`], which is bound to the grant's bucket.

use crate::classify::{Classifier, Label};
use crate::error::InvocationError;
use crate::event::ObjectRecord;
use crate::store::ObjectStore;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// An action an invocation may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Action {
    ReadObject,
    InvokeClassification,
    WriteTelemetry,
}

/// Every grant permits exactly these actions.
pub const GRANTED_ACTIONS: [Action; 3] = [
    Action::ReadObject,
    Action::InvokeClassification,
    Action::WriteTelemetry,
];

/// A minimal, time-scoped permission set for one invocation. Can
/// only be created by a [`GrantIssuer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityGrant {
    principal: String,
    bucket: String,
    actions: BTreeSet<Action>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl CapabilityGrant {
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// The only bucket this grant reaches.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn actions(&self) -> &BTreeSet<Action> {
        &self.actions
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn permits(&self, action: Action) -> bool {
        self.actions.contains(&action)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn check(&self, action: Action, bucket: Option<&str>) -> Result<(), InvocationError> {
        if !self.permits(action) {
            return Err(InvocationError::GrantDenied(format!(
                "{} may not perform {:?}",
                self, action
            )));
        }
        if let Some(bucket) = bucket {
            if bucket != self.bucket {
                return Err(InvocationError::GrantDenied(format!(
                    "{} does not cover bucket {:?}",
                    self, bucket
                )));
            }
        }
        if self.is_expired_at(Utc::now()) {
            return Err(InvocationError::GrantDenied(format!(
                "{} expired at {}",
                self, self.expires_at
            )));
        }
        Ok(())
    }
}

impl fmt::Display for CapabilityGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grant for {:?} on bucket {:?}", self.principal, self.bucket)
    }
}

/// Issues grants for the processing principal.
#[derive(Debug, Clone)]
pub struct GrantIssuer {
    principal: String,
    allowed_bucket: Option<String>,
    ttl: Duration,
}

impl GrantIssuer {
    /// `allowed_bucket` pins the bucket that grants may cover; with
    /// `None`, any requested bucket is granted.
    pub fn new(principal: impl Into<String>, allowed_bucket: Option<String>, ttl: Duration) -> Self {
        Self {
            principal: principal.into(),
            allowed_bucket,
            ttl,
        }
    }

    /// Issue a grant scoped to `bucket`.
    pub fn issue(&self, bucket: &str) -> Result<CapabilityGrant, InvocationError> {
        if let Some(allowed) = &self.allowed_bucket {
            if allowed != bucket {
                return Err(InvocationError::GrantDenied(format!(
                    "principal {:?} is not provisioned for bucket {:?}",
                    self.principal, bucket
                )));
            }
        }
        let issued_at = Utc::now();
        Ok(CapabilityGrant {
            principal: self.principal.clone(),
            bucket: bucket.to_string(),
            actions: GRANTED_ACTIONS.into_iter().collect(),
            issued_at,
            expires_at: issued_at + self.ttl,
        })
    }
}

/// The handles an invocation executes with, bound to one grant.
#[derive(Clone)]
pub struct Capabilities {
    grant: Arc<CapabilityGrant>,
    store: Arc<dyn ObjectStore>,
    classifier: Arc<dyn Classifier>,
}

impl Capabilities {
    pub fn attach(
        grant: CapabilityGrant,
        store: Arc<dyn ObjectStore>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        Self {
            grant: Arc::new(grant),
            store,
            classifier,
        }
    }

    pub fn grant(&self) -> &CapabilityGrant {
        &self.grant
    }

    /// Read the exact write described by `object`, which must live in
    /// the granted bucket.
    pub async fn read_object(&self, object: &ObjectRecord) -> Result<Bytes, InvocationError> {
        self.grant.check(Action::ReadObject, Some(&object.bucket))?;
        Ok(self.store.get(object).await?)
    }

    pub async fn classify(&self, image: Bytes) -> Result<Vec<Label>, InvocationError> {
        self.grant.check(Action::InvokeClassification, None)?;
        Ok(self.classifier.classify(image).await?)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("grant", &self.grant)
            .finish_non_exhaustive()
    }
}
