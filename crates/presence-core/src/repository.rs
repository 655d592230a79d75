//! Storage contracts for templates and attendance events.
//!
//! Implementations must make each call a single atomic unit: a registration
//! either creates the identity and its template together or not at all, and a
//! concurrent registration of the same new handle fails with
//! [`StoreError::Conflict`] instead of creating a duplicate.

use crate::attendance::{AttendanceAction, AttendanceEvent, LastAction};
use crate::types::Embedding;
use chrono::NaiveDateTime;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage conflict: {0}")]
    Conflict(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
}

/// An enrolled person.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    pub handle: String,
    pub created_at: NaiveDateTime,
    pub template_count: usize,
}

/// An identity together with all of its stored templates.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrolledIdentity {
    pub handle: String,
    pub templates: Vec<Embedding>,
}

pub trait TemplateStore {
    /// Store a template, creating the identity on first use.
    ///
    /// Returns the identity's template count after the insert.
    fn add_template(&mut self, handle: &str, template: &Embedding) -> Result<usize, StoreError>;

    /// All templates of `handle` in insertion order; empty when unknown.
    fn templates(&self, handle: &str) -> Result<Vec<Embedding>, StoreError>;

    /// Every identity with at least one template, ordered by handle.
    fn enrolled(&self) -> Result<Vec<EnrolledIdentity>, StoreError>;

    /// Every identity, ordered by handle.
    fn identities(&self) -> Result<Vec<Identity>, StoreError>;

    /// Delete an identity with its templates and events. `false` if unknown.
    fn remove_identity(&mut self, handle: &str) -> Result<bool, StoreError>;
}

pub trait AttendanceRecorder {
    /// Persist an event stamped with the server clock.
    ///
    /// Returns `None` (and writes nothing) when `handle` is unknown.
    fn record(
        &mut self,
        handle: &str,
        action: AttendanceAction,
        score: f32,
    ) -> Result<Option<AttendanceEvent>, StoreError>;

    fn last_action(&self, handle: &str) -> Result<Option<LastAction>, StoreError>;
}
