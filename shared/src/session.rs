//! The single in-progress edit.
//!
//! A session references its feature by [`FeatureRef`] and owns everything else
//! it needs: the draggable proxy position, the uncommitted form values and a
//! snapshot of the feature taken when the session opened. The store is only
//! written at save time, and restored from the snapshot when a session that
//! wrote to it is torn down without a successful commit.

use geojson::Feature;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::dataset::{point_position, DatasetStore, FeatureRef};
use crate::model::{Position, SessionId};
use crate::schema::{
    describe_fields, display_value, normalize_date_str, FieldDescriptor, FieldRules, FieldValue,
};
use crate::sync::CommitRequest;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FormValue {
    Checkbox(bool),
    Text(String),
    Date(String),
}

pub type FormValues = BTreeMap<String, FormValue>;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionError {
    #[error("no feature is being edited")]
    NoActiveSession,
    #[error("feature {index} of {dataset} does not exist")]
    FeatureNotFound { dataset: String, index: usize },
    #[error("feature {index} of {dataset} is not a point")]
    NotAPoint { dataset: String, index: usize },
    #[error("{field}: '{value}' is not a valid date")]
    InvalidDate { field: String, value: String },
    #[error("a save is already in progress")]
    SaveInProgress,
    #[error("result belongs to a session that is no longer open")]
    StaleSession,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionPhase {
    Editing,
    Saving,
    SaveFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditSession {
    pub id: SessionId,
    pub target: FeatureRef,
    pub proxy: Position,
    /// Where the feature was when the session opened.
    pub origin: Position,
    pub form: FormValues,
    pub phase: SessionPhase,
    snapshot: Feature,
    /// Set once a save has written into the store.
    wrote_store: bool,
}

impl EditSession {
    pub fn snapshot(&self) -> &Feature {
        &self.snapshot
    }

    pub fn is_saving(&self) -> bool {
        self.phase == SessionPhase::Saving
    }
}

/// What the caller needs to undo on the map after a session ends.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedSession {
    pub id: SessionId,
    pub target: FeatureRef,
    /// Position the feature's marker should show.
    pub position: Position,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum SessionState {
    #[default]
    Idle,
    Editing(Box<EditSession>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionManager {
    state: SessionState,
}

impl SessionManager {
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn active(&self) -> Option<&EditSession> {
        match &self.state {
            SessionState::Editing(session) => Some(session),
            SessionState::Idle => None,
        }
    }

    pub fn is_editing(&self) -> bool {
        matches!(self.state, SessionState::Editing(_))
    }

    /// Starts editing `target`. A session that is already open is torn down
    /// first and returned so its marker can be restored.
    pub fn open(
        &mut self,
        store: &mut DatasetStore,
        target: FeatureRef,
    ) -> Result<Option<ClosedSession>, SessionError> {
        locate(store, &target)?;
        let superseded = self.cancel(store);
        // Read after teardown: the previous session may have restored this very feature.
        let (origin, snapshot) = locate(store, &target)?;

        let session = EditSession {
            id: SessionId::generate(),
            target,
            proxy: origin,
            origin,
            form: FormValues::new(),
            phase: SessionPhase::Editing,
            snapshot,
            wrote_store: false,
        };
        info!(
            session = %session.id,
            dataset = %session.target.dataset,
            index = session.target.index,
            "edit session opened"
        );

        self.state = SessionState::Editing(Box::new(session));
        Ok(superseded)
    }

    /// Discards the session. If a failed save already wrote into the store,
    /// the feature is put back as it was when the session opened.
    pub fn cancel(&mut self, store: &mut DatasetStore) -> Option<ClosedSession> {
        let SessionState::Editing(session) = std::mem::take(&mut self.state) else {
            return None;
        };

        if session.wrote_store {
            if let Some(feature) = store.feature_mut(&session.target) {
                *feature = session.snapshot.clone();
            }
        }
        debug!(session = %session.id, "edit session closed without commit");

        Some(ClosedSession {
            id: session.id,
            target: session.target,
            position: session.origin,
        })
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: FormValue) -> Result<(), SessionError> {
        let session = self.editable()?;
        session.form.insert(name.into(), value);
        Ok(())
    }

    pub fn move_proxy(&mut self, position: Position) -> Result<(), SessionError> {
        let session = self.editable()?;
        session.proxy = position;
        Ok(())
    }

    /// Applies the form to the stored feature and builds the commit for its file.
    pub fn begin_save(
        &mut self,
        store: &mut DatasetStore,
        rules: &FieldRules,
        label_keys: &[String],
    ) -> Result<CommitRequest, SessionError> {
        let session = self.editable()?;
        let not_found = || SessionError::FeatureNotFound {
            dataset: session.target.dataset.to_string(),
            index: session.target.index,
        };

        let feature = store.feature_mut(&session.target).ok_or_else(not_found)?;
        check_dates(feature, &session.form, rules)?;
        apply_edits(feature, &session.form, rules, session.proxy);
        let feature_label = feature_label(feature, label_keys);

        let dataset = store.get(&session.target.dataset).ok_or_else(not_found)?;
        let request = CommitRequest {
            file: dataset.id.clone(),
            collection: dataset.collection.clone(),
            expected: dataset.version.clone(),
            feature_label,
        };

        session.wrote_store = true;
        session.phase = SessionPhase::Saving;
        Ok(request)
    }

    /// Closes the session after its commit landed.
    pub fn save_succeeded(&mut self, id: &SessionId) -> Result<ClosedSession, SessionError> {
        self.check_saving(id)?;
        let SessionState::Editing(session) = std::mem::take(&mut self.state) else {
            return Err(SessionError::NoActiveSession);
        };
        Ok(ClosedSession {
            id: session.id,
            target: session.target,
            position: session.proxy,
        })
    }

    /// Keeps the session open with its edits so the save can be retried.
    pub fn save_failed(&mut self, id: &SessionId) -> Result<(), SessionError> {
        self.check_saving(id)?;
        if let SessionState::Editing(session) = &mut self.state {
            session.phase = SessionPhase::SaveFailed;
        }
        Ok(())
    }

    fn check_saving(&self, id: &SessionId) -> Result<(), SessionError> {
        match &self.state {
            SessionState::Editing(session) if &session.id == id && session.is_saving() => Ok(()),
            SessionState::Editing(_) => Err(SessionError::StaleSession),
            SessionState::Idle => Err(SessionError::StaleSession),
        }
    }

    fn editable(&mut self) -> Result<&mut EditSession, SessionError> {
        match &mut self.state {
            SessionState::Editing(session) if session.is_saving() => Err(SessionError::SaveInProgress),
            SessionState::Editing(session) => Ok(session),
            SessionState::Idle => Err(SessionError::NoActiveSession),
        }
    }
}

fn locate(store: &DatasetStore, target: &FeatureRef) -> Result<(Position, Feature), SessionError> {
    let feature = store
        .feature(target)
        .ok_or_else(|| SessionError::FeatureNotFound {
            dataset: target.dataset.to_string(),
            index: target.index,
        })?;
    let origin = point_position(feature).ok_or_else(|| SessionError::NotAPoint {
        dataset: target.dataset.to_string(),
        index: target.index,
    })?;
    Ok((origin, feature.clone()))
}

/// Refuses date entries that would be written but cannot be read as a date.
/// An empty entry clears the value and is accepted.
fn check_dates(feature: &Feature, form: &FormValues, rules: &FieldRules) -> Result<(), SessionError> {
    let Some(properties) = feature.properties.as_ref() else {
        return Ok(());
    };
    for (name, value) in form {
        let FormValue::Date(text) = value else {
            continue;
        };
        if rules.is_locked(name) || !properties.contains_key(name) || text.trim().is_empty() {
            continue;
        }
        if normalize_date_str(text).is_none() {
            return Err(SessionError::InvalidDate {
                field: name.clone(),
                value: text.clone(),
            });
        }
    }
    Ok(())
}

/// Field descriptors for the open session, with uncommitted form values shown
/// in place of the stored ones.
pub fn session_fields(store: &DatasetStore, session: &EditSession, rules: &FieldRules) -> Vec<FieldDescriptor> {
    let mut fields = describe_fields(store, &session.snapshot, rules);
    for field in &mut fields {
        match session.form.get(&field.key) {
            Some(FormValue::Checkbox(checked)) => field.value = FieldValue::Checked(*checked),
            Some(FormValue::Text(text) | FormValue::Date(text)) => {
                field.value = FieldValue::Text(text.clone());
            }
            None => {}
        }
    }
    fields
}

/// Writes form values into `feature` and moves its point to `proxy`.
///
/// Only attributes the feature already has are written; excluded and
/// read-only keys are skipped, so the key set never changes.
pub fn apply_edits(feature: &mut Feature, form: &FormValues, rules: &FieldRules, proxy: Position) {
    if let Some(properties) = feature.properties.as_mut() {
        for (name, value) in form {
            if rules.is_locked(name) {
                continue;
            }
            let Some(slot) = properties.get_mut(name) else {
                continue;
            };
            *slot = match value {
                FormValue::Checkbox(checked) => Value::from(u8::from(*checked)),
                FormValue::Date(text) => Value::String(
                    normalize_date_str(text).unwrap_or_else(|| text.trim().to_string()),
                ),
                FormValue::Text(text) => Value::String(text.clone()),
            };
        }
    }

    let point = geojson::Value::Point(proxy.to_coordinates());
    match feature.geometry.as_mut() {
        Some(geometry) => geometry.value = point,
        None => feature.geometry = Some(geojson::Geometry::new(point)),
    }
}

/// First non-empty value among `label_keys`, used to name the feature in commit messages.
pub fn feature_label(feature: &Feature, label_keys: &[String]) -> Option<String> {
    let properties = feature.properties.as_ref()?;
    label_keys
        .iter()
        .filter_map(|key| properties.get(key))
        .map(display_value)
        .find(|label| !label.trim().is_empty())
}
