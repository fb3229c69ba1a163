use serde::{Deserialize, Serialize};
use std::fmt;

use crate::capabilities::LayerHandle;
use crate::config::EditorConfig;
use crate::dataset::DatasetStore;
use crate::event::UserIdentity;
use crate::session::SessionManager;
use crate::{AppError, AppResult, ErrorKind};

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

// Repository path of a dataset file, e.g. `data/commerces_actifs.geojson`.
typed_id!(DatasetId);
// Content sha reported by the remote store.
typed_id!(VersionToken);
typed_id!(SessionId);

impl SessionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq)]
pub enum CoordinateError {
    #[error("invalid coordinate: lon={0}, lat={1}")]
    OutOfRange(f64, f64),
    #[error("geometry is not a point")]
    NotAPoint,
}

/// Validated lon/lat, in GeoJSON axis order.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    lon: f64,
    lat: f64,
}

impl Position {
    pub fn new(lon: f64, lat: f64) -> Result<Self, CoordinateError> {
        if !lon.is_finite()
            || !lat.is_finite()
            || !(-180.0..=180.0).contains(&lon)
            || !(-90.0..=90.0).contains(&lat)
        {
            return Err(CoordinateError::OutOfRange(lon, lat));
        }
        Ok(Self { lon, lat })
    }

    /// Reads a GeoJSON position (`[lon, lat, ...]`); extra axes are dropped.
    pub fn from_coordinates(coords: &[f64]) -> Result<Self, CoordinateError> {
        match coords {
            [lon, lat, ..] => Self::new(*lon, *lat),
            _ => Err(CoordinateError::NotAPoint),
        }
    }

    pub fn lon(&self) -> f64 {
        self.lon
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    #[must_use]
    pub fn to_coordinates(self) -> Vec<f64> {
        vec![self.lon, self.lat]
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub enum AppState {
    #[default]
    Unauthenticated,
    Authenticating,
    Loading,
    Ready,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationKind {
    Info,
    Success,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
}

impl Notification {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Success,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Info,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Error,
            message: message.into(),
        }
    }
}

impl From<&AppError> for Notification {
    fn from(error: &AppError) -> Self {
        Notification::error(error.user_facing_message())
    }
}

#[derive(Default)]
pub struct Model {
    pub state: AppState,
    pub user: Option<UserIdentity>,
    pub config: Option<EditorConfig>,
    pub store: DatasetStore,
    pub session: SessionManager,
    /// Layers currently attached to the presentation layer.
    pub layers: Vec<LayerHandle>,
    /// Bumped on every reload; load results from older generations are dropped.
    pub load_generation: u64,
    pub last_error: Option<AppError>,
    pub notification: Option<Notification>,
}

impl Model {
    pub fn set_error(&mut self, error: AppError) {
        self.notification = Some(Notification::from(&error));
        self.last_error = Some(error);
    }

    pub fn notify(&mut self, notification: Notification) {
        self.notification = Some(notification);
    }

    pub fn clear_notification(&mut self) {
        self.notification = None;
        self.last_error = None;
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn require_config(&self) -> AppResult<&EditorConfig> {
        self.config
            .as_ref()
            .ok_or_else(|| AppError::new(ErrorKind::InvalidState, "editor is not configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_bounds() {
        assert!(Position::new(-17.44, 14.69).is_ok());
        assert!(Position::new(180.0, -90.0).is_ok());
        assert!(Position::new(181.0, 0.0).is_err());
        assert!(Position::new(0.0, 90.5).is_err());
        assert!(Position::new(f64::NAN, 0.0).is_err());
        assert!(Position::new(0.0, f64::INFINITY).is_err());
    }

    #[test]
    fn test_position_from_coordinates() {
        let p = Position::from_coordinates(&[-17.2, 14.7, 12.0]).unwrap();
        assert_eq!(p.to_coordinates(), vec![-17.2, 14.7]);
        assert_eq!(
            Position::from_coordinates(&[1.0]),
            Err(CoordinateError::NotAPoint)
        );
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn test_set_error_produces_notification() {
        let mut model = Model::default();
        model.set_error(AppError::new(ErrorKind::Conflict, "sha mismatch"));
        let note = model.notification.clone().unwrap();
        assert_eq!(note.kind, NotificationKind::Error);
        assert!(model.last_error.is_some());
        model.clear_notification();
        assert!(model.notification.is_none());
    }
}
