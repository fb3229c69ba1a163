#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod capabilities;
pub mod codec;
pub mod config;
pub mod dataset;
pub mod event;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory_remote;
pub mod model;
pub mod presentation;
pub mod schema;
pub mod session;
#[cfg(feature = "shell")]
pub mod shell;
pub mod sync;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use app::App;
pub use capabilities::{Capabilities, Effect};
pub use crux_core::App as CruxApp;
pub use event::Event;
pub use model::Model;

use crate::model::{AppState, Notification, NotificationKind, Position};
use crate::schema::FieldDescriptor;
use crate::session::SessionPhase;
use crate::sync::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    Rejected,
    RateLimited,
    Deserialization,
    LoadFailed,
    InvalidState,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Authorization => "FORBIDDEN",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Rejected => "REJECTED",
            Self::RateLimited => "RATE_LIMITED",
            Self::Deserialization => "DESERIALIZATION_ERROR",
            Self::LoadFailed => "LOAD_FAILED",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network
            | Self::Timeout
            | Self::Conflict
            | Self::RateLimited
            | Self::LoadFailed => ErrorSeverity::Transient,

            Self::Deserialization | Self::Internal | Self::InvalidState => ErrorSeverity::Fatal,

            Self::Authentication
            | Self::Authorization
            | Self::Validation
            | Self::NotFound
            | Self::Rejected => ErrorSeverity::Permanent,
        }
    }

    /// Whether asking again by hand can succeed. Nothing is retried automatically.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimited | Self::LoadFailed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to reach the repository. Please check your connection and try again."
                    .into()
            }
            ErrorKind::Timeout => "The repository took too long to answer. Please try again.".into(),
            ErrorKind::Authentication => {
                "Your access token is invalid or has expired. Please sign in again.".into()
            }
            ErrorKind::Authorization => {
                "Your access token does not allow changes to this repository.".into()
            }
            ErrorKind::NotFound => "A dataset file could not be found in the repository.".into(),
            ErrorKind::Conflict => format!(
                "This file changed on the server since it was loaded ({}). Reload the datasets and apply your edit again.",
                self.message
            ),
            ErrorKind::Rejected => format!("The repository refused the change: {}", self.message),
            ErrorKind::RateLimited => {
                "Too many requests to the repository. Please wait a moment and try again.".into()
            }
            ErrorKind::Deserialization => {
                "A dataset file is not valid GeoJSON and could not be read.".into()
            }
            ErrorKind::Validation | ErrorKind::LoadFailed => self.message.clone(),
            ErrorKind::InvalidState => "The editor is not ready for that action.".into(),
            ErrorKind::Internal => "An unexpected error occurred. Please try again.".into(),
        }
    }

    #[must_use]
    pub fn from_sync(error: &SyncError) -> Self {
        let message = match error {
            SyncError::Rejected { message, .. } | SyncError::Conflict { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let error_kind = error.kind();
        let app_error = Self::new(error_kind, message);
        match error {
            SyncError::Fetch { path, status, .. }
            | SyncError::Conflict { path, status, .. }
            | SyncError::Rejected { path, status, .. } => app_error
                .with_context("path", path.clone())
                .with_context("http_status", status.to_string()),
            SyncError::Decode { path, .. } | SyncError::Stale { path, .. } => {
                app_error.with_context("path", path.clone())
            }
            SyncError::Auth { status, .. } => {
                app_error.with_context("http_status", status.to_string())
            }
            SyncError::Transport(_) | SyncError::MissingCredential | SyncError::Protocol(_) => {
                app_error
            }
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

// --- View model ---

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LayerView {
    pub dataset: String,
    pub name: String,
    pub color: String,
    pub feature_count: usize,
    pub version: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EditorView {
    pub session_id: String,
    pub title: String,
    pub dataset: String,
    pub fields: Vec<FieldDescriptor>,
    pub proxy: Position,
    pub save_enabled: bool,
    pub saving: bool,
    pub save_failed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Screen {
    SignIn { validating: bool },
    Loading { files: usize },
    Map {
        layers: Vec<LayerView>,
        editor: Option<EditorView>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NotificationView {
    pub kind: NotificationKind,
    pub message: String,
}

impl From<&Notification> for NotificationView {
    fn from(notification: &Notification) -> Self {
        Self {
            kind: notification.kind,
            message: notification.message.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ViewModel {
    pub screen: Screen,
    pub user: Option<String>,
    pub notification: Option<NotificationView>,
}

pub mod app {
    use super::*;
    use tracing::{debug, info, warn};

    use crate::capabilities::{Capabilities, LayerHandle, MapOperation};
    use crate::dataset::{Dataset, LoadError, LoadedFile};
    use crate::schema::FieldRules;
    use crate::session::{feature_label, session_fields, ClosedSession, SessionError};
    use crate::sync::CommitReceipt;

    #[derive(Default)]
    pub struct App;

    impl App {
        /// Puts a closed session's marker back and drops its proxy.
        fn restore_marker(closed: ClosedSession, caps: &Capabilities) {
            caps.map.set_marker_visibility(closed.target, true);
            caps.map.remove_draggable_marker(closed.id);
        }

        fn detach_layers(model: &mut Model, caps: &Capabilities) {
            if let Some(closed) = model.session.cancel(&mut model.store) {
                Self::restore_marker(closed, caps);
            }
            for layer in model.layers.drain(..) {
                caps.map.remove_dataset(layer);
            }
            model.store.clear();
        }

        fn reload(model: &mut Model, caps: &Capabilities) {
            let files = match model.require_config() {
                Ok(config) => config
                    .files
                    .iter()
                    .map(|f| crate::model::DatasetId::new(f.as_str()))
                    .collect::<Vec<_>>(),
                Err(e) => {
                    model.set_error(e);
                    return;
                }
            };

            Self::detach_layers(model, caps);
            model.load_generation += 1;
            model.state = AppState::Loading;

            let generation = model.load_generation;
            info!(generation, files = files.len(), "loading datasets");
            caps.store.load_all(files, move |result| Event::DatasetsLoaded {
                generation,
                result: Box::new(result),
            });
        }

        fn attach_layers(model: &mut Model, files: Vec<LoadedFile>, caps: &Capabilities) {
            let label_keys = model
                .config
                .as_ref()
                .map(|c| c.label_keys.clone())
                .unwrap_or_default();

            for (order, file) in files.into_iter().enumerate() {
                let dataset = Dataset::new(file.id, file.collection, file.version, order);
                let layer = LayerHandle {
                    dataset: dataset.id.clone(),
                    generation: model.load_generation,
                };
                caps.map
                    .render_dataset(MapOperation::render(layer.clone(), &dataset, &label_keys));
                model.layers.push(layer);
                model.store.insert(dataset);
            }
        }

        fn sign_out(model: &mut Model, caps: &Capabilities, reason: Option<AppError>) {
            Self::detach_layers(model, caps);
            // Invalidates any load still in flight.
            model.load_generation += 1;
            model.user = None;
            model.state = AppState::Unauthenticated;
            caps.store.clear_credential();

            match reason {
                Some(error) => model.set_error(error),
                None => model.clear_notification(),
            }
        }

        fn load_failed(model: &mut Model, error: &LoadError, caps: &Capabilities) {
            if error.is_auth() {
                warn!("dataset load refused credential");
                let auth = error
                    .failures
                    .iter()
                    .find(|f| f.error.is_auth())
                    .map_or_else(
                        || AppError::new(ErrorKind::Authentication, error.to_string()),
                        |f| AppError::from_sync(&f.error),
                    );
                Self::sign_out(model, caps, Some(auth));
                return;
            }

            let files = error
                .files()
                .iter()
                .map(|f| f.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let mut app_error = AppError::new(ErrorKind::LoadFailed, format!("Could not load {files}"));
            for failure in &error.failures {
                app_error = app_error.with_context(failure.file.as_str(), failure.error.to_string());
            }
            model.state = AppState::Ready;
            model.set_error(app_error);
        }

        fn commit_succeeded(model: &mut Model, session: &crate::model::SessionId, receipt: CommitReceipt, caps: &Capabilities) {
            match model.session.save_succeeded(session) {
                Ok(closed) => {
                    if let Some(dataset) = model.store.get_mut(&receipt.file) {
                        dataset.version = receipt.version.clone();
                    }
                    info!(file = %receipt.file, version = %receipt.version, "edit committed");
                    caps.map.move_marker(closed.target.clone(), closed.position);
                    Self::restore_marker(closed, caps);
                    model.notify(Notification::success(format!("Saved changes to {}", receipt.file)));
                }
                Err(_) => {
                    // The session was replaced while saving. Its content was rolled back
                    // locally, so the stored version is deliberately left behind.
                    debug!(%session, "commit result for a closed session");
                    model.notify(Notification::info(format!(
                        "An earlier edit to {} was saved. Reload to see it.",
                        receipt.file
                    )));
                }
            }
        }

        fn commit_failed(model: &mut Model, session: &crate::model::SessionId, error: &SyncError, caps: &Capabilities) {
            if model.session.save_failed(session).is_err() {
                debug!(%session, %error, "commit failure for a closed session");
                return;
            }

            warn!(%error, "commit failed");
            if error.is_auth() {
                Self::sign_out(model, caps, Some(AppError::from_sync(error)));
            } else {
                model.set_error(AppError::from_sync(error));
            }
        }

        fn session_error(model: &mut Model, error: SessionError) {
            match error {
                SessionError::NoActiveSession | SessionError::SaveInProgress | SessionError::StaleSession => {
                    debug!(%error, "ignored");
                }
                SessionError::FeatureNotFound { .. }
                | SessionError::NotAPoint { .. }
                | SessionError::InvalidDate { .. } => {
                    model.set_error(AppError::new(ErrorKind::Validation, error.to_string()));
                }
            }
        }
    }

    impl crux_core::App for App {
        type Event = Event;
        type Model = Model;
        type ViewModel = ViewModel;
        type Capabilities = Capabilities;

        fn update(&self, event: Event, model: &mut Model, caps: &Capabilities) {
            let event_name = event.name();
            if event.is_user_initiated() {
                debug!(event = event_name, "user action");
            }

            match event {
                Event::Noop => return,

                Event::Configure(config) => match config.validate() {
                    Ok(()) => {
                        info!(files = config.files.len(), repo = %config.repo.name, "configured");
                        model.config = Some(*config);
                    }
                    Err(e) => model.set_error(AppError::new(ErrorKind::Validation, e.to_string())),
                },

                Event::SignInRequested => {
                    if let Err(e) = model.require_config() {
                        model.set_error(e);
                    } else {
                        model.state = AppState::Authenticating;
                        model.clear_notification();
                        caps.store
                            .validate_credential(|result| Event::SignInCompleted(Box::new(result)));
                    }
                }

                Event::SignInCompleted(result) => match *result {
                    Ok(identity) => {
                        info!(login = %identity.login, "signed in");
                        model.user = Some(identity);
                        Self::reload(model, caps);
                    }
                    Err(error) if error.is_auth() => {
                        warn!(%error, "credential rejected");
                        Self::sign_out(model, caps, Some(AppError::from_sync(&error)));
                    }
                    Err(error) => {
                        // Keep the credential: the remote could not be reached to judge it.
                        warn!(%error, "sign-in check failed");
                        model.state = AppState::Unauthenticated;
                        model.set_error(AppError::from_sync(&error));
                    }
                },

                Event::SignOutRequested => {
                    info!("signed out");
                    Self::sign_out(model, caps, None);
                }

                Event::ReloadRequested => {
                    if model.is_authenticated() {
                        Self::reload(model, caps);
                    } else {
                        model.set_error(AppError::new(ErrorKind::InvalidState, "not signed in"));
                    }
                }

                Event::DatasetsLoaded { generation, result } => {
                    if generation != model.load_generation {
                        debug!(generation, current = model.load_generation, "stale load result dropped");
                        return;
                    }
                    match *result {
                        Ok(files) => {
                            Self::attach_layers(model, files, caps);
                            model.state = AppState::Ready;
                        }
                        Err(error) => Self::load_failed(model, &error, caps),
                    }
                }

                Event::FeatureClicked { dataset, index } => {
                    if model.state != AppState::Ready {
                        return;
                    }
                    let Some(target) = model.store.resolve(&dataset, index) else {
                        warn!(%dataset, index, "click on unknown feature");
                        return;
                    };
                    match model.session.open(&mut model.store, target) {
                        Ok(superseded) => {
                            if let Some(closed) = superseded {
                                Self::restore_marker(closed, caps);
                            }
                            if let Some(session) = model.session.active() {
                                caps.map
                                    .place_draggable_marker(session.id.clone(), session.proxy);
                                caps.map.set_marker_visibility(session.target.clone(), false);
                            }
                        }
                        Err(e) => Self::session_error(model, e),
                    }
                }

                Event::FieldChanged { name, value } => {
                    if let Err(e) = model.session.set_field(name, value) {
                        Self::session_error(model, e);
                    }
                }

                Event::ProxyMoved { position } => {
                    if let Err(e) = model.session.move_proxy(position) {
                        Self::session_error(model, e);
                    }
                }

                Event::SaveRequested => {
                    let default_rules = FieldRules::default();
                    let (rules, label_keys) = match &model.config {
                        Some(config) => (&config.fields, config.label_keys.as_slice()),
                        None => (&default_rules, &[][..]),
                    };

                    match model.session.begin_save(&mut model.store, rules, label_keys) {
                        Ok(request) => {
                            let Some(session) = model.session.active().map(|s| s.id.clone()) else {
                                return;
                            };
                            info!(%session, file = %request.file, "committing edit");
                            model.notify(Notification::info("Saving…"));
                            caps.store.commit(request, move |result| Event::CommitFinished {
                                session,
                                result: Box::new(result),
                            });
                        }
                        Err(e) => Self::session_error(model, e),
                    }
                }

                Event::CommitFinished { session, result } => match *result {
                    Ok(receipt) => Self::commit_succeeded(model, &session, receipt, caps),
                    Err(error) => Self::commit_failed(model, &session, &error, caps),
                },

                Event::CancelRequested => {
                    if let Some(closed) = model.session.cancel(&mut model.store) {
                        Self::restore_marker(closed, caps);
                    }
                }

                Event::DismissNotification => model.clear_notification(),
            }

            caps.render.render();
        }

        fn view(&self, model: &Model) -> ViewModel {
            let screen = match model.state {
                AppState::Unauthenticated => Screen::SignIn { validating: false },
                AppState::Authenticating => Screen::SignIn { validating: true },
                AppState::Loading => Screen::Loading {
                    files: model.config.as_ref().map_or(0, |c| c.files.len()),
                },
                AppState::Ready => Screen::Map {
                    layers: model
                        .store
                        .iter()
                        .map(|d| LayerView {
                            dataset: d.id.to_string(),
                            name: d.name.clone(),
                            color: d.color.to_string(),
                            feature_count: d.features().len(),
                            version: d.version.to_string(),
                        })
                        .collect(),
                    editor: editor_view(model),
                },
            };

            ViewModel {
                screen,
                user: model.user.as_ref().map(|u| u.login.clone()),
                notification: model.notification.as_ref().map(NotificationView::from),
            }
        }
    }

    fn editor_view(model: &Model) -> Option<EditorView> {
        let session = model.session.active()?;
        let default_rules = FieldRules::default();
        let (rules, label_keys) = match &model.config {
            Some(config) => (&config.fields, config.label_keys.as_slice()),
            None => (&default_rules, &[][..]),
        };
        let dataset = model.store.get(&session.target.dataset)?;

        Some(EditorView {
            session_id: session.id.to_string(),
            title: feature_label(session.snapshot(), label_keys)
                .unwrap_or_else(|| format!("Feature {}", session.target.index + 1)),
            dataset: dataset.name.clone(),
            fields: session_fields(&model.store, session, rules),
            proxy: session.proxy,
            save_enabled: session.phase != SessionPhase::Saving,
            saving: session.phase == SessionPhase::Saving,
            save_failed: session.phase == SessionPhase::SaveFailed,
        })
    }
}
