use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::EditorConfig;
use crate::dataset::{LoadError, LoadedFile};
use crate::model::{DatasetId, Position, SessionId};
use crate::session::FormValue;
use crate::sync::{CommitReceipt, SyncError};

// --- Credential: opaque, redacted Debug, never serialized ---

#[derive(Clone)]
pub struct Credential(Arc<SecretString>);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::new(SecretString::new(token.into())))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_blank(&self) -> bool {
        self.expose().trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UserIdentity {
    pub login: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum Event {
    // Lifecycle
    Configure(Box<EditorConfig>),
    Noop,

    // Auth: the shell holds the credential, the core only asks for it to be checked.
    SignInRequested,
    SignInCompleted(Box<Result<UserIdentity, SyncError>>),
    SignOutRequested,

    // Datasets
    ReloadRequested,
    DatasetsLoaded {
        generation: u64,
        result: Box<Result<Vec<LoadedFile>, LoadError>>,
    },

    // Editing
    FeatureClicked {
        dataset: DatasetId,
        index: usize,
    },
    FieldChanged {
        name: String,
        value: FormValue,
    },
    ProxyMoved {
        position: Position,
    },
    SaveRequested,
    CommitFinished {
        session: SessionId,
        result: Box<Result<CommitReceipt, SyncError>>,
    },
    CancelRequested,

    // UI
    DismissNotification,
}

impl Event {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Event::Configure(_) => "configure",
            Event::Noop => "noop",
            Event::SignInRequested => "sign_in_requested",
            Event::SignInCompleted(_) => "sign_in_completed",
            Event::SignOutRequested => "sign_out_requested",
            Event::ReloadRequested => "reload_requested",
            Event::DatasetsLoaded { .. } => "datasets_loaded",
            Event::FeatureClicked { .. } => "feature_clicked",
            Event::FieldChanged { .. } => "field_changed",
            Event::ProxyMoved { .. } => "proxy_moved",
            Event::SaveRequested => "save_requested",
            Event::CommitFinished { .. } => "commit_finished",
            Event::CancelRequested => "cancel_requested",
            Event::DismissNotification => "dismiss_notification",
        }
    }

    /// Events that originate from the person at the keyboard rather than from an effect result.
    #[must_use]
    pub fn is_user_initiated(&self) -> bool {
        matches!(
            self,
            Event::SignInRequested
                | Event::SignOutRequested
                | Event::ReloadRequested
                | Event::FeatureClicked { .. }
                | Event::FieldChanged { .. }
                | Event::ProxyMoved { .. }
                | Event::SaveRequested
                | Event::CancelRequested
                | Event::DismissNotification
        )
    }
}
