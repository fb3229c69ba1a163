//! Native driver for the core.
//!
//! Owns the credential, runs `Store` operations against the remote through a
//! [`RemoteClient`], and applies `Map` operations to a [`MapPresentation`].
//! Everything runs on the calling thread; remote calls are driven to
//! completion on a current-thread Tokio runtime owned by the shell.

use std::collections::VecDeque;

use crux_core::Core;
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, warn};

use crate::capabilities::{Capabilities, HttpTransport, StoreOperation, StoreOutput};
use crate::config::EditorConfig;
use crate::dataset::{self, FileFailure, LoadError};
use crate::event::Credential;
use crate::presentation::{apply, MapPresentation};
use crate::sync::{RemoteClient, SyncError};
use crate::{App, Effect, Event, ViewModel};

/// Where the shell keeps the access token between remote calls.
pub trait CredentialProvider {
    fn current_credential(&self) -> Option<Credential>;
    fn store(&mut self, credential: Credential);
    fn clear(&mut self);
}

/// Keeps the credential for the lifetime of the process only.
#[derive(Debug, Default)]
pub struct SessionCredentials {
    credential: Option<Credential>,
}

impl CredentialProvider for SessionCredentials {
    fn current_credential(&self) -> Option<Credential> {
        self.credential.clone()
    }

    fn store(&mut self, credential: Credential) {
        self.credential = Some(credential);
    }

    fn clear(&mut self) {
        self.credential = None;
    }
}

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to start the async runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

pub struct Shell<T, C, M> {
    core: Core<Effect, App>,
    runtime: Runtime,
    client: RemoteClient<T>,
    credentials: C,
    map: M,
}

impl<T, C, M> Shell<T, C, M>
where
    T: HttpTransport,
    C: CredentialProvider,
    M: MapPresentation,
{
    /// Builds the shell and hands `config` to the core.
    pub fn new(config: EditorConfig, transport: T, credentials: C, map: M) -> Result<Self, ShellError> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let client = RemoteClient::new(transport, config.repo.clone());
        let mut shell = Self {
            core: Core::new::<Capabilities>(),
            runtime,
            client,
            credentials,
            map,
        };
        shell.dispatch(Event::Configure(Box::new(config)));
        Ok(shell)
    }

    /// Stores `credential` and asks the core to validate it. A blank token
    /// is not stored, so validation fails as a missing credential.
    pub fn sign_in(&mut self, credential: Credential) {
        if credential.is_blank() {
            warn!("blank credential ignored");
            self.credentials.clear();
        } else {
            self.credentials.store(credential);
        }
        self.dispatch(Event::SignInRequested);
    }

    pub fn dispatch(&mut self, event: Event) {
        debug!(event = event.name(), "dispatch");
        let effects = self.core.process_event(event);
        self.process(effects);
    }

    /// Feeds clicks and drags collected by the map into the core.
    /// Returns how many interactions were forwarded.
    pub fn pump_map_events(&mut self) -> usize {
        let events = self.map.poll_events();
        let count = events.len();
        for event in events {
            self.dispatch(event.into());
        }
        count
    }

    /// Reads the proxy's final position off the map, then saves.
    pub fn save(&mut self) {
        self.pump_map_events();
        if let Some(position) = self.map.proxy_position() {
            self.dispatch(Event::ProxyMoved { position });
        }
        self.dispatch(Event::SaveRequested);
    }

    pub fn view(&self) -> ViewModel {
        self.core.view()
    }

    pub fn map(&self) -> &M {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut M {
        &mut self.map
    }

    pub fn client(&self) -> &RemoteClient<T> {
        &self.client
    }

    pub fn credentials(&self) -> &C {
        &self.credentials
    }

    fn process(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();

        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Render(_) => {}
                Effect::Map(request) => apply(&mut self.map, &request.operation),
                Effect::Store(mut request) => {
                    if request.operation == StoreOperation::ClearCredential {
                        info!("credential cleared");
                        self.credentials.clear();
                        continue;
                    }
                    let output = self.runtime.block_on(self.perform(&request.operation));
                    queue.extend(self.core.resolve(&mut request, output));
                }
            }
        }
    }

    async fn perform(&self, operation: &StoreOperation) -> StoreOutput {
        let credential = self.credentials.current_credential();

        match operation {
            StoreOperation::ValidateCredential => StoreOutput::Identity(match &credential {
                Some(credential) => self.client.validate_credential(credential).await,
                None => Err(SyncError::MissingCredential),
            }),
            StoreOperation::LoadAll { files } => StoreOutput::Loaded(match &credential {
                Some(credential) => dataset::load_all(&self.client, files, credential).await,
                None => Err(LoadError {
                    failures: files
                        .iter()
                        .map(|file| FileFailure {
                            file: file.clone(),
                            error: SyncError::MissingCredential,
                        })
                        .collect(),
                }),
            }),
            StoreOperation::Commit(request) => StoreOutput::Committed(match &credential {
                Some(credential) => self.client.commit(request, credential).await,
                None => Err(SyncError::MissingCredential),
            }),
            StoreOperation::ClearCredential => StoreOutput::Cleared,
        }
    }
}
