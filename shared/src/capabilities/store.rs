use crux_core::capability::{CapabilityContext, Operation};
use crux_core::macros::Capability;
use serde::{Deserialize, Serialize};

use crate::dataset::{LoadError, LoadedFile};
use crate::event::UserIdentity;
use crate::model::DatasetId;
use crate::sync::{CommitReceipt, CommitRequest, SyncError};

/// Remote work the shell performs on the core's behalf. The shell attaches
/// the credential; the core never holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreOperation {
    ValidateCredential,
    LoadAll { files: Vec<DatasetId> },
    Commit(Box<CommitRequest>),
    ClearCredential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreOutput {
    Identity(Result<UserIdentity, SyncError>),
    Loaded(Result<Vec<LoadedFile>, LoadError>),
    Committed(Result<CommitReceipt, SyncError>),
    Cleared,
}

impl Operation for StoreOperation {
    type Output = StoreOutput;
}

fn unexpected(output: &StoreOutput) -> SyncError {
    SyncError::Protocol(format!("unexpected store output: {output:?}"))
}

#[derive(Capability)]
pub struct Store<Ev> {
    context: CapabilityContext<StoreOperation, Ev>,
}

impl<Ev> Store<Ev> {
    pub fn new(context: CapabilityContext<StoreOperation, Ev>) -> Self {
        Self { context }
    }
}

impl<Ev> Store<Ev>
where
    Ev: Send + 'static,
{
    pub fn validate_credential<F>(&self, make_event: F)
    where
        F: FnOnce(Result<UserIdentity, SyncError>) -> Ev + Send + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            let output = context
                .request_from_shell(StoreOperation::ValidateCredential)
                .await;
            let result = match output {
                StoreOutput::Identity(result) => result,
                other => Err(unexpected(&other)),
            };
            context.update_app(make_event(result));
        });
    }

    pub fn load_all<F>(&self, files: Vec<DatasetId>, make_event: F)
    where
        F: FnOnce(Result<Vec<LoadedFile>, LoadError>) -> Ev + Send + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            let output = context
                .request_from_shell(StoreOperation::LoadAll { files })
                .await;
            let result = match output {
                StoreOutput::Loaded(result) => result,
                other => Err(LoadError {
                    failures: vec![crate::dataset::FileFailure {
                        file: DatasetId::new("*"),
                        error: unexpected(&other),
                    }],
                }),
            };
            context.update_app(make_event(result));
        });
    }

    pub fn commit<F>(&self, request: CommitRequest, make_event: F)
    where
        F: FnOnce(Result<CommitReceipt, SyncError>) -> Ev + Send + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            let output = context
                .request_from_shell(StoreOperation::Commit(Box::new(request)))
                .await;
            let result = match output {
                StoreOutput::Committed(result) => result,
                other => Err(unexpected(&other)),
            };
            context.update_app(make_event(result));
        });
    }

    /// Tells the shell to forget the credential. No response is expected.
    pub fn clear_credential(&self) {
        let context = self.context.clone();
        self.context.spawn(async move {
            context.notify_shell(StoreOperation::ClearCredential).await;
        });
    }
}
