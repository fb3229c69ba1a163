//! Read-modify-write client for the repository contents API.
//!
//! Every write is a compare-and-swap on the file's content sha: the sha the
//! dataset was loaded with is sent back with the new content, and the remote
//! refuses the write if the file moved in between. Nothing is retried here.

use geojson::FeatureCollection;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::capabilities::http::{
    HttpError, HttpRequest, HttpResponse, HttpTransport, ValidatedUrl,
};
use crate::codec::{self, DecodeError};
use crate::config::RepoConfig;
use crate::event::{Credential, UserIdentity};
use crate::model::{DatasetId, VersionToken};
use crate::ErrorKind;

pub const GITHUB_ACCEPT: &str = "application/vnd.github.v3+json";
pub const USER_AGENT: &str = concat!("geoedit/", env!("CARGO_PKG_VERSION"));
pub const REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncError {
    #[error("authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("failed to fetch {path} ({status}): {message}")]
    Fetch {
        path: String,
        status: u16,
        message: String,
    },

    #[error("failed to decode {path}: {source}")]
    Decode { path: String, source: DecodeError },

    #[error("{path} changed remotely (expected {expected}, found {found})")]
    Stale {
        path: String,
        expected: VersionToken,
        found: VersionToken,
    },

    #[error("write to {path} conflicted ({status}): {message}")]
    Conflict {
        path: String,
        status: u16,
        message: String,
    },

    #[error("write to {path} rejected ({status}): {message}")]
    Rejected {
        path: String,
        status: u16,
        message: String,
    },

    #[error(transparent)]
    Transport(#[from] HttpError),

    #[error("no credential available")]
    MissingCredential,

    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl SyncError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth { .. } | SyncError::MissingCredential)
    }

    /// The write did not land: the remote moved, or refused the new content.
    pub fn is_conflict_or_failure(&self) -> bool {
        matches!(
            self,
            SyncError::Stale { .. } | SyncError::Conflict { .. } | SyncError::Rejected { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Auth { .. } | SyncError::MissingCredential => ErrorKind::Authentication,
            SyncError::Fetch { status, .. } => match status {
                403 => ErrorKind::Authorization,
                404 => ErrorKind::NotFound,
                429 => ErrorKind::RateLimited,
                _ => ErrorKind::Network,
            },
            SyncError::Decode { .. } => ErrorKind::Deserialization,
            SyncError::Stale { .. } | SyncError::Conflict { .. } => ErrorKind::Conflict,
            SyncError::Rejected { .. } => ErrorKind::Rejected,
            SyncError::Transport(HttpError::Timeout { .. }) => ErrorKind::Timeout,
            SyncError::Transport(_) => ErrorKind::Network,
            SyncError::Protocol(_) => ErrorKind::Internal,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// A decoded file together with the sha it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub text: String,
    pub version: VersionToken,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitRequest {
    pub file: DatasetId,
    pub collection: FeatureCollection,
    /// Sha the edited content was derived from.
    pub expected: VersionToken,
    pub feature_label: Option<String>,
}

impl CommitRequest {
    pub fn message(&self) -> String {
        let label = self.feature_label.as_deref().unwrap_or("feature");
        format!("Update {label} in {}", self.file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitReceipt {
    pub file: DatasetId,
    pub version: VersionToken,
    pub commit_sha: String,
    pub commit_url: Option<String>,
}

#[derive(Deserialize)]
struct ContentsResponse {
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Serialize)]
struct PutContents<'a> {
    message: String,
    content: String,
    sha: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<&'a str>,
}

#[derive(Deserialize)]
struct PutResponse {
    content: PutContent,
    commit: PutCommit,
}

#[derive(Deserialize)]
struct PutContent {
    sha: String,
}

#[derive(Deserialize)]
struct PutCommit {
    sha: String,
    #[serde(default)]
    html_url: Option<String>,
}

pub struct RemoteClient<T> {
    transport: T,
    repo: RepoConfig,
}

impl<T: HttpTransport> RemoteClient<T> {
    pub fn new(transport: T, repo: RepoConfig) -> Self {
        Self { transport, repo }
    }

    pub fn repo(&self) -> &RepoConfig {
        &self.repo
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Checks a credential against `GET /user`. Any refusal counts as an auth failure.
    #[instrument(skip(self, credential))]
    pub async fn validate_credential(&self, credential: &Credential) -> SyncResult<UserIdentity> {
        let url = self.endpoint(&["user"], false)?;
        let response = self.send(HttpRequest::get(url), credential).await?;

        if !response.is_success() {
            warn!(status = response.status(), "credential rejected");
            return Err(SyncError::Auth {
                status: response.status(),
                message: response.error_message(),
            });
        }

        let identity: UserIdentity = response.json()?;
        info!(login = %identity.login, "credential validated");
        Ok(identity)
    }

    #[instrument(skip(self, credential))]
    pub async fn fetch_file(&self, path: &str, credential: &Credential) -> SyncResult<RemoteFile> {
        let contents = self.get_contents(path, credential).await?;

        let encoding = contents.encoding.as_deref().unwrap_or_default();
        let content = contents.content.as_deref().unwrap_or_default();
        let text = codec::decode_payload(encoding, content).map_err(|source| SyncError::Decode {
            path: path.to_string(),
            source,
        })?;

        debug!(bytes = text.len(), sha = %contents.sha, "file fetched");
        Ok(RemoteFile {
            text,
            version: VersionToken::new(contents.sha),
        })
    }

    pub async fn fetch_version(
        &self,
        path: &str,
        credential: &Credential,
    ) -> SyncResult<VersionToken> {
        let contents = self.get_contents(path, credential).await?;
        Ok(VersionToken::new(contents.sha))
    }

    /// Writes `request.collection` over the remote file if it is still at
    /// `request.expected`.
    #[instrument(skip(self, request, credential), fields(file = %request.file))]
    pub async fn commit(
        &self,
        request: &CommitRequest,
        credential: &Credential,
    ) -> SyncResult<CommitReceipt> {
        let path = request.file.as_str();

        let current = self.fetch_version(path, credential).await?;
        if current != request.expected {
            warn!(expected = %request.expected, found = %current, "remote moved before commit");
            return Err(SyncError::Stale {
                path: path.to_string(),
                expected: request.expected.clone(),
                found: current,
            });
        }

        let content =
            codec::encode_collection(&request.collection).map_err(|source| SyncError::Decode {
                path: path.to_string(),
                source,
            })?;

        let body = PutContents {
            message: request.message(),
            content,
            sha: request.expected.as_str(),
            branch: self.repo.branch.as_deref(),
        };

        let url = self.contents_url(path, false)?;
        let response = self
            .send(HttpRequest::put(url).with_json(&body)?, credential)
            .await?;

        match response.status() {
            s if (200..300).contains(&s) => {}
            401 => {
                return Err(SyncError::Auth {
                    status: 401,
                    message: response.error_message(),
                })
            }
            409 => {
                warn!("commit conflicted");
                return Err(SyncError::Conflict {
                    path: path.to_string(),
                    status: 409,
                    message: response.error_message(),
                });
            }
            status => {
                warn!(status, "commit rejected");
                return Err(SyncError::Rejected {
                    path: path.to_string(),
                    status,
                    message: response.error_message(),
                });
            }
        }

        let put: PutResponse = response.json()?;
        info!(sha = %put.content.sha, commit = %put.commit.sha, "commit accepted");

        Ok(CommitReceipt {
            file: request.file.clone(),
            version: VersionToken::new(put.content.sha),
            commit_sha: put.commit.sha,
            commit_url: put.commit.html_url,
        })
    }

    async fn get_contents(&self, path: &str, credential: &Credential) -> SyncResult<ContentsResponse> {
        let url = self.contents_url(path, true)?;
        let response = self.send(HttpRequest::get(url), credential).await?;

        match response.status() {
            s if (200..300).contains(&s) => Ok(response.json()?),
            401 => Err(SyncError::Auth {
                status: 401,
                message: response.error_message(),
            }),
            status => Err(SyncError::Fetch {
                path: path.to_string(),
                status,
                message: response.error_message(),
            }),
        }
    }

    async fn send(&self, request: HttpRequest, credential: &Credential) -> SyncResult<HttpResponse> {
        let request = request
            .with_header("Authorization", format!("Bearer {}", credential.expose()))?
            .with_header("Accept", GITHUB_ACCEPT)?
            .with_header("User-Agent", USER_AGENT)?
            .with_timeout(REMOTE_TIMEOUT)?;

        debug!(
            method = request.method().as_str(),
            url = request.url().as_str(),
            request_id = request.request_id(),
            "remote request"
        );
        Ok(self.transport.execute(request).await?)
    }

    fn contents_url(&self, path: &str, with_ref: bool) -> Result<ValidatedUrl, HttpError> {
        let mut segments = vec!["repos", self.repo.owner.as_str(), self.repo.name.as_str(), "contents"];
        segments.extend(path.split('/').filter(|s| !s.is_empty()));
        self.endpoint(&segments, with_ref)
    }

    fn endpoint(&self, segments: &[&str], with_ref: bool) -> Result<ValidatedUrl, HttpError> {
        let invalid = |reason: &str| HttpError::InvalidUrl {
            url: self.repo.api_base.clone(),
            reason: reason.to_string(),
        };

        let mut url = Url::parse(&self.repo.api_base).map_err(|e| invalid(&e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| invalid("API base cannot be a base URL"))?
            .pop_if_empty()
            .extend(segments);

        if with_ref {
            if let Some(branch) = &self.repo.branch {
                url.query_pairs_mut().append_pair("ref", branch);
            }
        }

        ValidatedUrl::from_url(&url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_content, parse_collection};
    use crate::memory_remote::MemoryRemote;
    use pretty_assertions::assert_eq;

    const FILE: &str = "data/commerces_actifs.geojson";
    const TOKEN: &str = "ghp_test";

    fn collection(name: &str) -> FeatureCollection {
        parse_collection(&format!(
            r#"{{"type":"FeatureCollection","features":[{{"type":"Feature",
            "geometry":{{"type":"Point","coordinates":[-17.2,14.7]}},
            "properties":{{"nom":"{name}"}}}}]}}"#
        ))
        .unwrap()
    }

    fn client() -> RemoteClient<MemoryRemote> {
        let remote = MemoryRemote::new("studio-noble-val", "pat-rufisque").with_token(TOKEN, "mainteneur");
        remote.put_file(FILE, &codec::render_collection(&collection("Boulangerie Médina")).unwrap());
        RemoteClient::new(remote, RepoConfig::new("studio-noble-val", "pat-rufisque"))
    }

    fn credential() -> Credential {
        Credential::new(TOKEN)
    }

    #[tokio::test]
    async fn test_fetch_file_decodes_content() {
        let client = client();
        let file = client.fetch_file(FILE, &credential()).await.unwrap();
        assert_eq!(parse_collection(&file.text).unwrap(), collection("Boulangerie Médina"));
        assert_eq!(Some(file.version), client.transport().sha_of(FILE));
    }

    #[tokio::test]
    async fn test_fetch_missing_file() {
        let client = client();
        let err = client.fetch_file("nope.geojson", &credential()).await.unwrap_err();
        assert!(matches!(err, SyncError::Fetch { status: 404, .. }));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_bad_token_is_auth_error() {
        let client = client();
        let bad = Credential::new("expired");
        assert!(client.fetch_file(FILE, &bad).await.unwrap_err().is_auth());
        assert!(client.validate_credential(&bad).await.unwrap_err().is_auth());
    }

    #[tokio::test]
    async fn test_validate_credential_returns_login() {
        let identity = client().validate_credential(&credential()).await.unwrap();
        assert_eq!(identity.login, "mainteneur");
    }

    #[tokio::test]
    async fn test_unsupported_encoding_is_decode_error() {
        let client = client();
        client.transport().put_raw("big.geojson", "", "none");
        let err = client.fetch_file("big.geojson", &credential()).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Decode {
                source: DecodeError::UnsupportedEncoding(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_commit_advances_version() {
        let client = client();
        let loaded = client.fetch_file(FILE, &credential()).await.unwrap();

        let request = CommitRequest {
            file: DatasetId::new(FILE),
            collection: collection("Boulangerie Médina 2"),
            expected: loaded.version.clone(),
            feature_label: Some("Boulangerie Médina 2".into()),
        };
        let receipt = client.commit(&request, &credential()).await.unwrap();

        assert_ne!(receipt.version, loaded.version);
        assert_eq!(Some(receipt.version.clone()), client.transport().sha_of(FILE));
        assert_eq!(
            client.transport().last_message().as_deref(),
            Some("Update Boulangerie Médina 2 in data/commerces_actifs.geojson")
        );

        let reread = client.fetch_file(FILE, &credential()).await.unwrap();
        assert_eq!(parse_collection(&reread.text).unwrap(), collection("Boulangerie Médina 2"));
    }

    #[tokio::test]
    async fn test_commit_after_remote_moved_is_refused() {
        let client = client();
        let t1 = client.fetch_file(FILE, &credential()).await.unwrap().version;

        // Someone else commits: T1 -> T2.
        client
            .transport()
            .put_file(FILE, &codec::render_collection(&collection("Autre")).unwrap());
        let t2 = client.transport().sha_of(FILE).unwrap();
        assert_ne!(t1, t2);

        let request = CommitRequest {
            file: DatasetId::new(FILE),
            collection: collection("Mine"),
            expected: t1,
            feature_label: None,
        };
        let err = client.commit(&request, &credential()).await.unwrap_err();

        assert!(err.is_conflict_or_failure());
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(client.transport().sha_of(FILE), Some(t2));
        assert_eq!(client.transport().write_count(), 0);
        let text = client.fetch_file(FILE, &credential()).await.unwrap().text;
        assert_eq!(parse_collection(&text).unwrap(), collection("Autre"));
    }

    #[tokio::test]
    async fn test_put_conflict_maps_to_conflict() {
        let client = client();
        let version = client.fetch_file(FILE, &credential()).await.unwrap().version;
        client.transport().move_on_next_write(FILE);

        let request = CommitRequest {
            file: DatasetId::new(FILE),
            collection: collection("Mine"),
            expected: version,
            feature_label: None,
        };
        let err = client.commit(&request, &credential()).await.unwrap_err();
        assert!(matches!(err, SyncError::Conflict { status: 409, .. }));
    }

    #[test]
    fn test_commit_message_fallback() {
        let request = CommitRequest {
            file: DatasetId::new("a.geojson"),
            collection: collection("x"),
            expected: VersionToken::new("1"),
            feature_label: None,
        };
        assert_eq!(request.message(), "Update feature in a.geojson");
    }

    #[test]
    fn test_contents_url_with_branch() {
        let mut repo = RepoConfig::new("owner", "repo");
        repo.branch = Some("gh-pages".into());
        let client = RemoteClient::new(MemoryRemote::new("owner", "repo"), repo);
        let url = client.contents_url("data/a b.geojson", true).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.github.com/repos/owner/repo/contents/data/a%20b.geojson?ref=gh-pages"
        );
    }

    #[test]
    fn test_encoded_payload_matches_codec() {
        assert_eq!(encode_content("é"), "w6k=");
    }
}
