//! In-memory stand-in for the repository contents API.
//!
//! Speaks the same JSON as the real endpoints and enforces the same sha
//! compare-and-swap on writes, so the sync client can be exercised without a
//! network. Remote activity by other users is simulated with [`MemoryRemote::put_file`].

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};
use url::Url;

use crate::capabilities::http::{
    HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpResult, HttpTransport,
};
use crate::codec::{encode_content, BASE64_ENCODING};
use crate::model::VersionToken;

/// Column at which the contents API wraps base64 payloads.
const WRAP_COLUMN: usize = 60;

#[derive(Debug, Clone)]
struct StoredFile {
    content: String,
    encoding: String,
    sha: String,
}

#[derive(Debug, Default)]
struct RemoteState {
    files: HashMap<String, StoredFile>,
    revision: u64,
    writes: usize,
    last_message: Option<String>,
    move_on_write: Option<String>,
    fail_next_write: Option<(u16, String)>,
}

impl RemoteState {
    fn next_sha(&mut self, content: &str) -> String {
        self.revision += 1;
        let mut hasher = DefaultHasher::new();
        content.hash(&mut hasher);
        self.revision.hash(&mut hasher);
        format!("{:016x}{:024x}", hasher.finish(), self.revision)
    }

    fn store(&mut self, key: String, content: String, encoding: &str) -> String {
        let sha = self.next_sha(&content);
        self.files.insert(
            key,
            StoredFile {
                content,
                encoding: encoding.to_string(),
                sha: sha.clone(),
            },
        );
        sha
    }
}

#[derive(Deserialize)]
struct PutBody {
    message: String,
    content: String,
    #[serde(default)]
    sha: Option<String>,
}

pub struct MemoryRemote {
    owner: String,
    name: String,
    token: Option<(String, String)>,
    state: Mutex<RemoteState>,
}

impl MemoryRemote {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            token: None,
            state: Mutex::new(RemoteState::default()),
        }
    }

    /// Only `token` is accepted afterwards; it identifies as `login`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, login: impl Into<String>) -> Self {
        self.token = Some((token.into(), login.into()));
        self
    }

    /// Writes a file out of band, as another collaborator would.
    pub fn put_file(&self, path: &str, text: &str) -> VersionToken {
        let mut state = self.lock();
        VersionToken::new(state.store(Self::key(path), encode_content(text), BASE64_ENCODING))
    }

    pub fn put_raw(&self, path: &str, content: &str, encoding: &str) {
        self.lock()
            .store(Self::key(path), content.to_string(), encoding);
    }

    pub fn sha_of(&self, path: &str) -> Option<VersionToken> {
        self.lock()
            .files
            .get(&Self::key(path))
            .map(|f| VersionToken::new(f.sha.clone()))
    }

    pub fn text_of(&self, path: &str) -> Option<String> {
        let state = self.lock();
        let file = state.files.get(&Self::key(path))?;
        let bytes = STANDARD.decode(&file.content).ok()?;
        String::from_utf8(bytes).ok()
    }

    /// Number of writes accepted through the API.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    pub fn last_message(&self) -> Option<String> {
        self.lock().last_message.clone()
    }

    /// The next API write to `path` finds the file already moved on.
    pub fn move_on_next_write(&self, path: &str) {
        self.lock().move_on_write = Some(Self::key(path));
    }

    pub fn fail_next_write(&self, status: u16, message: impl Into<String>) {
        self.lock().fail_next_write = Some((status, message.into()));
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        // A poisoned lock only means a test panicked mid-write; the map is still usable.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Percent-encoded path, matching what the client puts in request URLs.
    fn key(path: &str) -> String {
        let Ok(mut url) = Url::parse("http://memory.invalid/") else {
            return path.to_string();
        };
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(path.split('/').filter(|s| !s.is_empty()));
        }
        url.path().trim_start_matches('/').to_string()
    }

    fn authorize(&self, request: &HttpRequest) -> Result<Option<String>, HttpResult> {
        let Some((token, login)) = &self.token else {
            return Ok(None);
        };
        let expected = format!("Bearer {token}");
        if request.headers().get("Authorization") == Some(expected.as_str()) {
            Ok(Some(login.clone()))
        } else {
            Err(respond(request, 401, &json!({"message": "Bad credentials"})))
        }
    }

    fn handle(&self, request: &HttpRequest) -> HttpResult {
        let login = match self.authorize(request) {
            Ok(login) => login,
            Err(response) => return response,
        };

        let path = request
            .url()
            .as_str()
            .parse::<Url>()
            .map(|u| u.path().trim_start_matches('/').to_string())
            .unwrap_or_default();

        if path == "user" {
            let login = login.unwrap_or_else(|| "anonymous".into());
            return respond(request, 200, &json!({"login": login, "type": "User"}));
        }

        let prefix = format!("repos/{}/{}/contents/", self.owner, self.name);
        let Some(key) = path.strip_prefix(&prefix) else {
            return respond(request, 404, &json!({"message": "Not Found"}));
        };

        match request.method() {
            HttpMethod::Get => self.get_contents(request, key),
            HttpMethod::Put => self.put_contents(request, key),
        }
    }

    fn get_contents(&self, request: &HttpRequest, key: &str) -> HttpResult {
        let state = self.lock();
        match state.files.get(key) {
            Some(file) => respond(
                request,
                200,
                &json!({
                    "type": "file",
                    "path": key,
                    "sha": file.sha,
                    "encoding": file.encoding,
                    "content": wrap(&file.content),
                }),
            ),
            None => respond(request, 404, &json!({"message": "Not Found"})),
        }
    }

    fn put_contents(&self, request: &HttpRequest, key: &str) -> HttpResult {
        let body: PutBody = match request.body().map(serde_json::from_slice::<PutBody>) {
            Some(Ok(body)) => body,
            _ => return respond(request, 400, &json!({"message": "Problems parsing JSON"})),
        };

        let mut state = self.lock();

        if let Some((status, message)) = state.fail_next_write.take() {
            return respond(request, status, &json!({"message": message}));
        }

        if state.move_on_write.as_deref() == Some(key) {
            state.move_on_write = None;
            if let Some(file) = state.files.get(key).cloned() {
                state.store(key.to_string(), file.content, &file.encoding);
            }
        }

        let current = state.files.get(key).map(|f| f.sha.clone());
        if current != body.sha {
            let message = format!(
                "{key} does not match {}",
                body.sha.as_deref().unwrap_or("nothing")
            );
            return respond(request, 409, &json!({"message": message}));
        }

        if STANDARD.decode(&body.content).is_err() {
            return respond(request, 422, &json!({"message": "content is not valid Base64"}));
        }

        let sha = state.store(key.to_string(), body.content, BASE64_ENCODING);
        state.writes += 1;
        state.last_message = Some(body.message);
        let commit = format!("c{:039x}", state.revision);

        respond(
            request,
            200,
            &json!({
                "content": {"path": key, "sha": sha},
                "commit": {
                    "sha": commit,
                    "html_url": format!("https://github.com/{}/{}/commit/{commit}", self.owner, self.name),
                },
            }),
        )
    }
}

#[async_trait::async_trait]
impl HttpTransport for MemoryRemote {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        if request.headers().get("Accept").is_none() {
            return Err(HttpError::InvalidRequest {
                reason: "missing Accept header".into(),
            });
        }
        self.handle(&request)
    }
}

fn respond(request: &HttpRequest, status: u16, body: &serde_json::Value) -> HttpResult {
    let mut headers = HttpHeaders::new();
    headers.insert("Content-Type", "application/json; charset=utf-8")?;
    Ok(HttpResponse::new(
        status,
        headers,
        body.to_string().into_bytes(),
        request.request_id().to_string(),
    ))
}

fn wrap(content: &str) -> String {
    let mut out = String::with_capacity(content.len() + content.len() / WRAP_COLUMN + 1);
    for (i, c) in content.chars().enumerate() {
        if i > 0 && i % WRAP_COLUMN == 0 {
            out.push('\n');
        }
        out.push(c);
    }
    out.push('\n');
    out
}
