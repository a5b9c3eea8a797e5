use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use nostr::{PublicKey, ToBech32};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

use crate::{
    auth::{verify_nip98, AuthError},
    cache::EventCache,
    client::{Client, Connect, DeletionScanner},
    config::Settings,
    error::GatewayError,
    git::{worktree::WorktreeEngine, Repo, RepoActions, RepoPath},
    mutation::FileManager,
    policy::{BranchUpdate, PolicyResolver, RepoPolicy},
};

const CGI_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const CGI_KILL_GRACE: Duration = Duration::from_secs(5);
const ZERO_OID: &str = "0000000000000000000000000000000000000000";

/// Everything a request handler needs, wired once at startup and handed to
/// the router as state.
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub connect: Arc<dyn Connect>,
    pub cache: Arc<EventCache>,
    pub policy: Arc<PolicyResolver>,
    pub engine: Arc<WorktreeEngine>,
    pub files: Arc<FileManager>,
    pub scanner: Arc<DeletionScanner>,
}

impl AppContext {
    pub fn build(settings: Settings, keys: Option<nostr::Keys>) -> Result<Arc<Self>> {
        let settings = Arc::new(settings);
        let client = Arc::new(Client::new(keys));
        let cache = EventCache::open(&settings.cache_db_path(), client.clone())?;
        let policy = Arc::new(PolicyResolver::new(cache.clone(), settings.clone()));
        let engine = Arc::new(WorktreeEngine::default());
        let files = Arc::new(FileManager::new(
            engine.clone(),
            policy.clone(),
            client.clone(),
            cache.clone(),
            settings.clone(),
        ));
        Ok(Arc::new(AppContext {
            settings,
            connect: client,
            cache,
            policy,
            engine,
            files,
            scanner: Arc::new(DeletionScanner::default()),
        }))
    }

    fn default_relays(&self) -> Vec<nostr_sdk::RelayUrl> {
        self.settings
            .relay_default_set
            .iter()
            .filter_map(|r| nostr_sdk::RelayUrl::parse(r).ok())
            .collect()
    }

    /// Resolve policy for a repository and kick the deletion scanner behind
    /// the fetch, per the relay client's deletion-handling contract.
    async fn resolve_policy(&self, repo_path: &RepoPath) -> Result<RepoPolicy, GatewayError> {
        let repo = Repo::open(repo_path).ok();
        let policy = self
            .policy
            .repo_policy(&repo_path.owner, &repo_path.name, repo.as_ref())
            .await
            .map_err(|e| GatewayError::Backend(e.to_string()))?;

        let connect = self.connect.clone();
        let cache = self.cache.clone();
        let scanner = self.scanner.clone();
        let relays = self.default_relays();
        tokio::spawn(async move {
            scanner.scan(connect.as_ref(), &cache, relays).await;
        });

        Ok(policy)
    }
}

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .fallback(git_http)
        .with_state(ctx)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GitService {
    UploadPack,
    ReceivePack,
}

impl GitService {
    fn from_query(service: &str) -> Option<Self> {
        match service {
            "git-upload-pack" => Some(GitService::UploadPack),
            "git-receive-pack" => Some(GitService::ReceivePack),
            _ => None,
        }
    }

    fn advertisement_content_type(self) -> &'static str {
        match self {
            GitService::UploadPack => "application/x-git-upload-pack-advertisement",
            GitService::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    fn result_content_type(self) -> &'static str {
        match self {
            GitService::UploadPack => "application/x-git-upload-pack-result",
            GitService::ReceivePack => "application/x-git-receive-pack-result",
        }
    }
}

struct GitRequest {
    owner_npub: String,
    repo_name: String,
    git_path: String,
}

/// `<owner-npub>/<repo-name>.git[/<git-path>]`; anything else is a 400.
fn parse_git_path(path: &str) -> Result<GitRequest, GatewayError> {
    let mut segments = path.trim_start_matches('/').splitn(3, '/');
    let owner_npub = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::Validation("expected /<npub>/<repo>.git/...".to_string()))?;
    let repo_segment = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::Validation("expected /<npub>/<repo>.git/...".to_string()))?;
    let repo_name = repo_segment
        .strip_suffix(".git")
        .ok_or_else(|| GatewayError::Validation("repository path must end in .git".to_string()))?;
    let git_path = segments.next().unwrap_or_default();
    Ok(GitRequest {
        owner_npub: owner_npub.to_string(),
        repo_name: repo_name.to_string(),
        git_path: git_path.to_string(),
    })
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == name {
            urlencoding::decode(value).ok().map(|v| v.to_string())
        } else {
            None
        }
    })
}

async fn git_http(
    State(ctx): State<Arc<AppContext>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let request = parse_git_path(uri.path())?;
    let repo_path = RepoPath::resolve(
        &ctx.settings.repo_root,
        &request.owner_npub,
        &request.repo_name,
    )
    .map_err(|e| GatewayError::Validation(e.to_string()))?;
    if !repo_path.exists() {
        return Err(GatewayError::NotFound("unknown repository".to_string()));
    }

    let query = uri.query().unwrap_or_default().to_string();
    let service = query_param(&query, "service").and_then(|s| GitService::from_query(&s));
    let expected_url = format!(
        "{}{}",
        ctx.settings.public_url_base(),
        uri.path_and_query().map_or_else(
            || uri.path().to_string(),
            |pq| pq.as_str().to_string()
        )
    );

    if method == Method::GET {
        if request.git_path == "info/refs" && service == Some(GitService::ReceivePack) {
            receive_pack_advertisement(&ctx, &repo_path, &request, &headers, &expected_url, &query)
                .await
        } else {
            read_request(&ctx, &repo_path, &request, &headers, &expected_url, &query, service)
                .await
        }
    } else if method == Method::POST && request.git_path == "git-upload-pack" {
        upload_pack(&ctx, &repo_path, &request, &headers, &expected_url, &body).await
    } else if method == Method::POST && request.git_path == "git-receive-pack" {
        receive_pack(&ctx, &repo_path, &request, &headers, &expected_url, &body).await
    } else {
        Err(GatewayError::Validation(
            "unsupported git request".to_string(),
        ))
    }
}

/// GET advertisement and dumb-protocol reads, plus POST-free upload-pack
/// paths. Public repositories answer anonymously; private ones demand
/// NIP-98 and view access.
async fn read_request(
    ctx: &Arc<AppContext>,
    repo_path: &RepoPath,
    request: &GitRequest,
    headers: &HeaderMap,
    expected_url: &str,
    query: &str,
    service: Option<GitService>,
) -> Result<Response, GatewayError> {
    let policy = ctx.resolve_policy(repo_path).await?;
    if policy.private {
        let actor = require_nip98(headers, expected_url, "GET", None)?;
        if !policy.can_view(Some(&actor)) {
            return Err(GatewayError::Permission(forbidden_view_body(
                ctx, &actor, &policy,
            )));
        }
    }

    let output = run_cgi(ctx, repo_path, request, "GET", query, headers, &[]).await?;
    let content_type = match service {
        Some(service) => service.advertisement_content_type(),
        None if request.git_path == "info/refs" => "text/plain; charset=utf-8",
        None => output.content_type.as_deref().unwrap_or("application/octet-stream"),
    };
    Ok(git_response(content_type, service.is_some(), output.body))
}

/// The receive-pack advertisement always demands authentication: without a
/// 401 challenge here git never invokes the credential helper. The signed
/// event may be bound to this URL or already to the push endpoint the
/// helper rewrites to.
async fn receive_pack_advertisement(
    ctx: &Arc<AppContext>,
    repo_path: &RepoPath,
    request: &GitRequest,
    headers: &HeaderMap,
    expected_url: &str,
    query: &str,
) -> Result<Response, GatewayError> {
    let push_url = expected_url
        .split_once('?')
        .map(|(path, _)| path.replace("/info/refs", "/git-receive-pack"))
        .unwrap_or_else(|| expected_url.to_string());

    let header = auth_header(headers).ok_or(GatewayError::Auth(AuthError::MissingAuth))?;
    let actor = match verify_nip98(header, &push_url, "POST", None) {
        Ok(actor) => actor,
        Err(_) => verify_nip98(header, expected_url, "GET", None)?,
    };

    let policy = ctx.resolve_policy(repo_path).await?;
    if !policy.can_push(&actor) {
        return Err(GatewayError::Permission(forbidden_push_body(
            ctx, &actor, &policy,
        )));
    }

    let output = run_cgi(ctx, repo_path, request, "GET", query, headers, &[]).await?;
    Ok(git_response(
        GitService::ReceivePack.advertisement_content_type(),
        true,
        output.body,
    ))
}

async fn upload_pack(
    ctx: &Arc<AppContext>,
    repo_path: &RepoPath,
    request: &GitRequest,
    headers: &HeaderMap,
    expected_url: &str,
    body: &Bytes,
) -> Result<Response, GatewayError> {
    let policy = ctx.resolve_policy(repo_path).await?;
    if policy.private {
        let actor = require_nip98(headers, expected_url, "POST", Some(body))?;
        if !policy.can_view(Some(&actor)) {
            return Err(GatewayError::Permission(forbidden_view_body(
                ctx, &actor, &policy,
            )));
        }
    }

    let output = run_cgi(ctx, repo_path, request, "POST", "", headers, body).await?;
    Ok(git_response(
        GitService::UploadPack.result_content_type(),
        false,
        output.body,
    ))
}

async fn receive_pack(
    ctx: &Arc<AppContext>,
    repo_path: &RepoPath,
    request: &GitRequest,
    headers: &HeaderMap,
    expected_url: &str,
    body: &Bytes,
) -> Result<Response, GatewayError> {
    let header = auth_header(headers).ok_or(GatewayError::Auth(AuthError::MissingAuth))?;
    let actor = verify_nip98(header, expected_url, "POST", Some(body))?;

    let policy = ctx.resolve_policy(repo_path).await?;
    if !policy.can_push(&actor) {
        return Err(GatewayError::Permission(forbidden_push_body(
            ctx, &actor, &policy,
        )));
    }

    let repo = Repo::open(repo_path).map_err(|e| GatewayError::Backend(e.to_string()))?;
    let updates = parse_receive_pack_updates(body)?;
    for update in &updates {
        let branch_update = to_branch_update(&repo, update);
        if !policy.can_push_to_branch(&actor, &branch_update) {
            info!(
                branch = %branch_update.branch,
                actor = %actor,
                "push blocked by branch protection"
            );
            return Err(GatewayError::Permission(forbidden_push_body(
                ctx, &actor, &policy,
            )));
        }
    }

    repo.ensure_receive_pack_enabled()
        .map_err(|e| GatewayError::Backend(e.to_string()))?;

    let output = run_cgi(ctx, repo_path, request, "POST", "", headers, body).await?;

    let ctx_for_mirrors = ctx.clone();
    let repo_path_for_mirrors = repo_path.clone();
    tokio::spawn(async move {
        mirror_fanout(&ctx_for_mirrors, &repo_path_for_mirrors).await;
    });

    Ok(git_response(
        GitService::ReceivePack.result_content_type(),
        false,
        output.body,
    ))
}

fn auth_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::AUTHORIZATION)?.to_str().ok()
}

fn require_nip98(
    headers: &HeaderMap,
    expected_url: &str,
    method: &str,
    body: Option<&[u8]>,
) -> Result<PublicKey, GatewayError> {
    let header = auth_header(headers).ok_or(GatewayError::Auth(AuthError::MissingAuth))?;
    Ok(verify_nip98(header, expected_url, method, body)?)
}

fn git_response(content_type: &str, no_cache: bool, body: Vec<u8>) -> Response {
    if no_cache {
        (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            body,
        )
            .into_response()
    } else {
        (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response()
    }
}

fn npub_prefix(pubkey: &PublicKey) -> String {
    pubkey
        .to_bech32()
        .map(|npub| npub.chars().take(12).collect())
        .unwrap_or_default()
}

fn forbidden_push_body(ctx: &AppContext, actor: &PublicKey, policy: &RepoPolicy) -> String {
    let mut body = format!(
        "push denied for {}.\n\nthis repository accepts pushes from:\n  owner: {}",
        npub_prefix(actor),
        npub_prefix(&policy.current_owner),
    );
    if let Some(name) = ctx.policy.profile_name(&policy.current_owner) {
        body.push_str(&format!(" ({name})"));
    }
    body.push('\n');
    if policy.maintainers.is_empty() {
        body.push_str("  maintainers: none\n");
    } else {
        body.push_str("  maintainers:\n");
        for maintainer in &policy.maintainers {
            body.push_str(&format!("    - {}", npub_prefix(maintainer)));
            if let Some(name) = ctx.policy.profile_name(maintainer) {
                body.push_str(&format!(" ({name})"));
            }
            body.push('\n');
        }
    }
    body.push_str(
        "\nto push here, ask the owner to add your npub to the maintainers list,\nor to transfer ownership to you.\n",
    );
    body
}

fn forbidden_view_body(ctx: &AppContext, actor: &PublicKey, policy: &RepoPolicy) -> String {
    let mut body = forbidden_push_body(ctx, actor, policy);
    body.insert_str(0, "this repository is private.\n");
    body
}

/// One `<old> <new> refs/heads/<branch>` line of the receive-pack preamble.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefUpdate {
    pub old: String,
    pub new: String,
    pub branch: String,
}

/// Parse the pkt-line preamble of a receive-pack body: each line is
/// `<old> <new> <ref>`, the first suffixed with a NUL and the client's
/// capability list. Only `refs/heads/*` updates are returned; control
/// characters in branch names are refused outright.
pub fn parse_receive_pack_updates(body: &[u8]) -> Result<Vec<RefUpdate>, GatewayError> {
    let mut updates = vec![];
    let mut pos = 0;

    while pos + 4 <= body.len() {
        let len_str = std::str::from_utf8(&body[pos..pos + 4])
            .map_err(|_| GatewayError::Validation("malformed pkt-line length".to_string()))?;
        let len = usize::from_str_radix(len_str, 16)
            .map_err(|_| GatewayError::Validation("malformed pkt-line length".to_string()))?;
        if len == 0 {
            break;
        }
        if len < 4 || pos + len > body.len() {
            return Err(GatewayError::Validation(
                "truncated pkt-line in receive-pack preamble".to_string(),
            ));
        }
        let line = &body[pos + 4..pos + len];
        pos += len;

        let line = std::str::from_utf8(line)
            .map_err(|_| GatewayError::Validation("non-utf8 receive-pack preamble".to_string()))?;
        // the first line carries "\0capability list" after the ref name
        let line = line.split('\0').next().unwrap_or(line).trim_end_matches('\n');

        let mut parts = line.splitn(3, ' ');
        let (Some(old), Some(new), Some(ref_name)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let Some(branch) = ref_name.strip_prefix("refs/heads/") else {
            continue;
        };
        if branch.chars().any(char::is_control) {
            return Err(GatewayError::Validation(
                "branch name contains control characters".to_string(),
            ));
        }
        updates.push(RefUpdate {
            old: old.to_string(),
            new: new.to_string(),
            branch: branch.to_string(),
        });
    }

    Ok(updates)
}

fn to_branch_update(repo: &Repo, update: &RefUpdate) -> BranchUpdate {
    let is_delete = update.new == ZERO_OID;
    let is_force = if update.old == ZERO_OID || is_delete {
        false
    } else {
        !repo.is_fast_forward(&update.old, &update.new).unwrap_or(false)
    };
    BranchUpdate {
        branch: update.branch.clone(),
        is_delete,
        is_force,
    }
}

struct CgiOutput {
    content_type: Option<String>,
    body: Vec<u8>,
}

/// Spawn `git http-backend` with a whitelisted environment, feed it the
/// request, and strip the CGI headers from its output. A run past the
/// wall-clock budget is terminated, SIGTERM first, SIGKILL after a grace
/// period.
async fn run_cgi(
    ctx: &AppContext,
    repo_path: &RepoPath,
    request: &GitRequest,
    method: &str,
    query: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<CgiOutput, GatewayError> {
    let path_info = format!("/{}.git/{}", request.repo_name, request.git_path);

    let mut cmd = tokio::process::Command::new("git");
    cmd.arg("http-backend");
    cmd.env_clear();
    for passthrough in ["PATH", "HOME", "USER", "LANG", "LC_ALL", "TZ"] {
        if let Ok(value) = std::env::var(passthrough) {
            cmd.env(passthrough, value);
        }
    }
    cmd.env("GIT_PROJECT_ROOT", &repo_path.owner_dir)
        .env("GIT_HTTP_EXPORT_ALL", "1")
        .env("REQUEST_METHOD", method)
        .env("PATH_INFO", &path_info)
        .env("QUERY_STRING", query)
        .env("CONTENT_LENGTH", body.len().to_string());
    if let Some(content_type) = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        cmd.env("CONTENT_TYPE", content_type);
    }
    if let Some(user_agent) = headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()) {
        cmd.env("HTTP_USER_AGENT", user_agent);
    }
    if let Some(authorization) = auth_header(headers) {
        cmd.env("HTTP_AUTHORIZATION", authorization);
    }
    cmd.stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| GatewayError::Backend(format!("failed to spawn git http-backend: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        use tokio::io::AsyncWriteExt;
        stdin
            .write_all(body)
            .await
            .map_err(|e| GatewayError::Backend(format!("failed to feed git http-backend: {e}")))?;
    }
    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");

    let collected = tokio::time::timeout(CGI_TIMEOUT, async {
        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await?;
        let mut err = Vec::new();
        stderr.read_to_end(&mut err).await?;
        let status = child.wait().await?;
        std::io::Result::Ok((status, out, err))
    })
    .await;

    let (status, out, err) = match collected {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            return Err(GatewayError::Backend(format!(
                "git http-backend io failure: {e}"
            )))
        }
        Err(_elapsed) => {
            terminate(&mut child).await;
            return Err(GatewayError::Timeout);
        }
    };

    if !status.success() && out.is_empty() {
        error!(
            stderr = %String::from_utf8_lossy(&err),
            "git http-backend exited non-zero"
        );
        return Err(GatewayError::Backend(
            "git backend failed to service the request".to_string(),
        ));
    }

    let (cgi_headers, payload) = strip_cgi_headers(&out)?;
    Ok(CgiOutput {
        content_type: cgi_headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.clone()),
        body: payload,
    })
}

async fn terminate(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
    if tokio::time::timeout(CGI_KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

/// CGI output opens with HTTP-style headers and a blank line; everything
/// after the blank line is the protocol payload the client gets.
pub fn strip_cgi_headers(output: &[u8]) -> Result<(Vec<(String, String)>, Vec<u8>), GatewayError> {
    let boundary = find_header_boundary(output).ok_or_else(|| {
        GatewayError::Backend("git backend produced no cgi header block".to_string())
    })?;
    let (header_bytes, rest) = output.split_at(boundary.0);
    let headers = std::str::from_utf8(header_bytes)
        .map_err(|_| GatewayError::Backend("git backend produced non-utf8 headers".to_string()))?
        .lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();
    Ok((headers, rest[boundary.1..].to_vec()))
}

fn find_header_boundary(output: &[u8]) -> Option<(usize, usize)> {
    let crlf = output.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = output.windows(2).position(|w| w == b"\n\n");
    match (crlf, lf) {
        (Some(c), Some(l)) if c <= l => Some((c, 4)),
        (Some(_), Some(l)) => Some((l, 2)),
        (Some(c), None) => Some((c, 4)),
        (None, Some(l)) => Some((l, 2)),
        (None, None) => None,
    }
}

/// Push the fresh refs to every clone URL in the announcement except our
/// own. Failures are logged and swallowed; mirrors are advisory.
async fn mirror_fanout(ctx: &AppContext, repo_path: &RepoPath) {
    let repo = Repo::open(repo_path).ok();
    let announcement = match ctx
        .policy
        .announcement(&repo_path.owner, &repo_path.name, repo.as_ref())
        .await
    {
        Ok(Some(announcement)) => announcement,
        Ok(None) => return,
        Err(error) => {
            debug!(%error, "mirror fan-out skipped, no announcement");
            return;
        }
    };

    let local_prefixes = ctx.settings.local_url_prefixes();
    for url in announcement
        .clone_urls
        .iter()
        .filter(|url| !local_prefixes.iter().any(|prefix| url.starts_with(prefix)))
    {
        match push_mirror(&repo_path.bare_dir, url).await {
            Ok(()) => info!(mirror = %url, "mirror updated"),
            Err(error) => warn!(mirror = %url, %error, "mirror push failed"),
        }
    }
}

async fn push_mirror(bare_dir: &Path, url: &str) -> Result<()> {
    let output = tokio::process::Command::new("git")
        .args(["push", "--mirror", url])
        .current_dir(bare_dir)
        .output()
        .await
        .context("failed to spawn git push")?;
    if !output.status.success() {
        anyhow::bail!(
            "git push --mirror exited non-zero: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
