//! Embedded read-only smart-HTTP git server (spec §4.2).
//!
//! Serves local directories and local git repositories, cloned or copied
//! into a private scratch directory, under random names. The wire protocol
//! is hand-rolled against the `git-upload-pack` binary (pkt-line framing),
//! not `git http-backend`, matching spec §4.2/§6 exactly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use git2::{Repository, Signature};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use warp::http::{Response, StatusCode};
use warp::hyper::Body;
use warp::Filter;

use crate::error::GitServerError;

fn random_name() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

fn canonical_key(path: &Path) -> Result<String, GitServerError> {
    Ok(path
        .canonicalize()
        .map_err(GitServerError::Io)?
        .to_string_lossy()
        .into_owned())
}

#[derive(Default)]
struct Tables {
    repos: HashMap<String, String>,
    paths: HashMap<String, String>,
}

/// The embedded git server (spec §4.2).
pub struct GitServer {
    scratch_dir: TempDir,
    tables: Mutex<Tables>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl GitServer {
    /// Allocate a scratch directory and verify `git` is invocable.
    pub async fn new() -> Result<Arc<Self>, GitServerError> {
        let output = Command::new("git")
            .arg("--version")
            .output()
            .await
            .map_err(GitServerError::GitNotFound)?;
        if !output.status.success() {
            return Err(GitServerError::GitNotFound(std::io::Error::new(
                std::io::ErrorKind::Other,
                "git --version failed",
            )));
        }
        let scratch_dir = TempDir::new().map_err(GitServerError::ScratchDir)?;
        Ok(Arc::new(Self {
            scratch_dir,
            tables: Mutex::new(Tables::default()),
            shutdown_tx: Mutex::new(None),
            serve_task: Mutex::new(None),
        }))
    }

    fn scratch_path(&self, name: &str) -> PathBuf {
        self.scratch_dir.path().join(name)
    }

    /// Mirror-clone a local git repository and serve it under a fresh
    /// random name. Idempotent per source path; a failed add leaves no
    /// cached entry.
    pub async fn add_repository(&self, path: &Path) -> Result<String, GitServerError> {
        let key = canonical_key(path)?;
        {
            let tables = self.tables.lock().await;
            if let Some(name) = tables.repos.get(&key) {
                return Ok(name.clone());
            }
        }
        let name = random_name();
        let dest = self.scratch_path(&name);
        match self.clone_mirror(path, &dest).await {
            Ok(()) => {
                let mut tables = self.tables.lock().await;
                tables.repos.insert(key, name.clone());
                Ok(name)
            }
            Err(err) => {
                let _ = tokio::fs::remove_dir_all(&dest).await;
                Err(err)
            }
        }
    }

    async fn clone_mirror(&self, src: &Path, dest: &Path) -> Result<(), GitServerError> {
        let status = Command::new("git")
            .arg("clone")
            .arg("--mirror")
            .arg(src)
            .arg(dest)
            .status()
            .await
            .map_err(GitServerError::Io)?;
        if !status.success() {
            return Err(GitServerError::Clone {
                path: src.display().to_string(),
                source: anyhow::anyhow!("git clone --mirror exited with {status}"),
            });
        }

        // Create a fresh local branch at HEAD so a clone from the served
        // URL can resolve HEAD even if the source's HEAD was detached.
        let repo = Repository::open_bare(dest).map_err(GitServerError::Git2)?;
        let head_commit = repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(GitServerError::Git2)?;
        let branch_name = format!("scanhive-{}", random_name());
        repo.branch(&branch_name, &head_commit, false)
            .map_err(GitServerError::Git2)?;
        repo.set_head(&format!("refs/heads/{branch_name}"))
            .map_err(GitServerError::Git2)?;
        Ok(())
    }

    /// Copy a local file or directory into a fresh synthetic git repository
    /// with a single commit, and serve it under a fresh random name.
    /// Idempotent per source path; a failed add leaves no cached entry.
    pub async fn add_path(&self, path: &Path) -> Result<String, GitServerError> {
        let key = canonical_key(path)?;
        {
            let tables = self.tables.lock().await;
            if let Some(name) = tables.paths.get(&key) {
                return Ok(name.clone());
            }
        }
        let name = random_name();
        let dest = self.scratch_path(&name);
        match self.materialize_path(path, &dest).await {
            Ok(()) => {
                let mut tables = self.tables.lock().await;
                tables.paths.insert(key, name.clone());
                Ok(name)
            }
            Err(err) => {
                let _ = tokio::fs::remove_dir_all(&dest).await;
                Err(err)
            }
        }
    }

    async fn materialize_path(&self, src: &Path, dest: &Path) -> Result<(), GitServerError> {
        let src = src.to_path_buf();
        let dest_clone = dest.to_path_buf();
        tokio::task::spawn_blocking(move || copy_skipping_git(&src, &dest_clone))
            .await
            .map_err(|e| GitServerError::AddPath {
                path: src.display().to_string(),
                source: anyhow::anyhow!(e),
            })?
            .map_err(|e| GitServerError::AddPath {
                path: src.display().to_string(),
                source: e,
            })?;

        let repo = Repository::init(dest).map_err(GitServerError::Git2)?;
        let mut index = repo.index().map_err(GitServerError::Git2)?;
        index
            .add_all(["*"], git2::IndexAddOption::DEFAULT, None)
            .map_err(GitServerError::Git2)?;
        index.write().map_err(GitServerError::Git2)?;
        let tree_id = index.write_tree().map_err(GitServerError::Git2)?;
        let tree = repo.find_tree(tree_id).map_err(GitServerError::Git2)?;
        let signature = Signature::new(
            "scanhive",
            "scanhive@localhost",
            &git2::Time::new(0, 0),
        )
        .map_err(GitServerError::Git2)?;
        repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            "synthetic commit for local target",
            &tree,
            &[],
        )
        .map_err(GitServerError::Git2)?;
        Ok(())
    }

    /// Bind a listener on `addr` and start serving in the background.
    /// Returns the bound address.
    pub async fn listen_and_serve(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<SocketAddr, GitServerError> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(GitServerError::Io)?;
        let local_addr = listener.local_addr().map_err(GitServerError::Io)?;
        self.serve(listener).await?;
        Ok(local_addr)
    }

    /// Serve on an already-bound listener. Spawns the request loop as a
    /// background task.
    pub async fn serve(
        self: &Arc<Self>,
        listener: tokio::net::TcpListener,
    ) -> Result<(), GitServerError> {
        let scratch_root = self.scratch_dir.path().to_path_buf();
        let routes = routes(scratch_root);
        let (tx, rx) = oneshot::channel::<()>();
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
        let server_fut = warp::serve(routes).run_incoming(incoming);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = server_fut => {}
                _ = rx => {}
            }
        });
        *self.shutdown_tx.lock().await = Some(tx);
        *self.serve_task.lock().await = Some(handle);
        Ok(())
    }

    /// Shut down the HTTP server and remove the scratch directory's
    /// contents. The `TempDir` itself is removed on drop.
    pub async fn close(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.serve_task.lock().await.take() {
            let _ = handle.await;
        }
        info!("git server closed, scratch dir {:?}", self.scratch_dir.path());
    }
}

/// Recursively copy `src` into `dest`, skipping `.git` directories and
/// git submodule marker files (a file literally named `.git`).
fn copy_skipping_git(src: &Path, dest: &Path) -> anyhow::Result<()> {
    if src.is_dir() {
        std::fs::create_dir_all(dest)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            if entry.file_name() == ".git" {
                continue;
            }
            let from = entry.path();
            let to = dest.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                copy_skipping_git(&from, &to)?;
            } else {
                std::fs::copy(&from, &to)?;
            }
        }
    } else {
        std::fs::create_dir_all(dest)?;
        let file_name = src
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("path has no file name"))?;
        std::fs::copy(src, dest.join(file_name))?;
    }
    Ok(())
}

/// pkt-line-frame the `# service=git-upload-pack\n` announcement, per spec
/// §4.2/§6.
fn pkt_line_service_announcement(service: &str) -> Vec<u8> {
    let announcement = format!("# service={service}\n");
    let pkt_len = announcement.len() + 4;
    let mut buf = Vec::new();
    buf.extend_from_slice(format!("{pkt_len:04x}").as_bytes());
    buf.extend_from_slice(announcement.as_bytes());
    buf.extend_from_slice(b"0000");
    buf
}

async fn handle_info_refs(
    name: String,
    query_raw: String,
    scratch_root: PathBuf,
) -> Result<Response<Body>, warp::Rejection> {
    let service = url::form_urlencoded::parse(query_raw.as_bytes())
        .find(|(k, _)| k == "service")
        .map(|(_, v)| v.into_owned());
    if service.as_deref() != Some("git-upload-pack") {
        return Ok(Response::builder()
            .status(StatusCode::FORBIDDEN)
            .body(Body::empty())
            .unwrap());
    }
    let repo_path = scratch_root.join(&name);
    if !repo_path.exists() {
        return Ok(not_found());
    }
    let output = Command::new("git-upload-pack")
        .arg("--advertise-refs")
        .arg(&repo_path)
        .output()
        .await;
    let output = match output {
        Ok(o) if o.status.success() => o,
        _ => return Ok(server_error()),
    };

    let mut body = pkt_line_service_announcement("git-upload-pack");
    body.extend_from_slice(&output.stdout);

    Ok(Response::builder()
        .header(
            "Content-Type",
            "application/x-git-upload-pack-advertisement",
        )
        .body(Body::from(body))
        .unwrap())
}

async fn handle_upload_pack<S, B>(
    name: String,
    body: S,
    scratch_root: PathBuf,
) -> Result<Response<Body>, warp::Rejection>
where
    S: futures::Stream<Item = Result<B, warp::Error>> + Send + Unpin + 'static,
    B: bytes::Buf + Sized,
{
    let repo_path = scratch_root.join(&name);
    if !repo_path.exists() {
        return Ok(not_found());
    }

    let mut cmd = Command::new("git-upload-pack");
    cmd.arg("--stateless-rpc").arg(&repo_path);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(err) => {
            warn!("failed to spawn git-upload-pack: {err}");
            return Ok(server_error());
        }
    };

    let mut stdin = child.stdin.take().expect("stdin piped");
    let mut body = Box::pin(body);
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(mut buf) => {
                if stdin.write_all_buf(&mut buf).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    drop(stdin);

    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut out = BytesMut::new();
    let _ = stdout.read_buf(&mut out).await;
    let mut rest = Vec::new();
    let _ = stdout.read_to_end(&mut rest).await;
    out.extend_from_slice(&rest);

    Ok(Response::builder()
        .header("Content-Type", "application/x-git-upload-pack-result")
        .body(Body::from(Bytes::from(out)))
        .unwrap())
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::empty())
        .unwrap()
}

fn server_error() -> Response<Body> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(Body::empty())
        .unwrap()
}

fn routes(
    scratch_root: PathBuf,
) -> impl Filter<Extract = (Response<Body>,), Error = warp::Rejection> + Clone {
    let root1 = scratch_root.clone();
    let info_refs = warp::get()
        .and(warp::path::param())
        .and(warp::path("info"))
        .and(warp::path("refs"))
        .and(warp::path::end())
        .and(
            warp::query::raw()
                .or_else(|_| async { Ok::<(String,), warp::Rejection>((String::new(),)) }),
        )
        .and_then(move |name: String, query_raw: String| {
            let root = root1.clone();
            async move { handle_info_refs(name, query_raw, root).await }
        });

    let root2 = scratch_root;
    let upload_pack = warp::post()
        .and(warp::path::param())
        .and(warp::path("git-upload-pack"))
        .and(warp::path::end())
        .and(warp::body::stream())
        .and_then(move |name: String, body| {
            let root = root2.clone();
            async move { handle_upload_pack(name, body, root).await }
        });

    info_refs.or(upload_pack).unify()
}
