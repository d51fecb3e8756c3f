//! The build-request handler: one HTTP POST in, one executed action out.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use md5::{Digest, Md5};
use prost::Message;
use tracing::{debug, info, warn};

use kiln_cache::{DiskCache, Store, materialize_inputs};
use kiln_proto::{CacheEntry, FileEntry, RemoteWorkRequest, RemoteWorkResponse};

/// How long one action will wait for any single input fetch.
const ENSURE_TIMEOUT: Duration = Duration::from_secs(600);

/// Per-process worker state behind a cheap clone.
pub struct Worker<S> {
    inner: Arc<WorkerInner<S>>,
}

impl<S> Clone for Worker<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> std::ops::Deref for Worker<S> {
    type Target = WorkerInner<S>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

pub struct WorkerInner<S> {
    store: S,
    cache: DiskCache<S>,

    /// Per-action sandboxes are temp dirs created under here.
    workdir_root: Utf8PathBuf,

    /// Log executed argument vectors, and stdout/stderr when actions fail.
    log_commands: bool,
}

impl<S: Store> Worker<S> {
    pub fn new(
        store: S,
        cache: DiskCache<S>,
        workdir_root: Utf8PathBuf,
        log_commands: bool,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                store,
                cache,
                workdir_root,
                log_commands,
            }),
        }
    }

    /// HTTP entry point. Every response, success or failure, carries a
    /// binary-encoded [`RemoteWorkResponse`].
    pub async fn handle(
        &self,
        request: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let body = match request.into_body().collect().await {
            Ok(body) => body.to_bytes(),
            Err(e) => {
                return Ok(infrastructure_failure(format!(
                    "failed to read request body: {}",
                    e
                )));
            }
        };

        Ok(self.handle_bytes(body.as_ref()).await)
    }

    async fn handle_bytes(&self, body: &[u8]) -> Response<Full<Bytes>> {
        match RemoteWorkRequest::decode(body) {
            Ok(request) => self.run_action(request).await,
            Err(e) => infrastructure_failure(format!("failed to decode work request: {}", e)),
        }
    }

    /// Run one build action: sandbox, materialize, execute, publish.
    async fn run_action(&self, request: RemoteWorkRequest) -> Response<Full<Bytes>> {
        // Dropping the guard removes the sandbox on every exit path.
        let workdir = match tempfile::Builder::new()
            .prefix("workdir")
            .tempdir_in(self.workdir_root.as_std_path())
        {
            Ok(dir) => dir,
            Err(e) => {
                return infrastructure_failure(format!("failed to create workdir: {}", e));
            }
        };
        let sandbox = match Utf8PathBuf::from_path_buf(workdir.path().to_path_buf()) {
            Ok(path) => path,
            Err(path) => {
                return infrastructure_failure(format!(
                    "workdir path is not UTF-8: {}",
                    path.display()
                ));
            }
        };
        debug!(sandbox = %sandbox, inputs = request.input_files.len(), "created sandbox");

        if let Err(e) =
            materialize_inputs(&self.cache, &request.input_files, &sandbox, ENSURE_TIMEOUT).await
        {
            return infrastructure_failure(format!("failed to materialize inputs: {}", e));
        }

        // Most actions expect their output directories to exist up front.
        for output in &request.output_files {
            let path = sandbox.join(&output.path);
            if let Some(parent) = path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return infrastructure_failure(format!(
                        "failed to create output directory {}: {}",
                        parent, e
                    ));
                }
            }
        }

        let Some((program, args)) = request.arguments.split_first() else {
            return infrastructure_failure("empty argument vector".to_string());
        };

        if self.log_commands {
            info!(arguments = ?request.arguments, "executing");
        }

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .current_dir(&sandbox)
            .env_clear()
            .envs(&request.environment);

        let output = match command.output().await {
            Ok(output) => output,
            Err(e) => {
                return action_failure(
                    String::new(),
                    String::new(),
                    format!("failed to execute {}: {}", program, e),
                );
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            if self.log_commands {
                warn!(status = %output.status, arguments = ?request.arguments, "execution failed");
                warn!("stdout:\n{}", stdout);
                warn!("stderr:\n{}", stderr);
            }
            return action_failure(stdout, stderr, format!("action exited with {}", output.status));
        }

        self.publish_outputs(&request, &sandbox, stdout, stderr).await
    }

    /// Hash every produced file, publish each as a blob wrapper under its
    /// content key, then publish the action record under the request's
    /// output key.
    async fn publish_outputs(
        &self,
        request: &RemoteWorkRequest,
        sandbox: &Utf8Path,
        stdout: String,
        stderr: String,
    ) -> Response<Full<Bytes>> {
        let mut action_record = CacheEntry::default();

        for output in &request.output_files {
            let path = sandbox.join(&output.path);
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    // The action "succeeded" but didn't produce what it
                    // promised; report it as an action failure.
                    return action_failure(
                        stdout,
                        stderr,
                        format!("failed to read output {}: {}", output.path, e),
                    );
                }
            };

            let content_key = content_key(&data);
            let wrapper = CacheEntry {
                files: vec![],
                file_content: data,
            };
            if let Err(e) = self.store.put(&content_key, wrapper.encode_to_vec()).await {
                warn!(key = %content_key, path = %output.path, error = %e, "failed to publish output blob");
            }

            action_record.files.push(FileEntry {
                path: output.path.clone(),
                content_key,
                executable: output.executable,
            });
        }

        if let Err(e) = self
            .store
            .put(&request.output_key, action_record.encode_to_vec())
            .await
        {
            warn!(key = %request.output_key, error = %e, "failed to publish action record");
        }

        respond(
            StatusCode::OK,
            RemoteWorkResponse {
                success: true,
                out: stdout,
                err: stderr,
                exception: String::new(),
            },
        )
    }
}

/// Hex MD5 of a produced file: the content key existing clients expect.
fn content_key(data: &[u8]) -> String {
    Md5::digest(data).iter().map(|b| format!("{:02x}", b)).collect()
}

/// Infrastructure failed before the action started.
fn infrastructure_failure(exception: String) -> Response<Full<Bytes>> {
    warn!("{}", exception);
    respond(
        StatusCode::INTERNAL_SERVER_ERROR,
        RemoteWorkResponse {
            success: false,
            out: String::new(),
            err: String::new(),
            exception,
        },
    )
}

/// The action itself failed. The protocol reports that as a completed
/// request: HTTP 200 with `success = false`.
fn action_failure(out: String, err: String, exception: String) -> Response<Full<Bytes>> {
    respond(
        StatusCode::OK,
        RemoteWorkResponse {
            success: false,
            out,
            err,
            exception,
        },
    )
}

fn respond(status: StatusCode, work_response: RemoteWorkResponse) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(work_response.encode_to_vec())));
    *response.status_mut() = status;
    response
}
