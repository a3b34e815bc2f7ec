// Copyright 2024 Keel Build contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

mod nodes;
mod request_graph;
mod serialize;
mod signal;

pub use crate::nodes::{
    EnvNode, ExtensionlessFileNode, FileNameNode, FileNode, GlobNode, NodeId, OptionNode,
    RequestEdgeKind, RequestGraphNode, RequestNode, RequestResult,
};
pub use crate::request_graph::{
    FileCreateInvalidation, FsEvent, FsEventKind, RequestGraph, RequestInvalidation,
};
pub use crate::serialize::GRAPH_FORMAT_VERSION;
pub use crate::signal::AbortSignal;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use log::{debug, warn};
use parking_lot::Mutex;

///
/// The failures surfaced to callers of `run_request`.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RequestError {
    /// A request body failed; the cause is propagated verbatim to the caller.
    Failed(String),
    /// A file-create dependency declaration was malformed.
    InvalidInvalidation(String),
    /// The abort signal fired while the request was running.
    Aborted,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Failed(cause) => write!(f, "Request failed: {cause}"),
            RequestError::InvalidInvalidation(reason) => {
                write!(f, "Invalid file-create invalidation: {reason}")
            }
            RequestError::Aborted => write!(f, "The build was aborted."),
        }
    }
}

impl std::error::Error for RequestError {}

///
/// The configuration surface observed by requests: a snapshot of the process environment, and
/// the named option values produced by the surrounding config loader.
///
#[derive(Clone, Debug, Default)]
pub struct BuildOptions {
    pub env: HashMap<String, String>,
    pub values: HashMap<String, serde_json::Value>,
}

impl BuildOptions {
    pub fn new() -> BuildOptions {
        BuildOptions::default()
    }

    ///
    /// Captures the current process environment.
    ///
    pub fn with_current_env(mut self) -> BuildOptions {
        self.env = std::env::vars().collect();
        self
    }

    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> BuildOptions {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn value(mut self, key: impl Into<String>, value: serde_json::Value) -> BuildOptions {
        self.values.insert(key.into(), value);
        self
    }
}

///
/// The worker pool that executes CPU-heavy jobs on behalf of request bodies. The tracker passes
/// the farm through to request bodies untouched; payloads and results are opaque bytes.
///
#[async_trait]
pub trait WorkerFarm: Send + Sync + 'static {
    async fn run_job(&self, job: &str, payload: Vec<u8>) -> Result<Vec<u8>, String>;
}

///
/// A memoized unit of build work.
///
/// The api handle is the sole channel for declaring dependencies: a body that reads the
/// filesystem without declaring the read is unobservable, and its staleness cannot be detected.
///
#[async_trait]
pub trait Request: Send + Sync + 'static {
    ///
    /// A stable id, typically a hash of the request type and its input. Two requests with the
    /// same id are the same request.
    ///
    fn id(&self) -> NodeId;

    fn request_type(&self) -> &'static str;

    ///
    /// Produces the request's result. Returning `None` leaves whatever `api.store_result`
    /// recorded (or the previous result) in place.
    ///
    async fn run(&self, context: RunContext) -> Result<Option<RequestResult>, RequestError>;
}

///
/// Everything a request body runs against.
///
#[derive(Clone)]
pub struct RunContext {
    pub api: RunApi,
    pub farm: Arc<dyn WorkerFarm>,
    pub options: Arc<BuildOptions>,
}

///
/// The per-run handle supplied to a request body. Each mutator scopes to the id of the request
/// the handle was created for, and the subrequest set is fresh per run, so recursive runs do
/// not cross-contaminate.
///
#[derive(Clone)]
pub struct RunApi {
    tracker: RequestTracker,
    request_id: NodeId,
    subrequests: Arc<Mutex<HashSet<NodeId>>>,
}

impl RunApi {
    fn new(tracker: RequestTracker, request_id: NodeId) -> RunApi {
        RunApi {
            tracker,
            request_id,
            subrequests: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn invalidate_on_file_update(&self, path: impl AsRef<Path>) {
        self.tracker
            .graph
            .lock()
            .invalidate_on_file_update(&self.request_id, path.as_ref());
    }

    pub fn invalidate_on_file_delete(&self, path: impl AsRef<Path>) {
        self.tracker
            .graph
            .lock()
            .invalidate_on_file_delete(&self.request_id, path.as_ref());
    }

    pub fn invalidate_on_file_create(
        &self,
        invalidation: &FileCreateInvalidation,
    ) -> Result<(), RequestError> {
        self.tracker
            .graph
            .lock()
            .invalidate_on_file_create(&self.request_id, invalidation)
    }

    pub fn invalidate_on_startup(&self) {
        self.tracker
            .graph
            .lock()
            .invalidate_on_startup(&self.request_id);
    }

    ///
    /// Declares a dependency on an environment variable, capturing its current value.
    ///
    pub fn invalidate_on_env_change(&self, key: &str) {
        let value = self.tracker.options.env.get(key).cloned();
        self.tracker
            .graph
            .lock()
            .invalidate_on_env_change(&self.request_id, key, value);
    }

    ///
    /// Declares a dependency on a named option, capturing a stable hash of its current value.
    ///
    pub fn invalidate_on_option_change(&self, key: &str) -> Result<(), RequestError> {
        let value = self
            .tracker
            .options
            .values
            .get(key)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        self.tracker
            .graph
            .lock()
            .invalidate_on_option_change(&self.request_id, key, &value)
    }

    pub fn get_invalidations(&self) -> Vec<RequestInvalidation> {
        self.tracker.graph.lock().get_invalidations(&self.request_id)
    }

    pub fn store_result(&self, result: RequestResult) {
        self.tracker
            .graph
            .lock()
            .store_result(&self.request_id, result);
    }

    ///
    /// Runs a subrequest. Memoization composes: the subrequest is recorded on this request's
    /// fan-out, so invalidating it later invalidates this request too.
    ///
    pub fn run_request(
        &self,
        request: Arc<dyn Request>,
    ) -> BoxFuture<'static, Result<Option<RequestResult>, RequestError>> {
        self.subrequests.lock().insert(request.id());
        self.tracker.run_request(request)
    }

    fn take_subrequests(&self) -> Vec<NodeId> {
        self.subrequests.lock().drain().collect()
    }
}

///
/// Runs requests, memoizes their results, and re-executes only those whose observed inputs have
/// changed.
///
/// The tracker is an object rather than process state: independent build contexts each own one.
/// The graph lives behind a Mutex taken only for synchronous mutation; request bodies themselves
/// run unlocked, so a body may await (and run subrequests) freely.
///
#[derive(Clone)]
pub struct RequestTracker {
    graph: Arc<Mutex<RequestGraph>>,
    farm: Arc<dyn WorkerFarm>,
    options: Arc<BuildOptions>,
    signal: Arc<Mutex<Option<AbortSignal>>>,
}

impl RequestTracker {
    pub fn new(farm: Arc<dyn WorkerFarm>, options: Arc<BuildOptions>) -> RequestTracker {
        RequestTracker::with_graph(RequestGraph::new(), farm, options)
    }

    ///
    /// Restores a tracker from previously serialized bytes, treating bytes that fail to decode
    /// as no prior state, then runs the startup sweep: unpredictable requests are invalidated
    /// unconditionally, and env/option captures are re-checked against the current options.
    ///
    pub fn load(
        bytes: Option<&[u8]>,
        farm: Arc<dyn WorkerFarm>,
        options: Arc<BuildOptions>,
    ) -> RequestTracker {
        let mut graph = match bytes {
            Some(bytes) => RequestGraph::from_bytes(bytes).unwrap_or_else(|e| {
                warn!("Discarding previous build state: {e}");
                RequestGraph::new()
            }),
            None => RequestGraph::new(),
        };
        graph.invalidate_unpredictable_nodes();
        graph.invalidate_env_nodes(&options.env);
        graph.invalidate_option_nodes(&options.values);
        RequestTracker::with_graph(graph, farm, options)
    }

    fn with_graph(
        graph: RequestGraph,
        farm: Arc<dyn WorkerFarm>,
        options: Arc<BuildOptions>,
    ) -> RequestTracker {
        RequestTracker {
            graph: Arc::new(Mutex::new(graph)),
            farm,
            options,
            signal: Arc::new(Mutex::new(None)),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, String> {
        self.graph.lock().to_bytes()
    }

    ///
    /// Installs the cancellation signal consulted after every request body returns.
    ///
    pub fn set_signal(&self, signal: AbortSignal) {
        *self.signal.lock() = Some(signal);
    }

    fn is_aborted(&self) -> bool {
        self.signal.lock().as_ref().is_some_and(AbortSignal::is_aborted)
    }

    ///
    /// Runs the given request, or returns its memoized result if no observed input has changed
    /// since the last run.
    ///
    pub fn run_request(
        &self,
        request: Arc<dyn Request>,
    ) -> BoxFuture<'static, Result<Option<RequestResult>, RequestError>> {
        let tracker = self.clone();
        async move {
            let request_id = request.id();

            {
                let graph = tracker.graph.lock();
                if graph.has_valid_result(&request_id) {
                    debug!("Request {request_id} is up to date");
                    return Ok(graph.get_request_result(&request_id).cloned());
                }
            }

            tracker
                .graph
                .lock()
                .start_request(&request_id, request.request_type());

            let api = RunApi::new(tracker.clone(), request_id.clone());
            let context = RunContext {
                api: api.clone(),
                farm: tracker.farm.clone(),
                options: tracker.options.clone(),
            };

            let mut result = request.run(context).await;

            // Cancellation is observed between request bodies: a body that returned
            // successfully still fails if the signal fired while it ran.
            if result.is_ok() && tracker.is_aborted() {
                result = Err(RequestError::Aborted);
            }

            let mut graph = tracker.graph.lock();
            match &result {
                Ok(value) => {
                    if let Some(value) = value {
                        graph.store_result(&request_id, value.clone());
                    }
                    graph.complete_request(&request_id);
                }
                Err(err) => {
                    debug!("Request {request_id} failed: {err}");
                    graph.reject_request(&request_id);
                }
            }
            // Success or failure, the subrequest fan-out reflects exactly this run.
            graph.replace_subrequests(&request_id, api.take_subrequests());

            match result {
                Ok(_) => Ok(graph.get_request_result(&request_id).cloned()),
                Err(err) => Err(err),
            }
        }
        .boxed()
    }

    pub fn has_valid_result(&self, id: &NodeId) -> bool {
        self.graph.lock().has_valid_result(id)
    }

    pub fn get_request_result(&self, id: &NodeId) -> Option<RequestResult> {
        self.graph.lock().get_request_result(id).cloned()
    }

    pub fn store_result(&self, id: &NodeId, result: RequestResult) {
        self.graph.lock().store_result(id, result);
    }

    pub fn complete_request(&self, id: &NodeId) {
        self.graph.lock().complete_request(id);
    }

    pub fn reject_request(&self, id: &NodeId) {
        self.graph.lock().reject_request(id);
    }

    pub fn remove_request(&self, id: &NodeId) {
        self.graph.lock().remove_request(id);
    }

    ///
    /// Applies a batch of watcher events. Returns whether any request became invalid.
    ///
    pub fn respond_to_fs_events(&self, events: &[FsEvent]) -> bool {
        self.graph.lock().respond_to_fs_events(events)
    }

    pub fn get_invalid_requests(&self) -> Vec<RequestNode> {
        self.graph.lock().get_invalid_requests()
    }

    ///
    /// Runs `f` with the graph locked. Intended for inspection in tests and tooling.
    ///
    pub fn with_graph_locked<T>(&self, f: impl FnOnce(&RequestGraph) -> T) -> T {
        f(&self.graph.lock())
    }
}
