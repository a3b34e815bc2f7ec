// Copyright 2024 Keel Build contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use graph::{Direction, Graph, Node};
use log::{debug, warn};
use serde_json::Value;

use crate::nodes::{
    EnvNode, ExtensionlessFileNode, FileNameNode, FileNode, GlobNode, NodeId, OptionNode,
    RequestEdgeKind, RequestGraphNode, RequestNode, RequestResult,
};
use crate::RequestError;

///
/// A filesystem change reported by the file watcher, in watcher order.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FsEventKind {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: FsEventKind,
}

impl FsEvent {
    pub fn create(path: impl Into<PathBuf>) -> FsEvent {
        FsEvent {
            path: path.into(),
            kind: FsEventKind::Create,
        }
    }

    pub fn update(path: impl Into<PathBuf>) -> FsEvent {
        FsEvent {
            path: path.into(),
            kind: FsEventKind::Update,
        }
    }

    pub fn delete(path: impl Into<PathBuf>) -> FsEvent {
        FsEvent {
            path: path.into(),
            kind: FsEventKind::Delete,
        }
    }
}

///
/// The shapes a file-create dependency may take.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FileCreateInvalidation {
    /// A path matching the glob appears.
    Glob { glob: String },
    /// A sibling `path.ext` appears for any `ext` in the set. Used to express resolution
    /// priority: a request that resolved `path.ts` may be outranked by a later `path.js`.
    Extensions {
        path: PathBuf,
        extensions: BTreeSet<String>,
    },
    /// A file with the given (possibly multi-segment) name appears in any ancestor directory of
    /// `above_path`. Used for configuration-file discovery.
    FileNameAbove {
        file_name: String,
        above_path: PathBuf,
    },
}

///
/// A declared update dependency, as reported by `get_invalidations`.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RequestInvalidation {
    File { path: PathBuf },
    Env { key: String },
}

///
/// Returns whether `path` lies inside the directory `dir` (comparing whole components, so
/// `/a/bc` is not inside `/a/b`).
///
pub(crate) fn is_directory_inside(path: &Path, dir: &Path) -> bool {
    path.starts_with(dir)
}

fn glob_match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

///
/// The persistent request graph: request nodes connected to the dependency nodes that can
/// invalidate them, plus the indices that make bulk re-checks cheap.
///
/// All mutation happens on the caller's task; the `RequestTracker` wraps the graph in a Mutex
/// and request bodies reach it only through their `RunApi` handle.
///
pub struct RequestGraph {
    pub(crate) graph: Graph<RequestGraphNode, RequestEdgeKind>,
    pub(crate) invalid_request_ids: HashSet<NodeId>,
    pub(crate) incomplete_request_ids: HashSet<NodeId>,
    pub(crate) glob_node_ids: HashSet<NodeId>,
    pub(crate) env_node_ids: HashSet<NodeId>,
    pub(crate) option_node_ids: HashSet<NodeId>,
    pub(crate) unpredictable_request_ids: HashSet<NodeId>,
}

impl RequestGraph {
    pub fn new() -> RequestGraph {
        RequestGraph {
            graph: Graph::new(),
            invalid_request_ids: HashSet::new(),
            incomplete_request_ids: HashSet::new(),
            glob_node_ids: HashSet::new(),
            env_node_ids: HashSet::new(),
            option_node_ids: HashSet::new(),
            unpredictable_request_ids: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    ///
    /// Removes the node with the given id and purges it from every index.
    ///
    pub fn remove_node(&mut self, id: &NodeId) -> Option<RequestGraphNode> {
        let node = self.graph.remove_node(id)?;
        self.invalid_request_ids.remove(id);
        self.incomplete_request_ids.remove(id);
        self.glob_node_ids.remove(id);
        self.env_node_ids.remove(id);
        self.option_node_ids.remove(id);
        self.unpredictable_request_ids.remove(id);
        Some(node)
    }

    fn ensure_file_node(&mut self, path: &Path) -> NodeId {
        let id = FileNode::id_for(path);
        self.graph
            .ensure_node(RequestGraphNode::File(FileNode::new(path)));
        id
    }

    fn ensure_file_name_node(&mut self, name: &str) -> NodeId {
        let id = FileNameNode::id_for(name);
        self.graph
            .ensure_node(RequestGraphNode::FileName(FileNameNode::new(name)));
        id
    }

    fn request_ids_connected_to(&self, id: &NodeId, kind: RequestEdgeKind) -> Vec<NodeId> {
        self.graph
            .nodes_connected_to(id, kind)
            .filter(|n| matches!(n, RequestGraphNode::Request(_)))
            .map(|n| n.id().clone())
            .collect()
    }

    ///
    /// Inserts the request node if it is new; otherwise clears its previous declarations so the
    /// run may record a fresh set. Marks the request in-flight either way.
    ///
    pub fn start_request(&mut self, id: &NodeId, request_type: &str) {
        if self.graph.has_node(id) {
            self.clear_invalidations(id);
        } else {
            self.graph
                .ensure_node(RequestGraphNode::Request(RequestNode::new(
                    id.clone(),
                    request_type,
                )));
        }
        self.incomplete_request_ids.insert(id.clone());
        self.invalid_request_ids.remove(id);
    }

    pub fn has_valid_result(&self, id: &NodeId) -> bool {
        self.graph.has_node(id)
            && !self.invalid_request_ids.contains(id)
            && !self.incomplete_request_ids.contains(id)
    }

    pub fn get_request_result(&self, id: &NodeId) -> Option<&RequestResult> {
        match self.graph.node(id) {
            Some(RequestGraphNode::Request(node)) => node.result.as_ref(),
            _ => None,
        }
    }

    pub fn store_result(&mut self, id: &NodeId, result: RequestResult) {
        if let Some(RequestGraphNode::Request(node)) = self.graph.node_mut(id) {
            node.result = Some(result);
        }
    }

    pub fn complete_request(&mut self, id: &NodeId) {
        self.incomplete_request_ids.remove(id);
        self.invalid_request_ids.remove(id);
    }

    pub fn reject_request(&mut self, id: &NodeId) {
        self.incomplete_request_ids.remove(id);
        if self.graph.has_node(id) {
            self.invalid_request_ids.insert(id.clone());
        }
    }

    pub fn remove_request(&mut self, id: &NodeId) {
        self.remove_node(id);
    }

    ///
    /// A snapshot of the requests whose results are currently known stale, in id order.
    ///
    pub fn get_invalid_requests(&self) -> Vec<RequestNode> {
        let mut requests: Vec<RequestNode> = self
            .invalid_request_ids
            .iter()
            .filter_map(|id| match self.graph.node(id) {
                Some(RequestGraphNode::Request(node)) => Some(node.clone()),
                _ => None,
            })
            .collect();
        requests.sort_by(|a, b| a.id.cmp(&b.id));
        requests
    }

    ///
    /// Replaces the request's subrequest fan-out with exactly the given set. Subrequests that
    /// were removed from the graph while the parent ran are dropped.
    ///
    pub fn replace_subrequests(&mut self, parent_id: &NodeId, subrequest_ids: Vec<NodeId>) {
        if !self.graph.has_node(parent_id) {
            return;
        }
        let present: Vec<NodeId> = subrequest_ids
            .into_iter()
            .filter(|id| self.graph.has_node(id))
            .collect();
        self.graph
            .replace_nodes_connected_to(parent_id, &present, RequestEdgeKind::Subrequest);
    }

    pub fn invalidate_on_file_update(&mut self, request_id: &NodeId, path: &Path) {
        let file_id = self.ensure_file_node(path);
        self.graph
            .add_edge(request_id, &file_id, RequestEdgeKind::InvalidatedByUpdate);
    }

    pub fn invalidate_on_file_delete(&mut self, request_id: &NodeId, path: &Path) {
        let file_id = self.ensure_file_node(path);
        self.graph
            .add_edge(request_id, &file_id, RequestEdgeKind::InvalidatedByDelete);
    }

    pub fn invalidate_on_file_create(
        &mut self,
        request_id: &NodeId,
        invalidation: &FileCreateInvalidation,
    ) -> Result<(), RequestError> {
        match invalidation {
            FileCreateInvalidation::Glob { glob } => {
                Pattern::new(glob).map_err(|e| {
                    RequestError::InvalidInvalidation(format!("invalid glob {glob:?}: {e}"))
                })?;
                let glob_id = GlobNode::id_for(glob);
                self.graph
                    .ensure_node(RequestGraphNode::Glob(GlobNode::new(glob.clone())));
                self.glob_node_ids.insert(glob_id.clone());
                self.graph
                    .add_edge(request_id, &glob_id, RequestEdgeKind::InvalidatedByCreate);
            }
            FileCreateInvalidation::Extensions { path, extensions } => {
                if extensions.is_empty() {
                    return Err(RequestError::InvalidInvalidation(format!(
                        "an extension dependency on {} needs at least one extension",
                        path.display()
                    )));
                }
                let mut normalized = BTreeSet::new();
                for extension in extensions {
                    let extension = extension.trim_start_matches('.');
                    if extension.is_empty() || extension.contains('/') {
                        return Err(RequestError::InvalidInvalidation(format!(
                            "{extension:?} is not a file extension"
                        )));
                    }
                    normalized.insert(extension.to_owned());
                }
                let id = ExtensionlessFileNode::id_for(path);
                // Union before ensuring the edge: a re-declaration may be adding extensions to
                // a node created by another request, and must still subscribe to it.
                if let Some(RequestGraphNode::ExtensionlessFile(node)) = self.graph.node_mut(&id) {
                    node.extensions.extend(normalized);
                } else {
                    self.graph.ensure_node(RequestGraphNode::ExtensionlessFile(
                        ExtensionlessFileNode::new(path.clone(), normalized),
                    ));
                }
                self.graph
                    .add_edge(request_id, &id, RequestEdgeKind::InvalidatedByCreate);
            }
            FileCreateInvalidation::FileNameAbove {
                file_name,
                above_path,
            } => {
                if file_name.is_empty() || file_name.split('/').any(str::is_empty) {
                    return Err(RequestError::InvalidInvalidation(format!(
                        "{file_name:?} is not a file name"
                    )));
                }
                if !above_path.is_absolute() {
                    return Err(RequestError::InvalidInvalidation(format!(
                        "the anchor path {} must be absolute",
                        above_path.display()
                    )));
                }
                // Chain the segments leaf-first: the responder walks `Dirname` edges outward,
                // so the outermost segment ends the chain and carries the anchor edge.
                let mut chain_end: Option<NodeId> = None;
                for segment in file_name.split('/').rev() {
                    let segment_id = self.ensure_file_name_node(segment);
                    if let Some(ref inner) = chain_end {
                        self.graph
                            .add_edge(inner, &segment_id, RequestEdgeKind::Dirname);
                    }
                    chain_end = Some(segment_id);
                }
                let chain_end = chain_end.expect("file_name has at least one segment");
                let file_id = self.ensure_file_node(above_path);
                self.graph.add_edge(
                    &file_id,
                    &chain_end,
                    RequestEdgeKind::InvalidatedByCreateAbove,
                );
                self.graph
                    .add_edge(request_id, &file_id, RequestEdgeKind::InvalidatedByCreate);
            }
        }
        Ok(())
    }

    ///
    /// Marks the request as one that must rerun every process start.
    ///
    pub fn invalidate_on_startup(&mut self, request_id: &NodeId) {
        self.unpredictable_request_ids.insert(request_id.clone());
    }

    pub fn invalidate_on_env_change(
        &mut self,
        request_id: &NodeId,
        key: &str,
        value: Option<String>,
    ) {
        let id = EnvNode::id_for(key);
        // Each declaration captures the value current at that time.
        if let Some(RequestGraphNode::Env(node)) = self.graph.node_mut(&id) {
            node.value = value;
        } else {
            self.graph
                .ensure_node(RequestGraphNode::Env(EnvNode::new(key, value)));
            self.env_node_ids.insert(id.clone());
        }
        self.graph
            .add_edge(request_id, &id, RequestEdgeKind::InvalidatedByUpdate);
    }

    pub fn invalidate_on_option_change(
        &mut self,
        request_id: &NodeId,
        key: &str,
        value: &Value,
    ) -> Result<(), RequestError> {
        let hash = hashing::fingerprint_json(value).map_err(RequestError::Failed)?;
        let id = OptionNode::id_for(key);
        if let Some(RequestGraphNode::Option(node)) = self.graph.node_mut(&id) {
            node.hash = hash;
        } else {
            self.graph
                .ensure_node(RequestGraphNode::Option(OptionNode::new(key, hash)));
            self.option_node_ids.insert(id.clone());
        }
        self.graph
            .add_edge(request_id, &id, RequestEdgeKind::InvalidatedByUpdate);
        Ok(())
    }

    ///
    /// Drops everything the request previously declared, so that a re-run may record exactly
    /// what it still depends on.
    ///
    pub fn clear_invalidations(&mut self, id: &NodeId) {
        if !self.graph.has_node(id) {
            return;
        }
        self.unpredictable_request_ids.remove(id);
        for kind in [
            RequestEdgeKind::InvalidatedByUpdate,
            RequestEdgeKind::InvalidatedByDelete,
            RequestEdgeKind::InvalidatedByCreate,
        ] {
            self.graph.replace_nodes_connected_to(id, &[], kind);
        }
    }

    ///
    /// The request's declared update dependencies, for reporting.
    ///
    pub fn get_invalidations(&self, id: &NodeId) -> Vec<RequestInvalidation> {
        if !self.graph.has_node(id) {
            return Vec::new();
        }
        self.graph
            .nodes_connected_from(id, RequestEdgeKind::InvalidatedByUpdate)
            .filter_map(|node| match node {
                RequestGraphNode::File(file) => Some(RequestInvalidation::File {
                    path: file.path.clone(),
                }),
                RequestGraphNode::Env(env) => Some(RequestInvalidation::Env {
                    key: env.key.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    ///
    /// Marks the request stale, along with every request that memoized through it. The walk
    /// carries a visited set, so a (contractually forbidden) subrequest cycle cannot hang it.
    /// Returns whether any request became newly invalid.
    ///
    pub fn invalidate_node(&mut self, id: &NodeId) -> bool {
        if !matches!(self.graph.node(id), Some(RequestGraphNode::Request(_))) {
            return false;
        }
        let request_ids: Vec<NodeId> = self
            .graph
            .walk([id], Direction::Incoming, RequestEdgeKind::Subrequest)
            .filter(|n| matches!(n, RequestGraphNode::Request(_)))
            .map(|n| n.id().clone())
            .collect();
        let mut newly_invalid = false;
        for request_id in request_ids {
            newly_invalid |= self.invalid_request_ids.insert(request_id);
        }
        newly_invalid
    }

    ///
    /// Invalidates every request that cannot be proven re-runnable from filesystem evidence.
    /// Runs once per process start.
    ///
    pub fn invalidate_unpredictable_nodes(&mut self) {
        let ids: Vec<NodeId> = self.unpredictable_request_ids.iter().cloned().collect();
        for id in ids {
            self.invalidate_node(&id);
        }
    }

    ///
    /// Invalidates the subscribers of every environment variable whose current value differs
    /// from the captured one.
    ///
    pub fn invalidate_env_nodes(&mut self, env: &HashMap<String, String>) {
        let env_ids: Vec<NodeId> = self.env_node_ids.iter().cloned().collect();
        for env_id in env_ids {
            let changed = match self.graph.node(&env_id) {
                Some(RequestGraphNode::Env(node)) => env.get(&node.key) != node.value.as_ref(),
                _ => false,
            };
            if changed {
                debug!("Environment variable changed: {env_id}");
                for request_id in
                    self.request_ids_connected_to(&env_id, RequestEdgeKind::InvalidatedByUpdate)
                {
                    self.invalidate_node(&request_id);
                }
            }
        }
    }

    ///
    /// Invalidates the subscribers of every option whose current value no longer fingerprints
    /// to the captured hash. A missing option fingerprints as null, so set-to-null and unset
    /// compare equal.
    ///
    pub fn invalidate_option_nodes(&mut self, options: &HashMap<String, Value>) {
        let option_ids: Vec<NodeId> = self.option_node_ids.iter().cloned().collect();
        for option_id in option_ids {
            let changed = match self.graph.node(&option_id) {
                Some(RequestGraphNode::Option(node)) => {
                    let current = options.get(&node.key).cloned().unwrap_or(Value::Null);
                    match hashing::fingerprint_json(&current) {
                        Ok(hash) => hash != node.hash,
                        Err(e) => {
                            warn!("Failed to fingerprint option {}: {e}", node.key);
                            true
                        }
                    }
                }
                _ => false,
            };
            if changed {
                debug!("Option changed: {option_id}");
                for request_id in
                    self.request_ids_connected_to(&option_id, RequestEdgeKind::InvalidatedByUpdate)
                {
                    self.invalidate_node(&request_id);
                }
            }
        }
    }

    ///
    /// Applies a batch of watcher events in order. Returns whether any request became invalid.
    /// Events for paths no subscriber cares about are ignored.
    ///
    pub fn respond_to_fs_events(&mut self, events: &[FsEvent]) -> bool {
        let mut invalidated = false;
        for event in events {
            invalidated |= self.respond_to_fs_event(event);
        }
        invalidated
    }

    fn respond_to_fs_event(&mut self, event: &FsEvent) -> bool {
        let file_id = FileNode::id_for(&event.path);
        match event.kind {
            // Some platforms surface updates to watched files as creates; an existing File
            // node folds them back into updates.
            FsEventKind::Create | FsEventKind::Update if self.graph.has_node(&file_id) => {
                self.invalidate_connected(&file_id, RequestEdgeKind::InvalidatedByUpdate)
            }
            FsEventKind::Create => {
                let mut invalidated = false;
                invalidated |= self.respond_to_extensionless_create(&event.path);
                invalidated |= self.respond_to_file_name_create(&event.path);
                invalidated |= self.respond_to_glob_create(&event.path);
                invalidated
            }
            FsEventKind::Delete if self.graph.has_node(&file_id) => {
                self.invalidate_connected(&file_id, RequestEdgeKind::InvalidatedByDelete)
            }
            _ => false,
        }
    }

    fn invalidate_connected(&mut self, id: &NodeId, kind: RequestEdgeKind) -> bool {
        let mut invalidated = false;
        for request_id in self.request_ids_connected_to(id, kind) {
            invalidated |= self.invalidate_node(&request_id);
        }
        invalidated
    }

    fn respond_to_extensionless_create(&mut self, path: &Path) -> bool {
        let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let stem = path.with_extension("");
        let id = ExtensionlessFileNode::id_for(&stem);
        let matched = match self.graph.node(&id) {
            Some(RequestGraphNode::ExtensionlessFile(node)) => node.extensions.contains(extension),
            _ => false,
        };
        if matched {
            self.invalidate_connected(&id, RequestEdgeKind::InvalidatedByCreate)
        } else {
            false
        }
    }

    fn respond_to_file_name_create(&mut self, path: &Path) -> bool {
        let Some(basename) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let file_name_id = FileNameNode::id_for(basename);
        if self.graph.has_node(&file_name_id) {
            self.invalidate_file_name_node(&file_name_id, path)
        } else {
            false
        }
    }

    ///
    /// Walks a FileName chain outward from the segment matched by the created path. Anchored
    /// File nodes whose path lies below the created file's directory have their subscribers
    /// invalidated; then, if the chain continues with the name of the parent directory, the
    /// walk recurses with the parent directory as the new path.
    ///
    fn invalidate_file_name_node(&mut self, file_name_id: &NodeId, path: &Path) -> bool {
        let Some(dir) = path.parent() else {
            return false;
        };
        let mut invalidated = false;

        let anchored: Vec<NodeId> = self
            .graph
            .nodes_connected_to(file_name_id, RequestEdgeKind::InvalidatedByCreateAbove)
            .filter_map(|node| match node {
                RequestGraphNode::File(file) if is_directory_inside(&file.path, dir) => {
                    Some(node.id().clone())
                }
                _ => None,
            })
            .collect();
        for file_id in anchored {
            invalidated |= self.invalidate_connected(&file_id, RequestEdgeKind::InvalidatedByCreate);
        }

        if let Some(dir_basename) = dir.file_name().and_then(|n| n.to_str()) {
            let parents: Vec<NodeId> = self
                .graph
                .nodes_connected_from(file_name_id, RequestEdgeKind::Dirname)
                .filter_map(|node| match node {
                    RequestGraphNode::FileName(parent) if parent.name == dir_basename => {
                        Some(node.id().clone())
                    }
                    _ => None,
                })
                .collect();
            for parent_id in parents {
                invalidated |= self.invalidate_file_name_node(&parent_id, dir);
            }
        }

        invalidated
    }

    fn respond_to_glob_create(&mut self, path: &Path) -> bool {
        let mut invalidated = false;
        let glob_ids: Vec<NodeId> = self.glob_node_ids.iter().cloned().collect();
        for glob_id in glob_ids {
            let matched = match self.graph.node(&glob_id) {
                Some(RequestGraphNode::Glob(node)) => Pattern::new(&node.pattern)
                    .map(|pattern| pattern.matches_path_with(path, glob_match_options()))
                    .unwrap_or(false),
                _ => false,
            };
            if matched {
                invalidated |=
                    self.invalidate_connected(&glob_id, RequestEdgeKind::InvalidatedByCreate);
            }
        }
        invalidated
    }
}
