// Copyright 2024 Keel Build contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use hashing::Fingerprint;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

///
/// A stable node id. Ids survive process restarts: a request keeps its id across runs, and
/// dependency node ids are derived from their keys (path, pattern, variable name, ...) so that a
/// re-declaration lands on the same node.
///
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> NodeId {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> NodeId {
        NodeId(id.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> NodeId {
        NodeId(id)
    }
}

///
/// The relation an edge belongs to.
///
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum RequestEdgeKind {
    /// Parent request memoized through child request.
    Subrequest,
    /// The request must rerun if the target changes.
    InvalidatedByUpdate,
    /// The request must rerun if the target disappears.
    InvalidatedByDelete,
    /// The request must rerun if something matching the target appears.
    InvalidatedByCreate,
    /// Anchors a "file named X above this path" chain: runs from a File node to the outermost
    /// segment of a FileName chain.
    InvalidatedByCreateAbove,
    /// Connects FileName segments leaf-first, so that walking `Dirname` edges moves outward
    /// through ancestor directories.
    Dirname,
}

impl graph::EdgeId for RequestEdgeKind {}

///
/// The opaque result of a completed request: a tag naming the encoding plus caller-encoded
/// bytes. The tracker never looks inside.
///
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RequestResult {
    tag: String,
    data: Vec<u8>,
}

impl RequestResult {
    pub fn new(tag: impl Into<String>, data: Vec<u8>) -> RequestResult {
        RequestResult {
            tag: tag.into(),
            data,
        }
    }

    pub fn encode<T: Serialize>(tag: &str, value: &T) -> Result<RequestResult, String> {
        let data = bincode::serialize(value)
            .map_err(|e| format!("Failed to encode result for {tag}: {e}"))?;
        Ok(RequestResult::new(tag, data))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, String> {
        bincode::deserialize(&self.data)
            .map_err(|e| format!("Failed to decode result for {}: {e}", self.tag))
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

fn path_id(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

///
/// A memoized computation.
///
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RequestNode {
    pub id: NodeId,
    pub request_type: String,
    pub result: Option<RequestResult>,
}

impl RequestNode {
    pub fn new(id: NodeId, request_type: impl Into<String>) -> RequestNode {
        RequestNode {
            id,
            request_type: request_type.into(),
            result: None,
        }
    }
}

///
/// The content at a path.
///
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FileNode {
    pub id: NodeId,
    pub path: PathBuf,
}

impl FileNode {
    pub fn new(path: impl Into<PathBuf>) -> FileNode {
        let path = path.into();
        FileNode {
            id: FileNode::id_for(&path),
            path,
        }
    }

    pub fn id_for(path: &Path) -> NodeId {
        NodeId::new(path_id(path))
    }
}

///
/// The set of paths matching a pattern.
///
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GlobNode {
    pub id: NodeId,
    pub pattern: String,
}

impl GlobNode {
    pub fn new(pattern: impl Into<String>) -> GlobNode {
        let pattern = pattern.into();
        GlobNode {
            id: GlobNode::id_for(&pattern),
            pattern,
        }
    }

    pub fn id_for(pattern: &str) -> NodeId {
        NodeId::new(pattern)
    }
}

///
/// One segment of a "file named X above a directory" chain.
///
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FileNameNode {
    pub id: NodeId,
    pub name: String,
}

impl FileNameNode {
    pub fn new(name: impl Into<String>) -> FileNameNode {
        let name = name.into();
        FileNameNode {
            id: FileNameNode::id_for(&name),
            name,
        }
    }

    pub fn id_for(name: &str) -> NodeId {
        NodeId::new(format!("file_name:{name}"))
    }
}

///
/// Any of `path.ext` for `ext` in a set of extensions. Extensions are stored without their
/// leading dot.
///
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ExtensionlessFileNode {
    pub id: NodeId,
    pub path: PathBuf,
    pub extensions: BTreeSet<String>,
}

impl ExtensionlessFileNode {
    pub fn new(path: impl Into<PathBuf>, extensions: BTreeSet<String>) -> ExtensionlessFileNode {
        let path = path.into();
        ExtensionlessFileNode {
            id: ExtensionlessFileNode::id_for(&path),
            path,
            extensions,
        }
    }

    pub fn id_for(path: &Path) -> NodeId {
        NodeId::new(format!("extensionless_file:{}", path_id(path)))
    }
}

///
/// An environment variable and its value as captured when the dependency was declared. `None`
/// captures that the variable was unset.
///
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct EnvNode {
    pub id: NodeId,
    pub key: String,
    pub value: Option<String>,
}

impl EnvNode {
    pub fn new(key: impl Into<String>, value: Option<String>) -> EnvNode {
        let key = key.into();
        EnvNode {
            id: EnvNode::id_for(&key),
            key,
            value,
        }
    }

    pub fn id_for(key: &str) -> NodeId {
        NodeId::new(format!("env:{key}"))
    }
}

///
/// A named configuration option, captured as a stable fingerprint of its value so that
/// structurally equal configurations compare equal across runs.
///
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct OptionNode {
    pub id: NodeId,
    pub key: String,
    pub hash: Fingerprint,
}

impl OptionNode {
    pub fn new(key: impl Into<String>, hash: Fingerprint) -> OptionNode {
        let key = key.into();
        OptionNode {
            id: OptionNode::id_for(&key),
            key,
            hash,
        }
    }

    pub fn id_for(key: &str) -> NodeId {
        NodeId::new(format!("option:{key}"))
    }
}

///
/// A node in the request graph. Each variant derives its id from its key in its constructor, so
/// "id uniquely encodes kind + key" holds by construction. Equality and hashing are by id.
///
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum RequestGraphNode {
    Request(RequestNode),
    File(FileNode),
    Glob(GlobNode),
    FileName(FileNameNode),
    ExtensionlessFile(ExtensionlessFileNode),
    Env(EnvNode),
    Option(OptionNode),
}

impl graph::Node for RequestGraphNode {
    type Id = NodeId;

    fn id(&self) -> &NodeId {
        match self {
            RequestGraphNode::Request(n) => &n.id,
            RequestGraphNode::File(n) => &n.id,
            RequestGraphNode::Glob(n) => &n.id,
            RequestGraphNode::FileName(n) => &n.id,
            RequestGraphNode::ExtensionlessFile(n) => &n.id,
            RequestGraphNode::Env(n) => &n.id,
            RequestGraphNode::Option(n) => &n.id,
        }
    }
}

impl PartialEq for RequestGraphNode {
    fn eq(&self, other: &RequestGraphNode) -> bool {
        graph::Node::id(self) == graph::Node::id(other)
    }
}

impl Eq for RequestGraphNode {}

impl Hash for RequestGraphNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        graph::Node::id(self).hash(state);
    }
}
