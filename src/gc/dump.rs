//! Graphviz export of the dependency graphs and the debug HTTP endpoint
//!
//! `GET /graph` renders every partition; `?partition=<id>` narrows to one,
//! and each `uid=<uid>` (or `uid=<partition>:<uid>`) limits the output to the
//! objects connected to that UID.

use super::client::GroupVersion;
use super::collector::GarbageCollector;
use super::graph_builder::GraphBuilder;
use super::model::PartitionId;
use super::node::Node;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// One vertex of the rendered graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DotVertex {
    pub uid: String,
    pub group: String,
    pub version: String,
    pub kind: String,
    pub partition: PartitionId,
    pub namespace: String,
    pub name: String,
    pub missing_from_graph: bool,
    pub being_deleted: bool,
    pub deleting_dependents: bool,
    pub virtual_node: bool,
}

impl DotVertex {
    pub fn from_node(node: &Node) -> Self {
        let gv = GroupVersion::parse(&node.identity.api_version);
        Self {
            uid: node.identity.uid.clone(),
            group: gv.group,
            version: gv.version,
            kind: node.identity.kind.clone(),
            partition: node.identity.partition.clone(),
            namespace: node.identity.namespace.clone(),
            name: node.identity.name.clone(),
            missing_from_graph: false,
            being_deleted: node.is_being_deleted(),
            deleting_dependents: node.is_deleting_dependents(),
            virtual_node: node.is_virtual(),
        }
    }

    /// Vertex for an owner referenced from the graph but not present in it
    pub fn missing(partition: PartitionId, owner: &OwnerReference) -> Self {
        let gv = GroupVersion::parse(&owner.api_version);
        Self {
            uid: owner.uid.clone(),
            group: gv.group,
            version: gv.version,
            kind: owner.kind.clone(),
            partition,
            namespace: String::new(),
            name: owner.name.clone(),
            missing_from_graph: true,
            being_deleted: false,
            deleting_dependents: false,
            virtual_node: false,
        }
    }

    /// Identifier unique across partitions
    pub fn dot_id(&self) -> String {
        format!("{}|{}", self.partition, self.uid)
    }

    fn attributes(&self) -> Vec<(&'static str, String)> {
        let mut kind = format!("{}.{}", self.kind, self.version);
        if !self.group.is_empty() {
            kind.push('.');
            kind.push_str(&self.group);
        }

        let mut label = format!(
            "partition={}\nuid={}\nnamespace={}\n{}/{}\n",
            self.partition, self.uid, self.namespace, kind, self.name
        );
        let conditions: Vec<&str> = [
            (self.being_deleted, "beingDeleted"),
            (self.deleting_dependents, "deletingDependents"),
            (self.virtual_node, "virtual"),
            (self.missing_from_graph, "missingFromGraph"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect();
        if !conditions.is_empty() {
            label.push_str(&conditions.join(","));
            label.push('\n');
        }

        vec![
            ("label", label),
            ("group", self.group.clone()),
            ("version", self.version.clone()),
            ("kind", self.kind.clone()),
            ("partition", self.partition.to_string()),
            ("namespace", self.namespace.clone()),
            ("name", self.name.clone()),
            ("uid", self.uid.clone()),
            ("missing", self.missing_from_graph.to_string()),
            ("beingDeleted", self.being_deleted.to_string()),
            ("deletingDependents", self.deleting_dependents.to_string()),
            ("virtual", self.virtual_node.to_string()),
        ]
    }

    fn marshal(&self, out: &mut String) {
        let _ = writeln!(out, "  {:?} [", self.dot_id());
        for (key, value) in self.attributes() {
            let _ = writeln!(out, "    {key}={value:?}");
        }
        out.push_str("  ];\n");
    }
}

/// Edge from a dependent to one of its owners
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DotEdge {
    pub from: String,
    pub to: String,
}

/// Vertices and edges for a whole graph
///
/// Objects with neither owners nor dependents are left out. Owners referenced
/// but absent from the graph get a vertex marked missing.
pub fn to_dot_nodes_and_edges(nodes: &HashMap<String, Arc<Node>>) -> (Vec<DotVertex>, Vec<DotEdge>) {
    let mut vertices: HashMap<String, DotVertex> = HashMap::new();
    for node in nodes.values() {
        if node.dependents_len() == 0 && node.owners().is_empty() {
            continue;
        }
        vertices.insert(node.uid().to_string(), DotVertex::from_node(node));
    }

    let mut edges = Vec::new();
    for node in nodes.values() {
        let Some(from) = vertices.get(node.uid()).map(DotVertex::dot_id) else {
            continue;
        };
        for owner in node.owners() {
            let to = vertices
                .entry(owner.uid.clone())
                .or_insert_with(|| DotVertex::missing(node.identity.partition.clone(), &owner))
                .dot_id();
            edges.push(DotEdge {
                from: from.clone(),
                to,
            });
        }
    }

    let mut vertices: Vec<DotVertex> = vertices.into_values().collect();
    vertices.sort_by(|a, b| a.uid.cmp(&b.uid));
    edges.sort();
    (vertices, edges)
}

/// Vertices and edges for the objects connected to `uids`
pub fn to_dot_nodes_and_edges_for_objects(
    nodes: &HashMap<String, Arc<Node>>,
    uids: &[String],
) -> (Vec<DotVertex>, Vec<DotEdge>) {
    let mut to_check: Vec<String> = uids.to_vec();
    let mut seen: HashSet<String> = HashSet::new();
    let mut interesting: HashMap<String, Arc<Node>> = HashMap::new();

    while let Some(uid) = to_check.pop() {
        if !seen.insert(uid.clone()) {
            continue;
        }
        let Some(node) = nodes.get(&uid) else {
            continue;
        };
        interesting.insert(uid, Arc::clone(node));
        to_check.extend(node.owners().into_iter().map(|o| o.uid));
        to_check.extend(node.dependents().iter().map(|d| d.uid().to_string()));
    }

    to_dot_nodes_and_edges(&interesting)
}

/// Render DOT text
pub fn marshal_dot(vertices: &[DotVertex], edges: &[DotEdge]) -> String {
    let mut out = String::from("strict digraph full {\n");
    if !vertices.is_empty() {
        out.push_str("  // Node definitions.\n");
        for vertex in vertices {
            vertex.marshal(&mut out);
        }
    }
    if !edges.is_empty() {
        out.push_str("  // Edge definitions.\n");
        for edge in edges {
            let _ = writeln!(out, "  {:?} -> {:?};", edge.from, edge.to);
        }
    }
    out.push_str("}\n");
    out
}

/// Router serving the debug graph
pub fn debug_router(gc: Arc<GarbageCollector>) -> Router {
    Router::new()
        .route("/graph", get(graph_handler))
        .with_state(gc)
}

/// Serve the debug router until `ctx` is cancelled
pub async fn serve_debug(
    address: SocketAddr,
    gc: Arc<GarbageCollector>,
    ctx: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(%address, "Serving dependency graph at /graph");
    axum::serve(listener, debug_router(gc))
        .with_graceful_shutdown(async move { ctx.cancelled().await })
        .await
}

fn pick_builders(gc: &GarbageCollector, partition: Option<&str>) -> Vec<Arc<GraphBuilder>> {
    match partition.filter(|p| !p.is_empty()) {
        None => {
            let mut builders = gc.builders();
            builders.sort_by(|a, b| a.partition().cmp(b.partition()));
            builders
        }
        Some(id) => gc.builder_for(&PartitionId::project(id)).into_iter().collect(),
    }
}

async fn graph_handler(
    State(gc): State<Arc<GarbageCollector>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let partition = params
        .iter()
        .find(|(key, _)| key == "partition")
        .map(|(_, value)| value.as_str());
    let uids: Vec<&str> = params
        .iter()
        .filter(|(key, _)| key == "uid")
        .map(|(_, value)| value.as_str())
        .collect();

    let builders = pick_builders(&gc, partition);
    if builders.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            "no graph builders available for requested partition\n",
        )
            .into_response();
    }

    let mut vertices = Vec::new();
    let mut edges = Vec::new();
    if uids.is_empty() {
        for builder in &builders {
            let (v, e) = to_dot_nodes_and_edges(&builder.graph().snapshot());
            vertices.extend(v);
            edges.extend(e);
        }
    } else {
        for uid in uids {
            // "<partition>:<uid>" addresses one partition directly.
            let (targets, uid) = match uid.split_once(':') {
                Some((partition, uid)) => (pick_builders(&gc, Some(partition)), uid),
                None => (builders.clone(), uid),
            };
            for builder in targets {
                let (v, e) = to_dot_nodes_and_edges_for_objects(
                    &builder.graph().snapshot(),
                    &[uid.to_string()],
                );
                vertices.extend(v);
                edges.extend(e);
            }
        }
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/vnd.graphviz"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        marshal_dot(&vertices, &edges),
    )
        .into_response()
}
