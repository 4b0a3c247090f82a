//! Structural Diff Engine
//!
//! Computes and applies structural deltas between two versions of a cluster
//! document. Diffs operate on the canonical JSON tree, recursing into
//! objects and replacing differing leaves wholesale, so a diff between two
//! large documents that share most structure stays small. Whether a diff may
//! be applied against a given base is the caller's business, negotiated via
//! generation hashes.

use crate::error::{VolmeshError, VolmeshResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One step of a structural diff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DiffOp {
    /// Set the value at `path`, replacing whatever is there
    Set { path: Vec<String>, value: Value },

    /// Remove the entry at `path`
    Remove { path: Vec<String> },
}

/// A structural delta between two versions of a document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    /// Steps to apply, in order
    pub ops: Vec<DiffOp>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Compute the diff that turns `before` into `after`.
pub fn create_diff<T: Serialize>(before: &T, after: &T) -> VolmeshResult<Diff> {
    let before = serde_json::to_value(before)?;
    let after = serde_json::to_value(after)?;
    let mut ops = Vec::new();
    diff_value(&mut Vec::new(), &before, &after, &mut ops);
    Ok(Diff { ops })
}

/// Apply a diff to `before`, producing the document it was computed against.
pub fn apply_diff<T>(before: &T, diff: &Diff) -> VolmeshResult<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut tree = serde_json::to_value(before)?;
    for op in &diff.ops {
        apply_op(&mut tree, op)?;
    }
    Ok(serde_json::from_value(tree)?)
}

fn diff_value(path: &mut Vec<String>, before: &Value, after: &Value, ops: &mut Vec<DiffOp>) {
    if before == after {
        return;
    }
    match (before, after) {
        (Value::Object(before_map), Value::Object(after_map)) => {
            diff_object(path, before_map, after_map, ops);
        }
        // Leaves (scalars and arrays) are replaced wholesale.
        _ => ops.push(DiffOp::Set {
            path: path.clone(),
            value: after.clone(),
        }),
    }
}

fn diff_object(
    path: &mut Vec<String>,
    before: &Map<String, Value>,
    after: &Map<String, Value>,
    ops: &mut Vec<DiffOp>,
) {
    for key in before.keys() {
        if !after.contains_key(key) {
            let mut removed = path.clone();
            removed.push(key.clone());
            ops.push(DiffOp::Remove { path: removed });
        }
    }
    for (key, after_value) in after {
        path.push(key.clone());
        match before.get(key) {
            Some(before_value) => diff_value(path, before_value, after_value, ops),
            None => ops.push(DiffOp::Set {
                path: path.clone(),
                value: after_value.clone(),
            }),
        }
        path.pop();
    }
}

fn apply_op(tree: &mut Value, op: &DiffOp) -> VolmeshResult<()> {
    match op {
        DiffOp::Set { path, value } => {
            let slot = resolve_slot(tree, path)?;
            *slot = value.clone();
        }
        DiffOp::Remove { path } => {
            let (parent, key) = path.split_at(path.len().saturating_sub(1));
            let key = key.first().ok_or_else(|| VolmeshError::DiffApply {
                reason: "remove of document root".to_string(),
            })?;
            let parent = resolve_existing(tree, parent)?;
            let object = parent.as_object_mut().ok_or_else(|| VolmeshError::DiffApply {
                reason: format!("remove path {parent_path:?} is not an object", parent_path = path),
            })?;
            object.remove(key).ok_or_else(|| VolmeshError::DiffApply {
                reason: format!("remove path {path:?} not present"),
            })?;
        }
    }
    Ok(())
}

/// Navigate to the slot a `Set` targets, creating the final map entry if the
/// key is new. Intermediate steps must already exist: a diff never sets below
/// a subtree it did not first set wholesale.
fn resolve_slot<'a>(tree: &'a mut Value, path: &[String]) -> VolmeshResult<&'a mut Value> {
    let (parents, last) = match path.split_last() {
        Some((last, parents)) => (parents, last),
        None => return Ok(tree),
    };
    let parent = resolve_existing(tree, parents)?;
    let object = parent.as_object_mut().ok_or_else(|| VolmeshError::DiffApply {
        reason: format!("set path {path:?} traverses a non-object"),
    })?;
    Ok(object.entry(last.clone()).or_insert(Value::Null))
}

fn resolve_existing<'a>(tree: &'a mut Value, path: &[String]) -> VolmeshResult<&'a mut Value> {
    let mut current = tree;
    for step in path {
        current = current
            .as_object_mut()
            .and_then(|object| object.get_mut(step))
            .ok_or_else(|| VolmeshError::DiffApply {
                reason: format!("path step {step:?} not present"),
            })?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Application, Deployment, DeploymentState, DockerImage, Node, NodeState,
    };
    use uuid::Uuid;

    fn deployment(n: u128) -> Deployment {
        let nodes = (0..n).map(|i| {
            Node::new(Uuid::from_u128(i + 1), format!("node{i}.example.com")).with_applications([
                Application::new(
                    format!("app{i}"),
                    DockerImage::from_string("postgresql"),
                ),
            ])
        });
        Deployment::new(nodes)
    }

    #[test]
    fn round_trip_configuration() {
        let before = deployment(2);
        let after = before.update_node(Node::new(Uuid::from_u128(99), "late.example.com"));
        let diff = create_diff(&before, &after).unwrap();
        assert_eq!(apply_diff(&before, &diff).unwrap(), after);
    }

    #[test]
    fn round_trip_with_removal() {
        let before = deployment(3);
        let mut after = before.clone();
        after.nodes.remove(&Uuid::from_u128(2));
        let diff = create_diff(&before, &after).unwrap();
        assert_eq!(apply_diff(&before, &diff).unwrap(), after);
    }

    #[test]
    fn round_trip_state_documents() {
        let uuid = Uuid::from_u128(5);
        let before = DeploymentState::default();
        let after = before.update_node(
            NodeState::new(uuid, "192.0.2.17").with_applications([Application::new(
                "db",
                DockerImage::from_string("postgresql"),
            )]),
        );
        let diff = create_diff(&before, &after).unwrap();
        assert_eq!(apply_diff(&before, &diff).unwrap(), after);
    }

    #[test]
    fn identical_documents_diff_empty() {
        let doc = deployment(2);
        assert!(create_diff(&doc, &doc).unwrap().is_empty());
    }

    #[test]
    fn large_document_diff_stays_proportional() {
        let before = deployment(1);
        let mut big_node = before.nodes.values().next().unwrap().clone();
        for i in 0..800 {
            let app = Application::new(
                format!("postgres-{i}"),
                DockerImage::from_string("postgresql"),
            );
            big_node.applications.insert(app.name.clone(), app);
        }
        let after = before.update_node(big_node.clone());

        let extra = Application::new("one-more", DockerImage::from_string("redis"));
        let mut final_node = big_node;
        final_node.applications.insert(extra.name.clone(), extra);
        let last = after.update_node(final_node);

        let diff = create_diff(&after, &last).unwrap();
        // One application changed; the diff must not re-ship the other 800.
        assert_eq!(diff.ops.len(), 1);
        assert_eq!(apply_diff(&after, &diff).unwrap(), last);
    }

    #[test]
    fn corrupt_diff_is_rejected() {
        let doc = deployment(1);
        let diff = Diff {
            ops: vec![DiffOp::Remove {
                path: vec!["nodes".to_string(), "no-such-node".to_string()],
            }],
        };
        assert!(apply_diff(&doc, &diff).is_err());
    }
}
