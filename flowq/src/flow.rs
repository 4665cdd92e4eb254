//! Parent/child job trees.
//!
//! A flow is inserted parent first in a single script: every node with
//! children starts in `waiting-children`, leaves start like ordinary jobs,
//! and each child carries a reference to its parent's queue key so that
//! finishing it updates the parent wherever it lives.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::events::QueueEventPayload;
use crate::job::JobHandle;
use crate::keys::QueueKeys;
use crate::opts::{JobOptions, ParentRef};
use crate::queue::Queue;
use crate::scripts::{AddOutcome, Dependencies, EncodedJob, NewJob, add_encoded, check_flow};
use crate::store::Store;

/// One job of a flow and the children it waits for.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowNode {
    pub name: String,
    /// Queue the job is added to, under the same prefix as the caller.
    pub queue_name: String,
    pub data: Value,
    pub opts: JobOptions,
    pub children: Vec<FlowNode>,
}

impl FlowNode {
    pub fn new(name: impl Into<String>, queue_name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            queue_name: queue_name.into(),
            data,
            opts: JobOptions::default(),
            children: Vec::new(),
        }
    }

    pub fn with_opts(mut self, opts: JobOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn with_child(mut self, child: FlowNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = FlowNode>) -> Self {
        self.children.extend(children);
        self
    }
}

/// Ids assigned to an inserted flow, shaped like the input tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowJob {
    pub handle: JobHandle,
    pub queue_name: String,
    pub children: Vec<FlowJob>,
}

/// Child counts of a parent job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DependencyCounts {
    pub pending: usize,
    pub processed: usize,
    pub failed: usize,
    pub unsuccessful: usize,
}

struct Planned {
    job: EncodedJob,
    queue_name: String,
    child_count: usize,
}

impl<S: Store> Queue<S> {
    /// Insert a job tree atomically and return the ids it was given.
    ///
    /// Nodes without a custom id get a fresh uuid so children can point at
    /// their parent before anything is written. Nodes in this queue merge
    /// their options over the queue defaults.
    pub async fn add_flow(&self, root: FlowNode) -> QueueResult<FlowJob> {
        let mut planned = Vec::new();
        let root_parent = root.opts.parent.clone();
        self.plan_node(root, root_parent, &mut planned)?;
        let mut seen = HashSet::new();
        for node in &planned {
            let id = node.job.opts.job_id.as_deref().unwrap_or_default();
            if !seen.insert(node.job.keys.job(id)) {
                return Err(QueueError::InvalidOptions(format!(
                    "job id {id} appears twice in the flow"
                )));
            }
        }

        let root_id = planned
            .first()
            .and_then(|node| node.job.opts.job_id.clone())
            .unwrap_or_default();
        let jobs: Vec<EncodedJob> = planned.iter().map(|node| node.job.clone()).collect();
        let outcomes = self
            .scripts()
            .exec("addFlow", &root_id, move |cmd, ctx| {
                check_flow(cmd, &jobs)?;
                jobs.iter()
                    .map(|job| add_encoded(cmd, ctx, job))
                    .collect::<Result<Vec<_>, _>>()
            })
            .await?;

        for (node, outcome) in planned.iter().zip(&outcomes) {
            if let AddOutcome::Created { id, state, due } = outcome {
                tracing::debug!(queue = %node.queue_name, job_id = %id, "flow job added");
                if node.queue_name == self.name() {
                    self.publish(QueueEventPayload::Added {
                        job_id: id.clone(),
                        name: node.job.name.clone(),
                    });
                    self.publish_placed(id, *state, *due);
                }
            }
        }
        tracing::info!(queue = %self.name(), root = %root_id, jobs = outcomes.len(), "flow added");

        let mut nodes = planned.into_iter().zip(outcomes);
        Ok(rebuild(&mut nodes))
    }

    /// Flatten `node` depth first, parents ahead of their children.
    fn plan_node(
        &self,
        node: FlowNode,
        parent: Option<ParentRef>,
        planned: &mut Vec<Planned>,
    ) -> QueueResult<()> {
        let keys = QueueKeys::new(self.config().prefix.clone(), node.queue_name.clone());
        let mut opts = if node.queue_name == self.name() {
            node.opts.merged_over(&self.config().default_job_options)?
        } else {
            node.opts
        };
        opts.repeat = None;
        opts.parent = parent;
        let job_id = opts
            .job_id
            .get_or_insert_with(|| Uuid::now_v7().to_string())
            .clone();
        opts.validate()?;

        let mut job = NewJob::new(node.name, node.data, opts);
        job.waiting_children = !node.children.is_empty();
        planned.push(Planned {
            job: job.encode(keys.clone())?,
            queue_name: node.queue_name,
            child_count: node.children.len(),
        });

        let as_parent = ParentRef::new(job_id, keys.base());
        for child in node.children {
            self.plan_node(child, Some(as_parent.clone()), planned)?;
        }
        Ok(())
    }

    /// Raw dependency bookkeeping of `job_id`. Entries are full job keys.
    pub async fn get_dependencies(&self, job_id: &str) -> QueueResult<Dependencies> {
        self.scripts().get_dependencies(job_id).await
    }

    pub async fn get_dependencies_count(&self, job_id: &str) -> QueueResult<DependencyCounts> {
        let deps = self.get_dependencies(job_id).await?;
        Ok(DependencyCounts {
            pending: deps.pending.len(),
            processed: deps.processed.len(),
            failed: deps.failed.len(),
            unsuccessful: deps.unsuccessful.len(),
        })
    }

    /// Return values of completed children keyed by child job key.
    pub async fn get_children_values(&self, job_id: &str) -> QueueResult<HashMap<String, Value>> {
        let deps = self.get_dependencies(job_id).await?;
        deps.processed
            .into_iter()
            .map(|(child, raw)| {
                serde_json::from_str::<Value>(&raw)
                    .map(|value| (child, value))
                    .map_err(QueueError::from)
            })
            .collect()
    }

    /// Failure reasons of children recorded on the parent.
    pub async fn get_failed_children_values(
        &self,
        job_id: &str,
    ) -> QueueResult<HashMap<String, String>> {
        Ok(self.get_dependencies(job_id).await?.failed)
    }
}

fn rebuild(nodes: &mut impl Iterator<Item = (Planned, AddOutcome)>) -> FlowJob {
    let Some((node, outcome)) = nodes.next() else {
        return FlowJob {
            handle: JobHandle {
                id: String::new(),
                accepted: false,
            },
            queue_name: String::new(),
            children: Vec::new(),
        };
    };
    let children = (0..node.child_count).map(|_| rebuild(nodes)).collect();
    FlowJob {
        handle: outcome.into(),
        queue_name: node.queue_name,
        children,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::config::QueueConfig;
    use crate::error::ScriptError;
    use crate::job::JobState;
    use crate::store::{ManualClock, MemoryStore};

    fn queues() -> (Queue<MemoryStore>, Queue<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_clock(Arc::new(ManualClock::new(0))));
        (
            Queue::new("parents", store.clone(), QueueConfig::default()),
            Queue::new("children", store, QueueConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_flow_inserts_parent_waiting_for_children() {
        let (parents, children) = queues();
        let flow = parents
            .add_flow(
                FlowNode::new("render", "parents", json!({}))
                    .with_opts(JobOptions::new().with_job_id("video"))
                    .with_child(FlowNode::new("frame", "children", json!(1)))
                    .with_child(FlowNode::new("frame", "children", json!(2))),
            )
            .await
            .unwrap();

        assert_eq!(flow.handle.id, "video");
        assert_eq!(flow.children.len(), 2);
        assert!(flow.children.iter().all(|child| child.queue_name == "children"));
        assert_eq!(
            parents.get_job_state("video").await.unwrap(),
            JobState::WaitingChildren
        );
        assert_eq!(children.get_job_counts().await.unwrap().waiting, 2);

        let counts = parents.get_dependencies_count("video").await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.processed, 0);

        let child = children
            .get_job(&flow.children[0].handle.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(child.parent_key.as_deref(), Some("flowq:parents:video"));
    }

    #[tokio::test]
    async fn test_nested_flow_keeps_tree_shape() {
        let (parents, _children) = queues();
        let flow = parents
            .add_flow(
                FlowNode::new("root", "parents", Value::Null).with_child(
                    FlowNode::new("middle", "parents", Value::Null)
                        .with_child(FlowNode::new("leaf", "children", Value::Null)),
                ),
            )
            .await
            .unwrap();
        let middle = &flow.children[0];
        assert_eq!(middle.children.len(), 1);
        assert_eq!(
            parents.get_job_state(&middle.handle.id).await.unwrap(),
            JobState::WaitingChildren
        );
        let deps = parents.get_dependencies(&flow.handle.id).await.unwrap();
        assert_eq!(
            deps.pending,
            vec![format!("flowq:parents:{}", middle.handle.id)]
        );
    }

    #[tokio::test]
    async fn test_missing_root_parent_writes_nothing() {
        let (parents, children) = queues();
        let err = parents
            .add_flow(
                FlowNode::new("orphan", "parents", Value::Null)
                    .with_opts(
                        JobOptions::new().with_parent(ParentRef::new("gone", "flowq:parents")),
                    )
                    .with_child(FlowNode::new("leaf", "children", Value::Null)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.script_error(), Some(ScriptError::ParentJobNotExist));
        assert!(matches!(err, QueueError::Script { command: "addFlow", .. }));
        assert_eq!(children.count().await.unwrap(), 0);
        assert_eq!(parents.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_child_id_collision_rejects_whole_flow() {
        let (parents, _children) = queues();
        parents
            .add("standalone", Value::Null, JobOptions::new().with_job_id("c2"))
            .await
            .unwrap();

        let err = parents
            .add_flow(
                FlowNode::new("root", "parents", Value::Null)
                    .with_opts(JobOptions::new().with_job_id("root"))
                    .with_child(FlowNode::new("leaf", "parents", Value::Null))
                    .with_child(
                        FlowNode::new("dup", "parents", Value::Null)
                            .with_opts(JobOptions::new().with_job_id("c2")),
                    ),
            )
            .await
            .unwrap_err();

        assert_eq!(err.script_error(), Some(ScriptError::ParentJobCannotBeReplaced));
        assert_eq!(parents.count().await.unwrap(), 1);
        assert_eq!(parents.get_job_state("root").await.unwrap(), JobState::Unknown);
        assert!(parents.get_job("root").await.unwrap().is_none());
        let standalone = parents.get_job("c2").await.unwrap().unwrap();
        assert_eq!(standalone.parent_key, None);
    }

    #[tokio::test]
    async fn test_existing_root_id_is_rejected() {
        let (parents, children) = queues();
        parents
            .add("taken", Value::Null, JobOptions::new().with_job_id("video"))
            .await
            .unwrap();

        let err = parents
            .add_flow(
                FlowNode::new("render", "parents", Value::Null)
                    .with_opts(JobOptions::new().with_job_id("video"))
                    .with_child(FlowNode::new("frame", "children", Value::Null)),
            )
            .await
            .unwrap_err();

        assert_eq!(err.script_error(), Some(ScriptError::ParentJobCannotBeReplaced));
        assert_eq!(children.count().await.unwrap(), 0);
        assert_eq!(parents.get_job_state("video").await.unwrap(), JobState::Waiting);
        let deps = parents.get_dependencies_count("video").await.unwrap();
        assert_eq!(deps, DependencyCounts::default());
    }

    #[tokio::test]
    async fn test_repeated_id_inside_flow_is_rejected() {
        let (parents, _children) = queues();
        let twin = || {
            FlowNode::new("twin", "parents", Value::Null)
                .with_opts(JobOptions::new().with_job_id("twin"))
        };
        let err = parents
            .add_flow(
                FlowNode::new("root", "parents", Value::Null)
                    .with_child(twin())
                    .with_child(twin()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidOptions(_)));
        assert_eq!(parents.count().await.unwrap(), 0);
    }
}
