//! Cross-project requests.
//!
//! Each request resolves into ordinary per-project actions: a move becomes
//! `ExportTask` in the source and `ImportTask` in the destination, so every
//! project log still replays on its own. Tag ids are per project and do not
//! travel; assignees travel only if they are members of the destination.

use super::{live_task, ListId, Place, Project, Task, TaskId, TodoAction, TodoDomain, TodoErr};
use concord_core::{smallvec, Candidates, Domain, Effective, Models, MultiDomain, ResourceId};
use im::OrdSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TodoMultiAction {
    /// An ordinary action on one project.
    Single {
        project: ResourceId,
        action: TodoAction,
    },
    MoveTaskTo {
        src: ResourceId,
        dst: ResourceId,
        task_id: TaskId,
        dst_list: ListId,
        place: Place,
    },
    CopyTaskTo {
        src: ResourceId,
        dst: ResourceId,
        task_id: TaskId,
        dst_list: ListId,
    },
    /// Move a list and its visible tasks to the end of `dst`.
    MoveListTo {
        src: ResourceId,
        dst: ResourceId,
        list_id: ListId,
    },
}

impl TodoMultiAction {
    pub fn single(project: ResourceId, action: TodoAction) -> Self {
        TodoMultiAction::Single { project, action }
    }

    fn noop(project: ResourceId) -> Self {
        Self::single(project, TodoAction::NoOp)
    }
}

impl MultiDomain for TodoDomain {
    type MultiAction = TodoMultiAction;

    fn touched(action: &TodoMultiAction) -> BTreeSet<ResourceId> {
        match action {
            TodoMultiAction::Single { project, .. } => BTreeSet::from([*project]),
            TodoMultiAction::MoveTaskTo { src, dst, .. }
            | TodoMultiAction::CopyTaskTo { src, dst, .. }
            | TodoMultiAction::MoveListTo { src, dst, .. } => BTreeSet::from([*src, *dst]),
        }
    }

    fn rebase_multi(
        resource: ResourceId,
        remote: &TodoAction,
        local: &TodoMultiAction,
    ) -> TodoMultiAction {
        match local {
            TodoMultiAction::Single { project, action } if *project == resource => {
                TodoMultiAction::single(*project, TodoDomain::rebase(remote, action))
            }

            TodoMultiAction::MoveTaskTo { src, task_id, .. }
            | TodoMultiAction::CopyTaskTo { src, task_id, .. }
                if *src == resource && removes_task(remote, *task_id) =>
            {
                TodoMultiAction::noop(*src)
            }

            TodoMultiAction::MoveTaskTo {
                src,
                dst,
                task_id,
                dst_list,
                place,
            } if *dst == resource => match remote {
                TodoAction::MoveTask { task_id: moved, .. } => TodoMultiAction::MoveTaskTo {
                    src: *src,
                    dst: *dst,
                    task_id: *task_id,
                    dst_list: *dst_list,
                    place: place.degrade_if_anchor(*moved),
                },
                _ => local.clone(),
            },

            TodoMultiAction::MoveListTo { src, list_id, .. }
                if *src == resource
                    && matches!(remote, TodoAction::DeleteList { list_id: gone } if gone == list_id) =>
            {
                TodoMultiAction::noop(*src)
            }

            _ => local.clone(),
        }
    }

    fn multi_candidates(
        models: &Models<TodoDomain>,
        action: &TodoMultiAction,
    ) -> Candidates<TodoMultiAction> {
        match action {
            TodoMultiAction::MoveTaskTo {
                src,
                dst,
                task_id,
                dst_list,
                place,
            } if *place != Place::AtEnd => {
                let moved = |place| TodoMultiAction::MoveTaskTo {
                    src: *src,
                    dst: *dst,
                    task_id: *task_id,
                    dst_list: *dst_list,
                    place,
                };
                let mut out = smallvec![action.clone(), moved(Place::AtEnd)];
                let first = models
                    .get(dst)
                    .and_then(|m| m.lane(*dst_list).front().copied());
                if let Some(first) = first {
                    out.push(moved(Place::Before { anchor: first }));
                }
                out
            }
            _ => smallvec![action.clone()],
        }
    }

    fn lower(
        models: &Models<TodoDomain>,
        action: &TodoMultiAction,
    ) -> Result<Effective<TodoDomain>, TodoErr> {
        match action {
            TodoMultiAction::Single { project, action } => {
                project_in(models, *project)?;
                Ok(BTreeMap::from([(*project, action.clone())]))
            }

            TodoMultiAction::MoveTaskTo {
                src,
                dst,
                task_id,
                dst_list,
                place,
            } if src == dst => {
                project_in(models, *src)?;
                let moved = TodoAction::MoveTask {
                    task_id: *task_id,
                    to_list: *dst_list,
                    place: *place,
                };
                Ok(BTreeMap::from([(*src, moved)]))
            }
            TodoMultiAction::MoveTaskTo {
                src,
                dst,
                task_id,
                dst_list,
                place,
            } => {
                let task = live_task(project_in(models, *src)?, *task_id)?;
                let task = transferable(task, project_in(models, *dst)?);
                Ok(BTreeMap::from([
                    (*src, TodoAction::ExportTask { task_id: *task_id }),
                    (
                        *dst,
                        TodoAction::ImportTask {
                            list_id: *dst_list,
                            task,
                            place: *place,
                        },
                    ),
                ]))
            }

            TodoMultiAction::CopyTaskTo {
                src,
                dst,
                task_id,
                dst_list,
            } => {
                let task = live_task(project_in(models, *src)?, *task_id)?;
                let task = if src == dst {
                    task.clone()
                } else {
                    transferable(task, project_in(models, *dst)?)
                };
                let copy = TodoAction::ImportTask {
                    list_id: *dst_list,
                    task,
                    place: Place::AtEnd,
                };
                Ok(BTreeMap::from([(*dst, copy)]))
            }

            TodoMultiAction::MoveListTo { src, dst, .. } if src == dst => {
                project_in(models, *src)?;
                Ok(BTreeMap::from([(*src, TodoAction::NoOp)]))
            }
            TodoMultiAction::MoveListTo { src, dst, list_id } => {
                let from = project_in(models, *src)?;
                let to = project_in(models, *dst)?;
                let name = from
                    .list_names
                    .get(list_id)
                    .cloned()
                    .ok_or(TodoErr::MissingList)?;
                let tasks = from
                    .visible_tasks(*list_id)
                    .into_iter()
                    .map(|(_, task)| transferable(task, to))
                    .collect();
                Ok(BTreeMap::from([
                    (*src, TodoAction::DeleteList { list_id: *list_id }),
                    (*dst, TodoAction::ImportList { name, tasks }),
                ]))
            }
        }
    }
}

fn project_in(models: &Models<TodoDomain>, id: ResourceId) -> Result<&Project, TodoErr> {
    models.get(&id).ok_or(TodoErr::MissingProject)
}

fn removes_task(remote: &TodoAction, task: TaskId) -> bool {
    matches!(
        remote,
        TodoAction::DeleteTask { task_id, .. } | TodoAction::ExportTask { task_id }
            if *task_id == task
    )
}

/// `task` as it lands in `dst`.
fn transferable(task: &Task, dst: &Project) -> Task {
    let mut task = task.clone();
    task.tags = OrdSet::new();
    task.assignees = task
        .assignees
        .iter()
        .filter(|user| dst.members.contains(*user))
        .cloned()
        .collect();
    task
}
