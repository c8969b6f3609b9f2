//! # Concord Todo
//!
//! A collaborative task tracker as a concord [`Domain`].
//!
//! Projects hold ordered lists of tasks, tags, and (once collaborative) a
//! member set. Deletes of tasks are soft so they can be restored; deleting a
//! list drops its tasks for good.
//!
//! Concurrent edits resolve like this:
//!
//! - anything touching a task that a concurrent `DeleteTask` removed becomes a no-op
//! - assigning a user that a concurrent `RemoveMember` removed becomes a no-op
//! - when two sessions move the same list, the first move to reach the server wins
//! - a task move anchored on a task that concurrently moved falls back to the end
//! - moves whose anchor vanished fall back to "at end", then "before first"
//!
//! Deleting something that is already gone is a successful no-change step,
//! so two sessions deleting the same list both see their delete accepted.

mod model;
mod multi;

pub use model::{
    DueDate, ListId, ListPlace, Place, Project, ProjectMode, Tag, TagId, Task, TaskId, UserId,
    INITIAL_OWNER,
};
pub use multi::TodoMultiAction;

use concord_core::{smallvec, Candidates, Domain};
use im::Vector;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TodoDomain;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TodoAction {
    NoOp,

    AddList { name: String },
    RenameList { list_id: ListId, new_name: String },
    DeleteList { list_id: ListId },
    MoveList { list_id: ListId, place: ListPlace },

    AddTask { list_id: ListId, title: String },
    EditTask { task_id: TaskId, title: String, notes: String },
    DeleteTask { task_id: TaskId, user_id: UserId },
    RestoreTask { task_id: TaskId },
    /// Remove a live task for good; the source half of a cross-project move.
    ExportTask { task_id: TaskId },
    /// Insert a copy of `task` under a fresh id.
    ImportTask { list_id: ListId, task: Task, place: Place },
    /// Append a new list holding copies of `tasks`, in order.
    ImportList { name: String, tasks: Vector<Task> },
    MoveTask { task_id: TaskId, to_list: ListId, place: Place },
    CompleteTask { task_id: TaskId },
    UncompleteTask { task_id: TaskId },
    StarTask { task_id: TaskId },
    UnstarTask { task_id: TaskId },
    SetDueDate { task_id: TaskId, due_date: Option<DueDate> },
    AssignTask { task_id: TaskId, user_id: UserId },
    UnassignTask { task_id: TaskId, user_id: UserId },
    AddTagToTask { task_id: TaskId, tag_id: TagId },
    RemoveTagFromTask { task_id: TaskId, tag_id: TagId },

    CreateTag { name: String },
    RenameTag { tag_id: TagId, new_name: String },
    DeleteTag { tag_id: TagId },

    MakeCollaborative,
    AddMember { user_id: UserId },
    RemoveMember { user_id: UserId },
}

impl TodoAction {
    /// The task this action modifies in place, if any.
    fn edited_task(&self) -> Option<TaskId> {
        match self {
            TodoAction::EditTask { task_id, .. }
            | TodoAction::ExportTask { task_id }
            | TodoAction::MoveTask { task_id, .. }
            | TodoAction::CompleteTask { task_id }
            | TodoAction::UncompleteTask { task_id }
            | TodoAction::StarTask { task_id }
            | TodoAction::UnstarTask { task_id }
            | TodoAction::SetDueDate { task_id, .. }
            | TodoAction::AssignTask { task_id, .. }
            | TodoAction::UnassignTask { task_id, .. }
            | TodoAction::AddTagToTask { task_id, .. }
            | TodoAction::RemoveTagFromTask { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum TodoErr {
    #[error("list does not exist")]
    MissingList,
    #[error("task does not exist")]
    MissingTask,
    #[error("tag does not exist")]
    MissingTag,
    #[error("a list with that name already exists")]
    DuplicateList,
    #[error("a task with that title already exists in the list")]
    DuplicateTask,
    #[error("a tag with that name already exists")]
    DuplicateTag,
    #[error("placement anchor not found")]
    BadAnchor,
    #[error("task is deleted")]
    TaskDeleted,
    #[error("invalid due date")]
    InvalidDate,
    #[error("user is not a project member")]
    NotAMember,
    #[error("personal projects have no members to manage")]
    PersonalProject,
    #[error("the project owner cannot be removed")]
    CannotRemoveOwner,
    #[error("project is not part of the request")]
    MissingProject,
    #[error("action rejected")]
    Rejected,
}

type Step = Result<Project, TodoErr>;

impl Domain for TodoDomain {
    type Model = Project;
    type Action = TodoAction;
    type Err = TodoErr;

    fn init() -> Project {
        Project::default()
    }

    fn try_step(m: &Project, action: &TodoAction) -> Step {
        match action {
            TodoAction::NoOp => Ok(m.clone()),

            TodoAction::AddList { name } => add_list(m, name),
            TodoAction::RenameList { list_id, new_name } => rename_list(m, *list_id, new_name),
            TodoAction::DeleteList { list_id } => Ok(delete_list(m, *list_id)),
            TodoAction::MoveList { list_id, place } => move_list(m, *list_id, place),

            TodoAction::AddTask { list_id, title } => add_task(m, *list_id, title),
            TodoAction::EditTask {
                task_id,
                title,
                notes,
            } => edit_task(m, *task_id, title, notes),
            TodoAction::DeleteTask { task_id, user_id } => Ok(delete_task(m, *task_id, user_id)),
            TodoAction::RestoreTask { task_id } => restore_task(m, *task_id),
            TodoAction::ExportTask { task_id } => export_task(m, *task_id),
            TodoAction::ImportTask {
                list_id,
                task,
                place,
            } => import_task(m, *list_id, task, place),
            TodoAction::ImportList { name, tasks } => import_list(m, name, tasks),
            TodoAction::MoveTask {
                task_id,
                to_list,
                place,
            } => move_task(m, *task_id, *to_list, place),
            TodoAction::CompleteTask { task_id } => update_task(m, *task_id, |t| t.completed = true),
            TodoAction::UncompleteTask { task_id } => {
                update_task(m, *task_id, |t| t.completed = false)
            }
            TodoAction::StarTask { task_id } => update_task(m, *task_id, |t| t.starred = true),
            TodoAction::UnstarTask { task_id } => update_task(m, *task_id, |t| t.starred = false),
            TodoAction::SetDueDate { task_id, due_date } => {
                live_task(m, *task_id)?;
                if due_date.is_some_and(|d| !d.is_valid()) {
                    return Err(TodoErr::InvalidDate);
                }
                update_task(m, *task_id, |t| t.due_date = *due_date)
            }
            TodoAction::AssignTask { task_id, user_id } => {
                live_task(m, *task_id)?;
                if !m.members.contains(user_id) {
                    return Err(TodoErr::NotAMember);
                }
                update_task(m, *task_id, |t| {
                    t.assignees.insert(user_id.clone());
                })
            }
            TodoAction::UnassignTask { task_id, user_id } => update_task(m, *task_id, |t| {
                t.assignees.remove(user_id);
            }),
            TodoAction::AddTagToTask { task_id, tag_id } => {
                live_task(m, *task_id)?;
                if !m.tags.contains_key(tag_id) {
                    return Err(TodoErr::MissingTag);
                }
                update_task(m, *task_id, |t| {
                    t.tags.insert(*tag_id);
                })
            }
            TodoAction::RemoveTagFromTask { task_id, tag_id } => update_task(m, *task_id, |t| {
                t.tags.remove(tag_id);
            }),

            TodoAction::CreateTag { name } => create_tag(m, name),
            TodoAction::RenameTag { tag_id, new_name } => rename_tag(m, *tag_id, new_name),
            TodoAction::DeleteTag { tag_id } => Ok(delete_tag(m, *tag_id)),

            TodoAction::MakeCollaborative => Ok(Project {
                mode: ProjectMode::Collaborative,
                ..m.clone()
            }),
            TodoAction::AddMember { user_id } => {
                if m.mode == ProjectMode::Personal {
                    return Err(TodoErr::PersonalProject);
                }
                let mut next = m.clone();
                next.members.insert(user_id.clone());
                Ok(next)
            }
            TodoAction::RemoveMember { user_id } => remove_member(m, user_id),
        }
    }

    fn rebase(remote: &TodoAction, local: &TodoAction) -> TodoAction {
        match (remote, local) {
            (TodoAction::NoOp, _) => local.clone(),
            (_, TodoAction::NoOp) => TodoAction::NoOp,

            (
                TodoAction::DeleteTask { task_id: gone, .. } | TodoAction::ExportTask { task_id: gone },
                _,
            ) if local.edited_task() == Some(*gone) =>
            {
                TodoAction::NoOp
            }

            (
                TodoAction::RemoveMember { user_id: removed },
                TodoAction::AssignTask { user_id, .. },
            ) if removed == user_id => TodoAction::NoOp,

            (
                TodoAction::MoveList { list_id: theirs, .. },
                TodoAction::MoveList { list_id: ours, .. },
            ) if theirs == ours => TodoAction::NoOp,

            (
                TodoAction::MoveTask { task_id: moved, .. },
                TodoAction::MoveTask {
                    task_id,
                    to_list,
                    place,
                },
            ) if moved != task_id => TodoAction::MoveTask {
                task_id: *task_id,
                to_list: *to_list,
                place: place.degrade_if_anchor(*moved),
            },

            (
                TodoAction::MoveTask { task_id: moved, .. },
                TodoAction::ImportTask {
                    list_id,
                    task,
                    place,
                },
            ) => TodoAction::ImportTask {
                list_id: *list_id,
                task: task.clone(),
                place: place.degrade_if_anchor(*moved),
            },

            _ => local.clone(),
        }
    }

    fn candidates(m: &Project, action: &TodoAction) -> Candidates<TodoAction> {
        match action {
            TodoAction::MoveTask {
                task_id,
                to_list,
                place,
            } if *place != Place::AtEnd => {
                let moved = |place| TodoAction::MoveTask {
                    task_id: *task_id,
                    to_list: *to_list,
                    place,
                };
                let mut out = smallvec![action.clone(), moved(Place::AtEnd)];
                if let Some(first) = m.lane(*to_list).front() {
                    out.push(moved(Place::Before { anchor: *first }));
                }
                out
            }
            TodoAction::ImportTask {
                list_id,
                task,
                place,
            } if *place != Place::AtEnd => {
                let imported = |place| TodoAction::ImportTask {
                    list_id: *list_id,
                    task: task.clone(),
                    place,
                };
                let mut out = smallvec![action.clone(), imported(Place::AtEnd)];
                if let Some(first) = m.lane(*list_id).front() {
                    out.push(imported(Place::Before { anchor: *first }));
                }
                out
            }
            TodoAction::MoveList { list_id, place } if *place != ListPlace::AtEnd => {
                let moved = |place| TodoAction::MoveList {
                    list_id: *list_id,
                    place,
                };
                let mut out = smallvec![action.clone(), moved(ListPlace::AtEnd)];
                if let Some(first) = m.lists.front() {
                    out.push(moved(ListPlace::Before { anchor: *first }));
                }
                out
            }
            _ => smallvec![action.clone()],
        }
    }

    fn reject_err() -> TodoErr {
        TodoErr::Rejected
    }
}

// ============================================================================
// Transitions
// ============================================================================

fn add_list(m: &Project, name: &str) -> Step {
    if m.list_name_taken(name, None) {
        return Err(TodoErr::DuplicateList);
    }
    let id = m.next_list_id;
    let mut next = m.clone();
    next.lists.push_back(id);
    next.list_names.insert(id, name.to_string());
    next.tasks.insert(id, Vector::new());
    next.next_list_id += 1;
    Ok(next)
}

fn rename_list(m: &Project, list: ListId, name: &str) -> Step {
    if !m.has_list(list) {
        return Err(TodoErr::MissingList);
    }
    if m.list_name_taken(name, Some(list)) {
        return Err(TodoErr::DuplicateList);
    }
    let mut next = m.clone();
    next.list_names.insert(list, name.to_string());
    Ok(next)
}

fn delete_list(m: &Project, list: ListId) -> Project {
    if !m.has_list(list) {
        return m.clone();
    }
    let mut next = m.clone();
    for task in m.lane(list) {
        next.task_data.remove(&task);
    }
    next.lists = without(&m.lists, list);
    next.list_names.remove(&list);
    next.tasks.remove(&list);
    next
}

fn move_list(m: &Project, list: ListId, place: &ListPlace) -> Step {
    if !m.has_list(list) {
        return Err(TodoErr::MissingList);
    }
    let mut lists = without(&m.lists, list);
    let at = place.position(&lists).ok_or(TodoErr::BadAnchor)?;
    lists.insert(at, list);
    Ok(Project { lists, ..m.clone() })
}

fn add_task(m: &Project, list: ListId, title: &str) -> Step {
    if !m.has_list(list) {
        return Err(TodoErr::MissingList);
    }
    if m.task_title_taken(list, title, None) {
        return Err(TodoErr::DuplicateTask);
    }
    let id = m.next_task_id;
    let mut lane = m.lane(list);
    lane.push_back(id);
    let mut next = m.clone();
    next.tasks.insert(list, lane);
    next.task_data.insert(id, Task::new(title));
    next.next_task_id += 1;
    Ok(next)
}

fn edit_task(m: &Project, task: TaskId, title: &str, notes: &str) -> Step {
    live_task(m, task)?;
    if let Some(list) = m.list_of(task) {
        if m.task_title_taken(list, title, Some(task)) {
            return Err(TodoErr::DuplicateTask);
        }
    }
    update_task(m, task, |t| {
        t.title = title.to_string();
        t.notes = notes.to_string();
    })
}

fn delete_task(m: &Project, task: TaskId, user: &UserId) -> Project {
    let Ok(current) = live_task(m, task) else {
        return m.clone();
    };
    let mut updated = current.clone();
    updated.deleted = true;
    updated.deleted_by = Some(user.clone());
    updated.deleted_from_list = m.list_of(task);

    let mut next = m.clone();
    next.tasks = m
        .tasks
        .iter()
        .map(|(list, lane)| (*list, without(lane, task)))
        .collect();
    next.task_data.insert(task, updated);
    next
}

fn restore_task(m: &Project, task: TaskId) -> Step {
    let current = m.task_data.get(&task).ok_or(TodoErr::MissingTask)?;
    if !current.deleted {
        return Ok(m.clone());
    }
    let target = current
        .deleted_from_list
        .filter(|list| m.has_list(*list))
        .or_else(|| m.lists.front().copied())
        .ok_or(TodoErr::MissingList)?;
    if m.task_title_taken(target, &current.title, None) {
        return Err(TodoErr::DuplicateTask);
    }

    let mut restored = current.clone();
    restored.deleted = false;
    restored.deleted_by = None;
    restored.deleted_from_list = None;

    let mut lane = m.lane(target);
    lane.push_back(task);
    let mut next = m.clone();
    next.tasks.insert(target, lane);
    next.task_data.insert(task, restored);
    Ok(next)
}

fn export_task(m: &Project, task: TaskId) -> Step {
    live_task(m, task)?;
    let mut next = m.clone();
    next.tasks = m
        .tasks
        .iter()
        .map(|(list, lane)| (*list, without(lane, task)))
        .collect();
    next.task_data.remove(&task);
    Ok(next)
}

fn import_task(m: &Project, list: ListId, task: &Task, place: &Place) -> Step {
    if task.deleted {
        return Err(TodoErr::TaskDeleted);
    }
    if !m.has_list(list) {
        return Err(TodoErr::MissingList);
    }
    if m.task_title_taken(list, &task.title, None) {
        return Err(TodoErr::DuplicateTask);
    }
    let mut lane = m.lane(list);
    let at = place.position(&lane).ok_or(TodoErr::BadAnchor)?;
    let id = m.next_task_id;
    lane.insert(at, id);
    let mut next = m.clone();
    next.tasks.insert(list, lane);
    next.task_data.insert(id, task.clone());
    next.next_task_id += 1;
    Ok(next)
}

fn import_list(m: &Project, name: &str, tasks: &Vector<Task>) -> Step {
    let list = m.next_list_id;
    tasks
        .iter()
        .try_fold(add_list(m, name)?, |next, task| {
            import_task(&next, list, task, &Place::AtEnd)
        })
}

fn move_task(m: &Project, task: TaskId, to_list: ListId, place: &Place) -> Step {
    let current = live_task(m, task)?;
    if !m.has_list(to_list) {
        return Err(TodoErr::MissingList);
    }
    if m.task_title_taken(to_list, &current.title, Some(task)) {
        return Err(TodoErr::DuplicateTask);
    }

    let mut tasks: im::OrdMap<ListId, Vector<TaskId>> = m
        .tasks
        .iter()
        .map(|(list, lane)| (*list, without(lane, task)))
        .collect();
    let mut lane = tasks.get(&to_list).cloned().unwrap_or_default();
    let at = place.position(&lane).ok_or(TodoErr::BadAnchor)?;
    lane.insert(at, task);
    tasks.insert(to_list, lane);
    Ok(Project { tasks, ..m.clone() })
}

fn create_tag(m: &Project, name: &str) -> Step {
    if m.tag_name_taken(name, None) {
        return Err(TodoErr::DuplicateTag);
    }
    let id = m.next_tag_id;
    let mut next = m.clone();
    next.tags.insert(
        id,
        Tag {
            name: name.to_string(),
        },
    );
    next.next_tag_id += 1;
    Ok(next)
}

fn rename_tag(m: &Project, tag: TagId, name: &str) -> Step {
    if !m.tags.contains_key(&tag) {
        return Err(TodoErr::MissingTag);
    }
    if m.tag_name_taken(name, Some(tag)) {
        return Err(TodoErr::DuplicateTag);
    }
    let mut next = m.clone();
    next.tags.insert(
        tag,
        Tag {
            name: name.to_string(),
        },
    );
    Ok(next)
}

fn delete_tag(m: &Project, tag: TagId) -> Project {
    if !m.tags.contains_key(&tag) {
        return m.clone();
    }
    let mut next = m.clone();
    next.tags.remove(&tag);
    next.task_data = m
        .task_data
        .iter()
        .map(|(id, task)| {
            let mut task = task.clone();
            task.tags.remove(&tag);
            (*id, task)
        })
        .collect();
    next
}

fn remove_member(m: &Project, user: &UserId) -> Step {
    if *user == m.owner {
        return Err(TodoErr::CannotRemoveOwner);
    }
    if !m.members.contains(user) {
        return Ok(m.clone());
    }
    let mut next = m.clone();
    next.members.remove(user);
    next.task_data = m
        .task_data
        .iter()
        .map(|(id, task)| {
            let mut task = task.clone();
            task.assignees.remove(user);
            (*id, task)
        })
        .collect();
    Ok(next)
}

fn live_task(m: &Project, id: TaskId) -> Result<&Task, TodoErr> {
    let task = m.task_data.get(&id).ok_or(TodoErr::MissingTask)?;
    if task.deleted {
        return Err(TodoErr::TaskDeleted);
    }
    Ok(task)
}

fn update_task(m: &Project, id: TaskId, edit: impl FnOnce(&mut Task)) -> Step {
    let mut task = live_task(m, id)?.clone();
    edit(&mut task);
    let mut next = m.clone();
    next.task_data.insert(id, task);
    Ok(next)
}

fn without<T: Clone + PartialEq>(items: &Vector<T>, item: T) -> Vector<T> {
    match items.index_of(&item) {
        Some(i) => {
            let mut out = items.clone();
            out.remove(i);
            out
        }
        None => items.clone(),
    }
}
