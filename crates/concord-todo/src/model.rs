//! Task-tracker data model.

use chrono::NaiveDate;
use im::{OrdMap, OrdSet, Vector};
use serde::{Deserialize, Serialize};

pub type ListId = u64;
pub type TaskId = u64;
pub type TagId = u64;
pub type UserId = String;

/// Owner of a freshly created project.
pub const INITIAL_OWNER: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectMode {
    Personal,
    Collaborative,
}

/// A calendar date. Only dates from 1970 on are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DueDate {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl DueDate {
    pub fn new(year: i32, month: u32, day: u32) -> Self {
        Self { year, month, day }
    }

    pub fn is_valid(&self) -> bool {
        self.year >= 1970 && NaiveDate::from_ymd_opt(self.year, self.month, self.day).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub title: String,
    pub notes: String,
    pub completed: bool,
    pub starred: bool,
    pub due_date: Option<DueDate>,
    pub assignees: OrdSet<UserId>,
    pub tags: OrdSet<TagId>,
    /// Soft-deleted tasks stay in `task_data` but leave every list.
    pub deleted: bool,
    pub deleted_by: Option<UserId>,
    pub deleted_from_list: Option<ListId>,
}

impl Task {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            notes: String::new(),
            completed: false,
            starred: false,
            due_date: None,
            assignees: OrdSet::new(),
            tags: OrdSet::new(),
            deleted: false,
            deleted_by: None,
            deleted_from_list: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
}

/// Where a moved task lands inside its target list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Place {
    AtEnd,
    After { anchor: TaskId },
    Before { anchor: TaskId },
}

impl Place {
    /// Insertion index in `lane`, or `None` when the anchor is not there.
    pub(crate) fn position(&self, lane: &Vector<TaskId>) -> Option<usize> {
        match self {
            Place::AtEnd => Some(lane.len()),
            Place::Before { anchor } => lane.index_of(anchor),
            Place::After { anchor } => lane.index_of(anchor).map(|i| i + 1),
        }
    }

    /// Fall back to the end when the anchor is the task that moved.
    pub(crate) fn degrade_if_anchor(self, moved: TaskId) -> Place {
        match self {
            Place::After { anchor } | Place::Before { anchor } if anchor == moved => Place::AtEnd,
            place => place,
        }
    }
}

/// Where a moved list lands among the project's lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ListPlace {
    AtEnd,
    After { anchor: ListId },
    Before { anchor: ListId },
}

impl ListPlace {
    pub(crate) fn position(&self, lists: &Vector<ListId>) -> Option<usize> {
        match self {
            ListPlace::AtEnd => Some(lists.len()),
            ListPlace::Before { anchor } => lists.index_of(anchor),
            ListPlace::After { anchor } => lists.index_of(anchor).map(|i| i + 1),
        }
    }
}

/// One shared project: ordered lists of tasks plus tags and members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub mode: ProjectMode,
    pub owner: UserId,
    pub members: OrdSet<UserId>,
    pub lists: Vector<ListId>,
    pub list_names: OrdMap<ListId, String>,
    /// Task order per list.
    pub tasks: OrdMap<ListId, Vector<TaskId>>,
    pub task_data: OrdMap<TaskId, Task>,
    pub tags: OrdMap<TagId, Tag>,
    pub next_list_id: ListId,
    pub next_task_id: TaskId,
    pub next_tag_id: TagId,
}

impl Default for Project {
    fn default() -> Self {
        Self {
            mode: ProjectMode::Personal,
            owner: INITIAL_OWNER.to_string(),
            members: OrdSet::unit(INITIAL_OWNER.to_string()),
            lists: Vector::new(),
            list_names: OrdMap::new(),
            tasks: OrdMap::new(),
            task_data: OrdMap::new(),
            tags: OrdMap::new(),
            next_list_id: 0,
            next_task_id: 0,
            next_tag_id: 0,
        }
    }
}

impl Project {
    pub fn has_list(&self, list: ListId) -> bool {
        self.lists.contains(&list)
    }

    /// Task order of `list`; empty for unknown lists.
    pub fn lane(&self, list: ListId) -> Vector<TaskId> {
        self.tasks.get(&list).cloned().unwrap_or_default()
    }

    /// The list currently holding `task`.
    pub fn list_of(&self, task: TaskId) -> Option<ListId> {
        self.lists
            .iter()
            .copied()
            .find(|list| self.tasks.get(list).is_some_and(|lane| lane.contains(&task)))
    }

    pub fn list_by_name(&self, name: &str) -> Option<ListId> {
        self.lists
            .iter()
            .copied()
            .find(|list| self.list_names.get(list).is_some_and(|n| n.eq_ignore_ascii_case(name)))
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.task_data.get(&id).filter(|task| !task.deleted)
    }

    /// Non-deleted tasks of `list`, in order.
    pub fn visible_tasks(&self, list: ListId) -> Vec<(TaskId, &Task)> {
        self.lane(list)
            .iter()
            .filter_map(|id| self.task(*id).map(|task| (*id, task)))
            .collect()
    }

    pub fn task_by_title(&self, list: ListId, title: &str) -> Option<TaskId> {
        self.visible_tasks(list)
            .into_iter()
            .find(|(_, task)| task.title.eq_ignore_ascii_case(title))
            .map(|(id, _)| id)
    }

    /// Starred and not yet completed.
    pub fn priority_tasks(&self) -> Vec<TaskId> {
        self.visible_in_list_order(|task| task.starred && !task.completed)
    }

    pub fn logbook_tasks(&self) -> Vec<TaskId> {
        self.visible_in_list_order(|task| task.completed)
    }

    pub fn tag_by_name(&self, name: &str) -> Option<TagId> {
        self.tags
            .iter()
            .find(|(_, tag)| tag.name.eq_ignore_ascii_case(name))
            .map(|(id, _)| *id)
    }

    fn visible_in_list_order(&self, keep: impl Fn(&Task) -> bool) -> Vec<TaskId> {
        self.lists
            .iter()
            .flat_map(|list| self.visible_tasks(*list))
            .filter(|(_, task)| keep(task))
            .map(|(id, _)| id)
            .collect()
    }

    pub(crate) fn list_name_taken(&self, name: &str, except: Option<ListId>) -> bool {
        self.list_names
            .iter()
            .any(|(id, existing)| Some(*id) != except && existing.eq_ignore_ascii_case(name))
    }

    pub(crate) fn task_title_taken(&self, list: ListId, title: &str, except: Option<TaskId>) -> bool {
        let Some(lane) = self.tasks.get(&list) else {
            return false;
        };
        lane.iter().any(|id| {
            Some(*id) != except
                && self
                    .task(*id)
                    .is_some_and(|task| task.title.eq_ignore_ascii_case(title))
        })
    }

    pub(crate) fn tag_name_taken(&self, name: &str, except: Option<TagId>) -> bool {
        self.tags
            .iter()
            .any(|(id, tag)| Some(*id) != except && tag.name.eq_ignore_ascii_case(name))
    }
}
