// Status filtering and ordering for the task list

use crate::models::Task;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

/// Which tasks to show.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    All,
    #[default]
    Open,
    Done,
}

impl StatusFilter {
    pub fn matches(self, task: &Task) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Open => !task.completed,
            StatusFilter::Done => task.completed,
        }
    }
}

impl std::fmt::Display for StatusFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatusFilter::All => "all",
            StatusFilter::Open => "open",
            StatusFilter::Done => "done",
        };
        write!(f, "{}", name)
    }
}

/// How to order the visible tasks. The wire names (`newest`, `oldest`,
/// `az`, `za`) are what the product persists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum SortOrder {
    #[default]
    #[serde(rename = "newest")]
    #[value(name = "newest")]
    Newest,
    #[serde(rename = "oldest")]
    #[value(name = "oldest")]
    Oldest,
    #[serde(rename = "az")]
    #[value(name = "az")]
    TitleAsc,
    #[serde(rename = "za")]
    #[value(name = "za")]
    TitleDesc,
}

impl std::fmt::Display for SortOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SortOrder::Newest => "newest",
            SortOrder::Oldest => "oldest",
            SortOrder::TitleAsc => "az",
            SortOrder::TitleDesc => "za",
        };
        write!(f, "{}", name)
    }
}

/// Filter then stable-sort a snapshot for display.
///
/// Title ordering is case-insensitive; exact ties keep their list order in
/// both directions, so `za` is `az` reversed only up to ties. The comparison
/// is by Unicode code point after lowercasing, not locale collation, so
/// accented titles ("Émile") sort after the ASCII range rather than next to
/// their unaccented neighbors.
pub fn visible_tasks(tasks: &[Task], status: StatusFilter, order: SortOrder) -> Vec<Task> {
    let mut visible: Vec<Task> = tasks.iter().filter(|t| status.matches(t)).cloned().collect();

    match order {
        SortOrder::Newest => visible.sort_by_key(|t| Reverse(t.created_at)),
        SortOrder::Oldest => visible.sort_by_key(|t| t.created_at),
        SortOrder::TitleAsc => visible.sort_by_cached_key(|t| t.title.to_lowercase()),
        SortOrder::TitleDesc => visible.sort_by_cached_key(|t| Reverse(t.title.to_lowercase())),
    }

    visible
}

/// Header counts: total, still open, completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub total: usize,
    pub open: usize,
    pub done: usize,
}

pub fn count_tasks(tasks: &[Task]) -> TaskCounts {
    let done = tasks.iter().filter(|t| t.completed).count();
    TaskCounts {
        total: tasks.len(),
        open: tasks.len() - done,
        done,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, title: &str, completed: bool, created_at: i64) -> Task {
        Task {
            id: id.to_string(),
            user_id: "u1".to_string(),
            title: title.to_string(),
            completed,
            created_at,
            updated_at: created_at,
        }
    }

    fn ids(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn test_status_filters_partition_the_list() {
        let all = vec![
            task("1", "a", false, 1),
            task("2", "b", true, 2),
            task("3", "c", false, 3),
            task("4", "d", true, 4),
        ];

        let open = visible_tasks(&all, StatusFilter::Open, SortOrder::Newest);
        let done = visible_tasks(&all, StatusFilter::Done, SortOrder::Newest);
        let everything = visible_tasks(&all, StatusFilter::All, SortOrder::Newest);

        assert_eq!(open.len() + done.len(), everything.len());
        assert!(open.iter().all(|t| !t.completed));
        assert!(done.iter().all(|t| t.completed));
        assert!(open.iter().all(|t| !done.iter().any(|d| d.id == t.id)));
    }

    #[test]
    fn test_newest_and_oldest_order() {
        let all = vec![task("old", "x", false, 100), task("new", "y", false, 300), task("mid", "z", false, 200)];

        let newest = visible_tasks(&all, StatusFilter::All, SortOrder::Newest);
        assert_eq!(ids(&newest), vec!["new", "mid", "old"]);

        let oldest = visible_tasks(&all, StatusFilter::All, SortOrder::Oldest);
        assert_eq!(ids(&oldest), vec!["old", "mid", "new"]);
    }

    #[test]
    fn test_newest_tie_keeps_list_order() {
        let all = vec![task("first", "x", false, 100), task("second", "y", false, 100)];

        let sorted = visible_tasks(&all, StatusFilter::All, SortOrder::Newest);
        assert_eq!(ids(&sorted), vec!["first", "second"]);
    }

    #[test]
    fn test_title_sort_is_case_insensitive() {
        let all = vec![
            task("1", "banana", false, 1),
            task("2", "Apple", false, 2),
            task("3", "cherry", false, 3),
        ];

        let sorted = visible_tasks(&all, StatusFilter::All, SortOrder::TitleAsc);
        assert_eq!(ids(&sorted), vec!["2", "1", "3"]);
    }

    #[test]
    fn test_title_sort_is_code_point_order_not_collation() {
        let all = vec![
            task("1", "Émile", false, 1),
            task("2", "zebra", false, 2),
            task("3", "apple", false, 3),
        ];

        // "é" (U+00E9) is beyond the ASCII range, so it lands last
        let sorted = visible_tasks(&all, StatusFilter::All, SortOrder::TitleAsc);
        assert_eq!(ids(&sorted), vec!["3", "2", "1"]);
    }

    #[test]
    fn test_title_desc_reverses_asc_for_unique_titles() {
        let all = vec![
            task("1", "pear", false, 1),
            task("2", "apple", false, 2),
            task("3", "Mango", false, 3),
            task("4", "kiwi", false, 4),
        ];

        let asc = visible_tasks(&all, StatusFilter::All, SortOrder::TitleAsc);
        let mut desc = visible_tasks(&all, StatusFilter::All, SortOrder::TitleDesc);
        desc.reverse();

        assert_eq!(ids(&asc), ids(&desc));
    }

    #[test]
    fn test_two_task_scenario() {
        // Created in order: "B" (open), then "A" (done)
        let all = vec![task("b", "B", false, 100), task("a", "A", true, 200)];

        let az = visible_tasks(&all, StatusFilter::All, SortOrder::TitleAsc);
        assert_eq!(ids(&az), vec!["a", "b"]);

        let done = visible_tasks(&all, StatusFilter::Done, SortOrder::Newest);
        assert_eq!(ids(&done), vec!["a"]);
    }

    #[test]
    fn test_counts() {
        let all = vec![
            task("1", "a", false, 1),
            task("2", "b", true, 2),
            task("3", "c", true, 3),
        ];

        let counts = count_tasks(&all);
        assert_eq!(counts.total, 3);
        assert_eq!(counts.open, 1);
        assert_eq!(counts.done, 2);
    }

    #[test]
    fn test_wire_names_round_trip() {
        let json = serde_json::to_string(&SortOrder::TitleAsc).unwrap();
        assert_eq!(json, "\"az\"");
        let back: SortOrder = serde_json::from_str("\"za\"").unwrap();
        assert_eq!(back, SortOrder::TitleDesc);

        let json = serde_json::to_string(&StatusFilter::Open).unwrap();
        assert_eq!(json, "\"open\"");
    }

    #[test]
    fn test_defaults_match_the_product() {
        assert_eq!(StatusFilter::default(), StatusFilter::Open);
        assert_eq!(SortOrder::default(), SortOrder::Newest);
    }
}
