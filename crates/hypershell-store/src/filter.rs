use crate::task::TaskState;

/// Read-only projection filter for the reporting CLI (`task search`, spec
/// section 6).
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub host: Option<String>,
    pub args_contains: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, task: &crate::task::Task) -> bool {
        if let Some(state) = self.state {
            if task.state != state {
                return false;
            }
        }
        if let Some(host) = &self.host {
            if task.host.as_deref() != Some(host.as_str()) {
                return false;
            }
        }
        if let Some(needle) = &self.args_contains {
            if !task.args.contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    SubmitTimeAsc,
    SubmitTimeDesc,
    IdAsc,
}
