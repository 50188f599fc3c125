use super::TaskStatus;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

/// Query parameters for listing scheduler tasks with filtering and pagination.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub status: Option<TaskStatus>,
    pub tag: Option<String>,
    pub name: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

/// Result of a paginated task query.
#[derive(Debug, Clone)]
pub struct TaskPage<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl TaskQuery {
    pub fn new() -> Self {
        Self {
            status: None,
            tag: None,
            name: None,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.min(MAX_LIMIT);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_capped() {
        let q = TaskQuery::new().with_limit(50_000);
        assert_eq!(q.limit, MAX_LIMIT);
    }

    #[test]
    fn new_uses_default_limit() {
        let q = TaskQuery::new();
        assert_eq!(q.limit, DEFAULT_LIMIT);
        assert_eq!(q.offset, 0);
        assert!(q.status.is_none() && q.tag.is_none() && q.name.is_none());
    }
}
