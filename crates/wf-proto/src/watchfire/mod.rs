tonic::include_proto!("watchfire");

impl AgentIssue {
    /// The daemon sends an issue with an empty type when a previous issue
    /// has been resolved.
    pub fn is_cleared(&self) -> bool {
        self.issue_type.trim().is_empty()
    }

    pub fn into_active(self) -> Option<AgentIssue> {
        if self.is_cleared() {
            None
        } else {
            Some(self)
        }
    }
}

impl ProjectId {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
        }
    }
}
