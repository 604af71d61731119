//! 后台任务（数据源加载等）的生命周期
//!
//! created → running → {completed | failed}；终态之后不允许任何转换。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: JobStatus,
    /// 进度与结果字段（如 num_passages / num_documents / error）
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            status: JobStatus::Created,
            metadata: Map::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn start(&mut self) -> Result<(), AgentError> {
        self.transition(JobStatus::Running)
    }

    pub fn complete(&mut self, metadata: Map<String, Value>) -> Result<(), AgentError> {
        self.transition(JobStatus::Completed)?;
        self.metadata.extend(metadata);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), AgentError> {
        self.transition(JobStatus::Failed)?;
        self.metadata
            .insert("error".to_string(), Value::String(error.into()));
        Ok(())
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), AgentError> {
        let allowed = matches!(
            (self.status, to),
            (JobStatus::Created, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        );
        if !allowed {
            return Err(AgentError::Validation(format!(
                "job {}: illegal transition {:?} -> {:?}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_happy_path() {
        let mut job = Job::new(Uuid::new_v4());
        job.start().unwrap();
        let mut meta = Map::new();
        meta.insert("num_passages".into(), json!(4));
        job.complete(meta).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.metadata["num_passages"], json!(4));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut job = Job::new(Uuid::new_v4());
        job.start().unwrap();
        job.fail("embedding backend down").unwrap();
        assert!(job.start().is_err());
        assert!(job.complete(Map::new()).is_err());
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn test_cannot_skip_running() {
        let mut job = Job::new(Uuid::new_v4());
        assert!(job.complete(Map::new()).is_err());
        assert_eq!(job.status, JobStatus::Created);
    }
}
