use serde::{Deserialize, Serialize};

/// A repository as returned by the repository listing, identified by `owner/name`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Repository {
    pub full_name: String,
}

impl Repository {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
        }
    }

    /// Split the identifier into `(owner, name)`; `None` when there is no separator.
    pub fn owner_and_name(&self) -> Option<(&str, &str)> {
        self.full_name.split_once('/')
    }
}

/// Result of asking the provider who the credential belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    User(String),
    /// The provider rejected the credential (401).
    Unauthorized,
    /// No answer: transport failure, server error, or rate limited.
    Unavailable,
}

/// Terminal outcome of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum Conclusion {
    Success,
    Failure,
    Other(String),
}

impl Conclusion {
    pub fn as_str(&self) -> &str {
        match self {
            Conclusion::Success => "success",
            Conclusion::Failure => "failure",
            Conclusion::Other(other) => other,
        }
    }

    /// Only successes and failures are worth a notification.
    pub fn is_notifiable(&self) -> bool {
        matches!(self, Conclusion::Success | Conclusion::Failure)
    }
}

impl From<String> for Conclusion {
    fn from(value: String) -> Self {
        match value.as_str() {
            "success" => Conclusion::Success,
            "failure" => Conclusion::Failure,
            _ => Conclusion::Other(value),
        }
    }
}

impl From<Conclusion> for String {
    fn from(value: Conclusion) -> Self {
        value.as_str().to_string()
    }
}

/// One completed workflow run. `id` is only unique within its repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowRun {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub head_branch: Option<String>,
    #[serde(default)]
    pub conclusion: Option<Conclusion>,
    #[serde(default)]
    pub html_url: Option<String>,
}

impl WorkflowRun {
    pub fn is_notifiable(&self) -> bool {
        self.conclusion.as_ref().is_some_and(Conclusion::is_notifiable)
    }
}

/// Everything a sink needs to render a single run notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunNotice {
    pub repo: String,
    pub workflow: String,
    pub branch: String,
    pub conclusion: Conclusion,
    pub url: String,
}

impl RunNotice {
    pub fn from_run(repo: &str, run: &WorkflowRun) -> Self {
        Self {
            repo: repo.to_string(),
            workflow: run.name.clone().unwrap_or_else(|| "Unknown".into()),
            branch: run.head_branch.clone().unwrap_or_else(|| "?".into()),
            conclusion: run
                .conclusion
                .clone()
                .unwrap_or_else(|| Conclusion::Other(String::new())),
            url: run.html_url.clone().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_deserializes_with_unknown_conclusion() {
        let run: WorkflowRun = serde_json::from_value(json!({
            "id": 42,
            "name": "CI",
            "head_branch": "main",
            "conclusion": "cancelled",
            "html_url": "https://github.com/a/b/actions/runs/42",
            "status": "completed"
        }))
        .unwrap();
        assert_eq!(run.id, 42);
        assert_eq!(run.conclusion, Some(Conclusion::Other("cancelled".into())));
        assert!(!run.is_notifiable());
    }

    #[test]
    fn run_tolerates_missing_fields() {
        let run: WorkflowRun =
            serde_json::from_value(json!({ "id": 7, "conclusion": null })).unwrap();
        assert!(run.conclusion.is_none());
        assert!(!run.is_notifiable());

        let notice = RunNotice::from_run("a/b", &run);
        assert_eq!(notice.workflow, "Unknown");
        assert_eq!(notice.branch, "?");
        assert_eq!(notice.url, "");
    }

    #[test]
    fn success_and_failure_are_notifiable() {
        assert!(Conclusion::from("success".to_string()).is_notifiable());
        assert!(Conclusion::from("failure".to_string()).is_notifiable());
        assert!(!Conclusion::from("skipped".to_string()).is_notifiable());
        assert!(!Conclusion::from("neutral".to_string()).is_notifiable());
    }

    #[test]
    fn owner_and_name_requires_separator() {
        assert_eq!(Repository::new("a/b").owner_and_name(), Some(("a", "b")));
        assert_eq!(Repository::new("bare").owner_and_name(), None);
    }
}
