// ABOUTME: Data structures returned by the target repository service API
// ABOUTME: Deserialized from the service's JSON responses

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetUser {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetProject {
    pub id: u64,
    #[serde(rename = "http_url_to_repo")]
    pub http_url: String,
    pub web_url: String,
    #[serde(default)]
    pub path_with_namespace: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
}

/// Error body the service sends with non-success statuses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub message: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ApiErrorBody {
    pub fn describe(&self) -> Option<String> {
        match (&self.message, &self.error) {
            (Some(serde_json::Value::String(msg)), _) => Some(msg.clone()),
            (Some(other), _) => Some(other.to_string()),
            (None, Some(err)) => Some(err.clone()),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_field_names() {
        let project: TargetProject = serde_json::from_str(
            r#"{"id": 7, "http_url_to_repo": "https://git.example.com/g/p.git",
                "web_url": "https://git.example.com/g/p", "path_with_namespace": "g/p"}"#,
        )
        .unwrap();
        assert_eq!(project.http_url, "https://git.example.com/g/p.git");
        assert!(project.default_branch.is_none());
    }

    #[test]
    fn test_error_body_variants() {
        let body: ApiErrorBody = serde_json::from_str(r#"{"message": "404 Project Not Found"}"#).unwrap();
        assert_eq!(body.describe().as_deref(), Some("404 Project Not Found"));
        let body: ApiErrorBody = serde_json::from_str(r#"{"error": "invalid_token"}"#).unwrap();
        assert_eq!(body.describe().as_deref(), Some("invalid_token"));
    }
}
