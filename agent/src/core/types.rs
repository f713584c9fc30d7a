//! Coordinator-side records the agent reads, plus the normalized `RunEvent`.
//!
//! These types are plain data: the coordinator client decodes into them and the
//! rest of the crate only ever reads them.

use serde::{Deserialize, Serialize};

/// Run status that dispatches a plan.
pub const STATUS_PLAN_QUEUED: &str = "plan_queued";
/// Run status that dispatches an apply.
pub const STATUS_APPLY_QUEUED: &str = "apply_queued";

/// A run as reported by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub status: String,
    pub workspace_id: String,
    pub configuration_version_id: String,
    pub plan_id: String,
    pub apply_id: String,
    #[serde(default)]
    pub is_destroy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub locked: bool,
    /// Path of the root module relative to the configuration archive root.
    #[serde(default)]
    pub working_directory: String,
    #[serde(default)]
    pub tool_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationVersion {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableCategory {
    Env,
    Terraform,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub key: String,
    /// `None` when the coordinator withholds a sensitive value.
    #[serde(default)]
    pub value: Option<String>,
    pub category: VariableCategory,
    #[serde(default)]
    pub hcl: bool,
    #[serde(default)]
    pub sensitive: bool,
}

/// A pending run discovered by a listener.
///
/// Broker producers have historically sent both camelCase and PascalCase keys,
/// so both are accepted on input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    #[serde(alias = "OrganizationId")]
    pub organization_id: String,
    #[serde(alias = "RunId")]
    pub run_id: String,
    #[serde(alias = "WorkspaceId")]
    pub workspace_id: String,
}

impl RunEvent {
    pub fn from_run(organization_id: &str, run: &Run) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            run_id: run.id.clone(),
            workspace_id: run.workspace_id.clone(),
        }
    }
}

/// Status report forwarded from an executing job to the coordinator.
///
/// Zero counts are omitted on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatusUpdate {
    pub status: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub add: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub change: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub destroy: u32,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_event_accepts_both_key_casings() {
        let camel: RunEvent = serde_json::from_str(
            r#"{"organizationId":"org-1","runId":"run-1","workspaceId":"ws-1"}"#,
        )
        .expect("camel");
        let pascal: RunEvent = serde_json::from_str(
            r#"{"OrganizationId":"org-1","RunId":"run-1","WorkspaceId":"ws-1"}"#,
        )
        .expect("pascal");
        assert_eq!(camel, pascal);
        assert_eq!(camel.run_id, "run-1");
    }

    #[test]
    fn run_event_rejects_missing_run_id() {
        let result: Result<RunEvent, _> =
            serde_json::from_str(r#"{"organizationId":"org-1","workspaceId":"ws-1"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn status_update_omits_zero_counts() {
        let update = RunStatusUpdate {
            status: "planned".to_string(),
            add: 2,
            ..RunStatusUpdate::default()
        };
        let json = serde_json::to_value(&update).expect("serialize");
        assert_eq!(json, serde_json::json!({"status": "planned", "add": 2}));
    }

    #[test]
    fn unknown_variable_category_maps_to_other() {
        let var: Variable =
            serde_json::from_str(r#"{"key":"k","value":"v","category":"policy-set"}"#)
                .expect("variable");
        assert_eq!(var.category, VariableCategory::Other);
        assert!(!var.hcl);
    }
}
