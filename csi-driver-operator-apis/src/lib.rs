use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use kube::CustomResource;

use schemars::{
    JsonSchema,
    r#gen::SchemaGenerator,
    schema::{Schema, SchemaObject},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const API_GROUP: &'static str = "operator.openshift.io";

pub const API_VERSION: &'static str = "v1";

pub const KIND: &'static str = "ClusterCSIDriver";

/// Status value of a condition which holds.
pub const CONDITION_TRUE: &'static str = "True";
/// Status value of a condition which does not hold.
pub const CONDITION_FALSE: &'static str = "False";
pub const CONDITION_UNKNOWN: &'static str = "Unknown";

/// Whether and how the operator manages its operand.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema, Default)]
pub enum ManagementState {
    /// The operator reconciles the operand.
    #[default]
    Managed,
    /// The operator leaves the operand alone.
    Unmanaged,
    /// The operator is asked to remove the operand.
    Removed,
    /// Like `Managed`, but overriding safety checks.
    Force,
}

/// Log verbosity of the operator and its operand.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema, Default)]
pub enum LogLevel {
    #[default]
    Normal,
    Debug,
    Trace,
    TraceAll,
}

impl LogLevel {
    /// The numeric `--v` verbosity passed to the driver containers.
    pub fn verbosity(&self) -> u8 {
        match self {
            LogLevel::Normal => 2,
            LogLevel::Debug => 4,
            LogLevel::Trace => 6,
            LogLevel::TraceAll => 8,
        }
    }
}

/// Whether the operator manages the default storage classes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema, Default)]
pub enum StorageClassState {
    #[default]
    Managed,
    Unmanaged,
    Removed,
}

/// Configuration observed from the cluster by the operator itself.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema, Default)]
pub struct ObservedConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub targetcsiconfig: Option<TargetCsiConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema, Default)]
pub struct TargetCsiConfig {
    /// Proxy environment (`HTTP_PROXY`, `HTTPS_PROXY`, `NO_PROXY`) for the driver containers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<BTreeMap<String, String>>,
}

/// Driver specific configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema, Default)]
pub struct CsiDriverConfig {
    #[serde(rename = "driverType", skip_serializing_if = "Option::is_none")]
    pub driver_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ibmcloud: Option<IbmCloudCsiDriverConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema, Default)]
pub struct IbmCloudCsiDriverConfig {
    /// CRN of the key protect root key used to encrypt volumes of the default storage classes.
    #[serde(rename = "encryptionKeyCRN", skip_serializing_if = "Option::is_none")]
    pub encryption_key_crn: Option<String>,
}

/// Desired state of the CSI driver operand.
///
/// All fields are optional, so the same type can hold the subset of fields
/// owned by a single field manager.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "operator.openshift.io",
    version = "v1",
    kind = "ClusterCSIDriver",
    derive = "PartialEq",
    status = "OperatorStatus",
    printcolumn = r#"{
        "name":"Management",
        "type": "string",
        "jsonPath": ".spec.managementState",
        "description": "Whether the operator manages the CSI driver."
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub management_state: Option<ManagementState>,
    /// Log level of the driver containers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,
    /// Log level of the operator itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator_log_level: Option<LogLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_config: Option<ObservedConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_config: Option<CsiDriverConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class_state: Option<StorageClassState>,
}

impl OperatorSpec {
    pub fn management_state(&self) -> ManagementState {
        self.management_state.unwrap_or_default()
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level.unwrap_or_default()
    }

    pub fn operator_log_level(&self) -> LogLevel {
        self.operator_log_level.unwrap_or_default()
    }

    pub fn storage_class_state(&self) -> StorageClassState {
        self.storage_class_state.unwrap_or_default()
    }

    pub fn encryption_key_crn(&self) -> Option<&str> {
        self.driver_config
            .as_ref()
            .and_then(|c| c.ibmcloud.as_ref())
            .and_then(|c| c.encryption_key_crn.as_deref())
            .filter(|crn| !crn.is_empty())
    }

    /// The observed proxy environment, empty if nothing has been observed (yet).
    pub fn observed_proxy(&self) -> BTreeMap<String, String> {
        self.observed_config
            .as_ref()
            .and_then(|c| c.targetcsiconfig.as_ref())
            .and_then(|c| c.proxy.clone())
            .unwrap_or_default()
    }
}

/// Operator condition, compatible with `operator.openshift.io/v1` `OperatorCondition`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct OperatorCondition {
    /// type of condition in CamelCase, e.g. `StaticResourcesControllerDegraded`.
    #[serde(rename = "type")]
    pub type_: String,

    /// status of the condition, one of True, False, Unknown.
    pub status: String,

    /// lastTransitionTime is the last time the condition transitioned from one status to another.
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// reason contains a programmatic identifier indicating the reason for the condition's last transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// message is a human readable message indicating details about the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OperatorCondition {
    pub fn new(tpe: &str, status: Option<bool>, reason: &str, message: String) -> Self {
        Self {
            type_: tpe.to_string(),
            status: status
                .map(|v| if v { CONDITION_TRUE } else { CONDITION_FALSE })
                .unwrap_or(CONDITION_UNKNOWN)
                .to_string(),
            last_transition_time: None,
            reason: Some(reason.to_string()),
            message: if message.is_empty() {
                None
            } else {
                Some(message)
            },
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == CONDITION_TRUE
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct OperatorStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Conditions are merged by `type`, each controller reports its own condition types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Option<Vec<OperatorCondition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,
}

impl OperatorStatus {
    pub fn condition(&self, tpe: &str) -> Option<&OperatorCondition> {
        self.conditions
            .as_ref()
            .and_then(|conditions| conditions.iter().find(|c| c.type_ == tpe))
    }

    /// Set or replace the condition with the same type, keeping the existing
    /// `lastTransitionTime` as long as the condition status does not change.
    pub fn update_condition(&mut self, mut c: OperatorCondition) {
        let mut conditions: Vec<OperatorCondition> = self.conditions.take().unwrap_or_default();
        if let Some(existing) = conditions.iter_mut().find(|e| e.type_ == c.type_) {
            if existing.status == c.status {
                c.last_transition_time = existing.last_transition_time.clone();
            } else if c.last_transition_time.is_none() {
                c.last_transition_time = Some(now());
            }
            *existing = c;
        } else {
            if c.last_transition_time.is_none() {
                c.last_transition_time = Some(now());
            }
            conditions.push(c);
        }
        self.conditions = Some(conditions);
    }

    /// Copy every field set in `patch` onto `self`, leaving unset fields untouched.
    pub fn merge(&mut self, patch: OperatorStatus) {
        if patch.observed_generation.is_some() {
            self.observed_generation = patch.observed_generation;
        }
        if patch.version.is_some() {
            self.version = patch.version;
        }
        if patch.ready_replicas.is_some() {
            self.ready_replicas = patch.ready_replicas;
        }
        for c in patch.conditions.into_iter().flatten() {
            self.update_condition(c);
        }
    }
}

/// Conditions form a map keyed by `type`, so that server-side apply lets
/// every field manager own its own entries.
fn conditions_schema(generator: &mut SchemaGenerator) -> Schema {
    let mut schema: SchemaObject = generator
        .subschema_for::<Vec<OperatorCondition>>()
        .into_object();
    schema
        .extensions
        .insert("x-kubernetes-list-type".to_string(), json!("map"));
    schema
        .extensions
        .insert("x-kubernetes-list-map-keys".to_string(), json!(["type"]));
    Schema::Object(schema)
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl ClusterCSIDriver {
    pub fn status_conditions(&self) -> &[OperatorCondition] {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or(&[])
    }
}
