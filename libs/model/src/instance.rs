//! Instances and their lifecycle status.

use std::collections::BTreeMap;

use convoy_id::InstancePath;
use serde::{Deserialize, Serialize};

use crate::component::Component;

/// Data bag key holding the machine ID of a scoped instance.
pub const DATA_MACHINE_ID: &str = "machine.id";

/// Data bag key holding the IP address reported for a scoped instance.
pub const DATA_IP_ADDRESS: &str = "ip.address";

/// Lifecycle status of an instance.
///
/// ```text
/// NOT_DEPLOYED -> DEPLOYING -> DEPLOYED_STOPPED -> STARTING -> DEPLOYED_STARTED
///      ^                            ^    |                          |
///      +------ UNDEPLOYING <--------+    +<------- STOPPING <-------+
///
/// PROBLEM is reachable from any state.
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    NotDeployed,
    Deploying,
    DeployedStopped,
    Starting,
    DeployedStarted,
    Stopping,
    Undeploying,
    Problem,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 8] = [
        Self::NotDeployed,
        Self::Deploying,
        Self::DeployedStopped,
        Self::Starting,
        Self::DeployedStarted,
        Self::Stopping,
        Self::Undeploying,
        Self::Problem,
    ];

    /// NOT_DEPLOYED and DEPLOYED_STARTED.
    pub fn is_stable(&self) -> bool {
        matches!(self, Self::NotDeployed | Self::DeployedStarted)
    }

    /// A transition is in flight.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Deploying | Self::Starting | Self::Stopping | Self::Undeploying
        )
    }

    /// Statuses a caller may request explicitly.
    pub fn is_requestable(&self) -> bool {
        matches!(
            self,
            Self::NotDeployed | Self::DeployedStopped | Self::DeployedStarted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotDeployed => "NOT_DEPLOYED",
            Self::Deploying => "DEPLOYING",
            Self::DeployedStopped => "DEPLOYED_STOPPED",
            Self::Starting => "STARTING",
            Self::DeployedStarted => "DEPLOYED_STARTED",
            Self::Stopping => "STOPPING",
            Self::Undeploying => "UNDEPLOYING",
            Self::Problem => "PROBLEM",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown instance status: {s}"))
    }
}

/// Variables resolved from an exporting instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    pub instance_path: InstancePath,
    pub component: String,
    pub variables: BTreeMap<String, String>,
}

/// A node of an application's instance tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub component: String,
    pub status: InstanceStatus,

    /// Instance-level values overriding the component's export defaults.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overridden_exports: BTreeMap<String, String>,

    /// Out-of-band markers (machine ID, IP address...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,

    /// Resolved imports, keyed by exporting component name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub imports: BTreeMap<String, Vec<Import>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Instance>,
}

impl Instance {
    pub fn new(name: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            component: component.into(),
            status: InstanceStatus::NotDeployed,
            overridden_exports: BTreeMap::new(),
            data: BTreeMap::new(),
            imports: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: Instance) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_export(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.overridden_exports.insert(name.into(), value.into());
        self
    }

    pub fn machine_id(&self) -> Option<&str> {
        self.data.get(DATA_MACHINE_ID).map(String::as_str)
    }

    pub fn child(&self, name: &str) -> Option<&Instance> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Instance> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// True if this instance and every descendant satisfy `predicate`.
    pub fn all(&self, predicate: &impl Fn(&Instance) -> bool) -> bool {
        predicate(self) && self.children.iter().all(|c| c.all(predicate))
    }

    /// Visits this instance and its descendants, parents first.
    pub fn for_each_mut(&mut self, f: &mut impl FnMut(&mut Instance)) {
        f(self);
        for child in &mut self.children {
            child.for_each_mut(f);
        }
    }

    /// Resets statuses of the whole subtree.
    pub fn reset_status(&mut self, status: InstanceStatus) {
        self.for_each_mut(&mut |i| i.status = status);
    }

    /// Values this instance exports, given its component.
    ///
    /// Overrides win over component defaults. `*.ip` variables without a
    /// value fall back to the IP address reported for the instance.
    pub fn exported_variables(&self, component: &Component) -> BTreeMap<String, String> {
        let mut result = BTreeMap::new();
        for (name, default) in &component.exports {
            let value = self
                .overridden_exports
                .get(name)
                .cloned()
                .or_else(|| default.clone())
                .or_else(|| {
                    name.ends_with(".ip")
                        .then(|| self.data.get(DATA_IP_ADDRESS).cloned())
                        .flatten()
                });

            if let Some(value) = value {
                result.insert(name.clone(), value);
            }
        }
        result
    }

    /// True if every non-optional import of `component` is resolved.
    pub fn imports_satisfied(&self, component: &Component) -> bool {
        component
            .imports
            .iter()
            .filter(|(_, optional)| !**optional)
            .all(|(name, _)| {
                name.split_once('.')
                    .and_then(|(prefix, _)| self.imports.get(prefix))
                    .is_some_and(|imports| imports.iter().any(|i| i.variables.contains_key(name)))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(InstanceStatus::NotDeployed, true, false)]
    #[case(InstanceStatus::DeployedStarted, true, false)]
    #[case(InstanceStatus::DeployedStopped, false, false)]
    #[case(InstanceStatus::Deploying, false, true)]
    #[case(InstanceStatus::Undeploying, false, true)]
    #[case(InstanceStatus::Problem, false, false)]
    fn test_status_classes(
        #[case] status: InstanceStatus,
        #[case] stable: bool,
        #[case] transient: bool,
    ) {
        assert_eq!(status.is_stable(), stable);
        assert_eq!(status.is_transient(), transient);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&InstanceStatus::DeployedStarted).unwrap();
        assert_eq!(json, "\"DEPLOYED_STARTED\"");
        assert_eq!(
            "deployed_stopped".parse::<InstanceStatus>().unwrap(),
            InstanceStatus::DeployedStopped
        );
        assert!("RUNNING".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn test_exported_variables() {
        let component = Component::new("Tomcat", "puppet")
            .export("Tomcat.ip", None)
            .export("Tomcat.portAJP", Some("8009"))
            .export("Tomcat.portHTTP", Some("8080"));

        let mut instance = Instance::new("tomcat", "Tomcat").with_export("Tomcat.portHTTP", "9090");
        instance
            .data
            .insert(DATA_IP_ADDRESS.to_string(), "10.0.0.3".to_string());

        let exports = instance.exported_variables(&component);
        assert_eq!(exports["Tomcat.ip"], "10.0.0.3");
        assert_eq!(exports["Tomcat.portAJP"], "8009");
        assert_eq!(exports["Tomcat.portHTTP"], "9090");
    }

    #[test]
    fn test_imports_satisfied() {
        let component = Component::new("Tomcat", "puppet")
            .import("MySQL.ip", false)
            .import("Cache.host", true);
        let mut instance = Instance::new("tomcat", "Tomcat");
        assert!(!instance.imports_satisfied(&component));

        instance.imports.insert(
            "MySQL".to_string(),
            vec![Import {
                instance_path: InstancePath::parse("/vm2/mysql").unwrap(),
                component: "MySQL".to_string(),
                variables: BTreeMap::from([("MySQL.ip".to_string(), "10.0.0.4".to_string())]),
            }],
        );
        assert!(instance.imports_satisfied(&component));
    }

    #[test]
    fn test_instance_json_omits_empty_maps() {
        let instance = Instance::new("vm1", "VM");
        let json = serde_json::to_value(&instance).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"name": "vm1", "component": "VM", "status": "NOT_DEPLOYED"})
        );
    }
}
