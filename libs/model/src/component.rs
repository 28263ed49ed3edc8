//! Components and component graphs.

use std::collections::{BTreeMap, BTreeSet};

/// Installer tag of components backed by a machine from a target handler.
pub const INSTALLER_TARGET: &str = "target";

/// A deployable component type.
///
/// Variable names are prefixed with the name of the component that owns
/// them: a Tomcat importing `MySQL.port` depends on some MySQL instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub name: String,
    pub installer: String,
    /// Exported variables with their default value, if any.
    pub exports: BTreeMap<String, Option<String>>,
    /// Imported variables and whether each one is optional.
    pub imports: BTreeMap<String, bool>,
    /// Names of the components allowed as children.
    pub children: Vec<String>,
}

impl Component {
    pub fn new(name: impl Into<String>, installer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            installer: installer.into(),
            exports: BTreeMap::new(),
            imports: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn export(mut self, name: impl Into<String>, default: Option<&str>) -> Self {
        self.exports.insert(name.into(), default.map(str::to_owned));
        self
    }

    pub fn import(mut self, name: impl Into<String>, optional: bool) -> Self {
        self.imports.insert(name.into(), optional);
        self
    }

    pub fn child(mut self, component: impl Into<String>) -> Self {
        self.children.push(component.into());
        self
    }

    pub fn is_target(&self) -> bool {
        self.installer == INSTALLER_TARGET
    }

    /// Names of the components this one imports variables from.
    pub fn import_prefixes(&self) -> BTreeSet<&str> {
        self.imports
            .keys()
            .filter_map(|name| name.split_once('.').map(|(prefix, _)| prefix))
            .collect()
    }
}

/// The validated component graph of an application.
///
/// Cycle detection and DSL parsing happen before a graph reaches the DM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Graphs {
    components: BTreeMap<String, Component>,
    roots: BTreeSet<String>,
}

impl Graphs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_component(mut self, component: Component) -> Self {
        self.components.insert(component.name.clone(), component);
        self
    }

    /// Marks a component as allowed at the root of instance trees.
    pub fn with_root(mut self, name: impl Into<String>) -> Self {
        self.roots.insert(name.into());
        self
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.get(name)
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    pub fn is_root(&self, name: &str) -> bool {
        self.roots.contains(name) && self.components.contains_key(name)
    }

    /// True if an instance of `child` may be inserted under an instance of `parent`.
    pub fn can_host(&self, parent: &str, child: &str) -> bool {
        self.components.contains_key(child)
            && self
                .components
                .get(parent)
                .is_some_and(|c| c.children.iter().any(|name| name == child))
    }
}
