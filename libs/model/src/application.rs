//! Applications and instance-tree navigation.

use std::sync::Arc;

use convoy_id::InstancePath;

use crate::component::{Component, Graphs};
use crate::error::ModelError;
use crate::instance::{Instance, InstanceStatus};

/// An application: a component graph plus the instance trees built on it.
///
/// `(name, qualifier)` identifies an application; managers index them by name.
#[derive(Debug, Clone)]
pub struct Application {
    pub name: String,
    pub qualifier: String,
    pub graphs: Arc<Graphs>,
    pub root_instances: Vec<Instance>,
}

impl Application {
    pub fn new(name: impl Into<String>, qualifier: impl Into<String>, graphs: Arc<Graphs>) -> Self {
        Self {
            name: name.into(),
            qualifier: qualifier.into(),
            graphs,
            root_instances: Vec::new(),
        }
    }

    pub fn component_of(&self, instance: &Instance) -> Option<&Component> {
        self.graphs.component(&instance.component)
    }

    pub fn find(&self, path: &InstancePath) -> Option<&Instance> {
        let mut segments = path.segments();
        let root = segments.next()?;
        let mut current = self.root_instances.iter().find(|i| i.name == root)?;
        for name in segments {
            current = current.child(name)?;
        }
        Some(current)
    }

    pub fn find_mut(&mut self, path: &InstancePath) -> Option<&mut Instance> {
        let mut segments = path.segments();
        let root = segments.next()?;
        let mut current = self.root_instances.iter_mut().find(|i| i.name == root)?;
        for name in segments {
            current = current.child_mut(name)?;
        }
        Some(current)
    }

    pub fn status_of(&self, path: &InstancePath) -> Option<InstanceStatus> {
        self.find(path).map(|i| i.status)
    }

    /// The root ancestor of `path`, i.e. the instance owning the machine.
    pub fn scoped_instance(&self, path: &InstancePath) -> Option<&Instance> {
        self.find(&path.scope())
    }

    /// Paths of all root instances.
    pub fn scoped_paths(&self) -> Vec<InstancePath> {
        self.root_instances
            .iter()
            .filter_map(|i| InstancePath::root(&i.name).ok())
            .collect()
    }

    /// Paths of `from` and its descendants (or the whole tree), parents first.
    pub fn paths_preorder(&self, from: Option<&InstancePath>) -> Vec<InstancePath> {
        let mut out = Vec::new();
        match from {
            Some(path) => {
                if let Some(instance) = self.find(path) {
                    collect_preorder(instance, path.clone(), &mut out);
                }
            }
            None => {
                for root in &self.root_instances {
                    if let Ok(path) = InstancePath::root(&root.name) {
                        collect_preorder(root, path, &mut out);
                    }
                }
            }
        }
        out
    }

    /// Paths of `from` and its descendants (or the whole tree), children first.
    pub fn paths_postorder(&self, from: Option<&InstancePath>) -> Vec<InstancePath> {
        let mut out = Vec::new();
        match from {
            Some(path) => {
                if let Some(instance) = self.find(path) {
                    collect_postorder(instance, path.clone(), &mut out);
                }
            }
            None => {
                for root in &self.root_instances {
                    if let Ok(path) = InstancePath::root(&root.name) {
                        collect_postorder(root, path, &mut out);
                    }
                }
            }
        }
        out
    }

    /// Inserts `instance` (and its subtree) under `parent`, or as a root.
    ///
    /// Components must be compatible with the graph all the way down and
    /// names unique among siblings. Inserted instances start NOT_DEPLOYED.
    pub fn insert(
        &mut self,
        parent: Option<&InstancePath>,
        mut instance: Instance,
    ) -> Result<InstancePath, ModelError> {
        let path = match parent {
            Some(parent_path) => parent_path.child(&instance.name)?,
            None => InstancePath::root(&instance.name)?,
        };

        match parent {
            None => {
                if !self.graphs.is_root(&instance.component) {
                    return Err(ModelError::NotARoot {
                        component: instance.component,
                    });
                }
            }
            Some(parent_path) => {
                let parent_instance = self
                    .find(parent_path)
                    .ok_or_else(|| ModelError::InstanceNotFound(parent_path.clone()))?;
                if !self
                    .graphs
                    .can_host(&parent_instance.component, &instance.component)
                {
                    return Err(ModelError::NotAChild {
                        parent_component: parent_instance.component.clone(),
                        component: instance.component,
                    });
                }
            }
        }
        self.check_subtree(&instance)?;

        let siblings = match parent {
            Some(parent_path) => &self
                .find(parent_path)
                .ok_or_else(|| ModelError::InstanceNotFound(parent_path.clone()))?
                .children,
            None => &self.root_instances,
        };
        if siblings.iter().any(|s| s.name == instance.name) {
            return Err(ModelError::DuplicateName {
                parent: parent.map_or_else(|| "/".to_owned(), |p| p.to_string()),
                name: instance.name,
            });
        }

        instance.reset_status(InstanceStatus::NotDeployed);
        match parent {
            Some(parent_path) => self
                .find_mut(parent_path)
                .ok_or_else(|| ModelError::InstanceNotFound(parent_path.clone()))?
                .children
                .push(instance),
            None => self.root_instances.push(instance),
        }

        Ok(path)
    }

    /// Validates the descendants of an instance about to be inserted.
    fn check_subtree(&self, instance: &Instance) -> Result<(), ModelError> {
        if self.graphs.component(&instance.component).is_none() {
            return Err(ModelError::UnknownComponent(instance.component.clone()));
        }

        let mut names = std::collections::BTreeSet::new();
        for child in &instance.children {
            if !self.graphs.can_host(&instance.component, &child.component) {
                return Err(ModelError::NotAChild {
                    parent_component: instance.component.clone(),
                    component: child.component.clone(),
                });
            }
            if !names.insert(child.name.as_str()) {
                return Err(ModelError::DuplicateName {
                    parent: instance.name.clone(),
                    name: child.name.clone(),
                });
            }
            self.check_subtree(child)?;
        }
        Ok(())
    }

    /// Removes the subtree rooted at `path`.
    ///
    /// Fails without touching the tree unless every instance of the subtree
    /// is NOT_DEPLOYED.
    pub fn remove(&mut self, path: &InstancePath) -> Result<Instance, ModelError> {
        let instance = self
            .find(path)
            .ok_or_else(|| ModelError::InstanceNotFound(path.clone()))?;

        if !instance.all(&|i| i.status == InstanceStatus::NotDeployed) {
            return Err(ModelError::StillDeployed(path.clone()));
        }

        let siblings = match path.parent() {
            Some(parent) => {
                &mut self
                    .find_mut(&parent)
                    .ok_or_else(|| ModelError::InstanceNotFound(parent.clone()))?
                    .children
            }
            None => &mut self.root_instances,
        };

        let idx = siblings
            .iter()
            .position(|i| i.name == path.name())
            .ok_or_else(|| ModelError::InstanceNotFound(path.clone()))?;
        Ok(siblings.remove(idx))
    }

    /// Paths of instances whose component imports variables from `component`.
    pub fn importers_of(&self, component: &str) -> Vec<InstancePath> {
        self.paths_preorder(None)
            .into_iter()
            .filter(|path| {
                self.find(path)
                    .and_then(|i| self.component_of(i))
                    .is_some_and(|c| c.import_prefixes().contains(component))
            })
            .collect()
    }
}

fn collect_preorder(instance: &Instance, path: InstancePath, out: &mut Vec<InstancePath>) {
    out.push(path.clone());
    for child in &instance.children {
        if let Ok(child_path) = path.child(&child.name) {
            collect_preorder(child, child_path, out);
        }
    }
}

fn collect_postorder(instance: &Instance, path: InstancePath, out: &mut Vec<InstancePath>) {
    for child in &instance.children {
        if let Ok(child_path) = path.child(&child.name) {
            collect_postorder(child, child_path, out);
        }
    }
    out.push(path);
}
