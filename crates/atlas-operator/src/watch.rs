//! Dependent-watch router
//!
//! Maps a changed object (a credentials secret, a parent group) to reconcile
//! requests for every object of a dependent kind that references it, using the
//! keys kept by the [`ReferenceIndex`].

use crate::indexer::{ReferenceIndex, Referrer, TargetKind};
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Routes changes of referenced objects to their dependents
#[derive(Clone)]
pub struct DependentWatchRouter {
    index: Arc<ReferenceIndex>,
}

impl DependentWatchRouter {
    pub fn new(index: Arc<ReferenceIndex>) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &Arc<ReferenceIndex> {
        &self.index
    }

    /// Object keys of kind `D` referencing `namespace/name` of kind `target`.
    ///
    /// Several fields of `D` may point at the same target; each matching
    /// dependent is returned once.
    pub fn dependents<D: Referrer>(
        &self,
        target: &TargetKind,
        namespace: &str,
        name: &str,
    ) -> BTreeSet<String> {
        let key = format!("{}/{}", namespace, name);
        D::reference_fields()
            .iter()
            .filter(|field| field.target == *target)
            .flat_map(|field| self.index.lookup(field.index, &key))
            .collect()
    }

    /// Reconcile requests of kind `D` for a changed object of kind `target`
    pub fn requests_for<D: Referrer>(
        &self,
        target: &TargetKind,
        namespace: &str,
        name: &str,
    ) -> Vec<ObjectRef<D>> {
        let requests: Vec<ObjectRef<D>> = self
            .dependents::<D>(target, namespace, name)
            .iter()
            .filter_map(|object| object_ref(object))
            .collect();

        if !requests.is_empty() {
            debug!(
                target = target.kind,
                dependent = %D::kind(&()),
                namespace,
                name,
                count = requests.len(),
                "Routing change to dependents"
            );
        }
        requests
    }

    /// Watch mapper for `Controller::watches`
    pub fn mapper<D, T>(&self, target: TargetKind) -> impl Fn(T) -> Vec<ObjectRef<D>> + Send + Sync + 'static
    where
        D: Referrer + 'static,
        T: Resource + 'static,
    {
        let router = self.clone();
        move |changed: T| {
            let namespace = changed.namespace().unwrap_or_default();
            router.requests_for::<D>(&target, &namespace, &changed.name_any())
        }
    }
}

/// Distinct kinds referenced by `D`, one watch each
pub fn referenced_kinds<D: Referrer>() -> BTreeSet<TargetKind> {
    D::reference_fields().iter().map(|f| f.target).collect()
}

fn object_ref<D: Referrer>(object: &str) -> Option<ObjectRef<D>> {
    let (namespace, name) = object.split_once('/')?;
    let obj_ref = ObjectRef::new(name);
    Some(if namespace.is_empty() {
        obj_ref
    } else {
        obj_ref.within(namespace)
    })
}
