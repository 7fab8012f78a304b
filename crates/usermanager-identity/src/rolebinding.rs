//! RoleBinding reconciliation
//!
//! Every binding is named after the user, so there is at most one binding per
//! namespace, bound to the first grant listed for it. A grant change is
//! planned as a symmetric difference of those effective bindings: each
//! namespace whose binding changed or vanished is deleted, then each namespace
//! whose binding is new or changed is created. Deletes always run before creates, which also covers a role
//! change inside one namespace since `roleRef` is immutable.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use usermanager_common::crd::RoleGrant;
use usermanager_common::template::ManifestRenderer;

use crate::gateway::ClusterGateway;
use crate::Error;

/// Writes needed to move the cluster from one grant list to another
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BindingPlan {
    /// Namespaces whose binding is deleted, sorted
    pub deletes: Vec<String>,
    /// Grants whose binding is created, in desired order
    pub creates: Vec<RoleGrant>,
}

impl BindingPlan {
    /// Diff `old` against `new`.
    ///
    /// Only the first grant per namespace is bound, so the plan compares the
    /// effective binding of each namespace. Duplicates and the order of
    /// different namespaces do not affect the result.
    pub fn diff(old: &[RoleGrant], new: &[RoleGrant]) -> Self {
        let before = effective_bindings(old);
        let after = effective_bindings(new);

        let deletes = before
            .iter()
            .filter(|(ns, role)| after.get(*ns) != Some(*role))
            .map(|(ns, _)| ns.to_string())
            .collect();

        let mut bound = BTreeSet::new();
        let creates = new
            .iter()
            .filter(|g| bound.insert(g.namespace.as_str()))
            .filter(|g| before.get(g.namespace.as_str()) != Some(&g.name.as_str()))
            .cloned()
            .collect();

        Self { deletes, creates }
    }

    /// True when nothing needs to be written
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.creates.is_empty()
    }
}

/// Namespace to bound ClusterRole, taking the first grant per namespace
pub fn effective_bindings(grants: &[RoleGrant]) -> BTreeMap<&str, &str> {
    let mut bindings = BTreeMap::new();
    for grant in grants {
        bindings
            .entry(grant.namespace.as_str())
            .or_insert(grant.name.as_str());
    }
    bindings
}

/// Drop repeated grants, keeping the first occurrence
pub fn dedup_grants(grants: &[RoleGrant]) -> Vec<RoleGrant> {
    let mut seen = BTreeSet::new();
    grants
        .iter()
        .filter(|g| seen.insert(*g))
        .cloned()
        .collect()
}

/// Bring the user's RoleBindings from `old` to `new`.
///
/// "Already exists" on create and "not found" on delete are success. Any other
/// failure aborts the pass, leaving later writes undone; the caller keeps the
/// previous applied list so the next pass replans from there.
///
/// Returns the applied grant list: `new` without duplicates.
pub async fn reconcile_bindings(
    gateway: &dyn ClusterGateway,
    renderer: &ManifestRenderer,
    user: &str,
    sa_namespace: &str,
    old: &[RoleGrant],
    new: &[RoleGrant],
) -> Result<Vec<RoleGrant>, Error> {
    let plan = BindingPlan::diff(old, new);
    if plan.is_empty() {
        debug!(user, "role bindings already match grants");
        return Ok(dedup_grants(new));
    }

    for namespace in &plan.deletes {
        match gateway.delete_role_binding(user, namespace).await {
            Ok(()) => info!(user, namespace = %namespace, "deleted role binding"),
            Err(e) if e.is_not_found() => {
                debug!(user, namespace = %namespace, "role binding already gone")
            }
            Err(e) => return Err(e),
        }
    }

    for grant in &plan.creates {
        let binding =
            renderer.role_binding(user, &grant.namespace, &grant.name, user, sa_namespace)?;
        match gateway.create_role_binding(&grant.namespace, &binding).await {
            Ok(()) => info!(user, role = %grant.name, namespace = %grant.namespace, "created role binding"),
            Err(e) if e.is_already_exists() => {
                debug!(user, namespace = %grant.namespace, "role binding already exists")
            }
            Err(e) => return Err(e),
        }
    }

    Ok(dedup_grants(new))
}

/// Delete the user's binding in every namespace, for deletion cleanup.
///
/// Never fails: "not found" is ignored and other errors are logged.
/// Returns how many deletes failed.
pub async fn remove_bindings(
    gateway: &dyn ClusterGateway,
    user: &str,
    namespaces: &[String],
) -> usize {
    let mut failures = 0;
    for namespace in namespaces {
        match gateway.delete_role_binding(user, namespace).await {
            Ok(()) => info!(user, namespace = %namespace, "deleted role binding"),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                failures += 1;
                warn!(user, namespace = %namespace, error = %e, "failed to delete role binding");
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockClusterGateway;
    use mockall::Sequence;

    fn grant(role: &str, ns: &str) -> RoleGrant {
        RoleGrant::new(role, ns)
    }

    fn api_error(code: u16, reason: &str) -> Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: reason.to_string(),
            reason: reason.to_string(),
            code,
        })
        .into()
    }

    // =========================================================================
    // Planning
    // =========================================================================

    /// Story: {A,B} -> {A,C} touches only B and C
    #[test]
    fn story_swap_one_grant_creates_one_and_deletes_one() {
        let a = grant("view", "team-a");
        let b = grant("edit", "team-b");
        let c = grant("admin", "team-c");

        let plan = BindingPlan::diff(&[a.clone(), b], &[a, c.clone()]);

        assert_eq!(plan.deletes, vec!["team-b".to_string()]);
        assert_eq!(plan.creates, vec![c]);
    }

    #[test]
    fn initial_grants_are_all_created() {
        let grants = vec![grant("view", "team-a"), grant("edit", "team-b")];
        let plan = BindingPlan::diff(&[], &grants);
        assert!(plan.deletes.is_empty());
        assert_eq!(plan.creates, grants);
    }

    #[test]
    fn unchanged_grants_plan_nothing_regardless_of_order() {
        let a = grant("view", "team-a");
        let b = grant("edit", "team-b");
        let plan = BindingPlan::diff(&[a.clone(), b.clone()], &[b, a]);
        assert!(plan.is_empty());
    }

    #[test]
    fn shrinking_sweeps_dropped_namespaces() {
        let a = grant("view", "team-a");
        let plan = BindingPlan::diff(&[a.clone(), grant("edit", "team-b")], &[a]);
        assert_eq!(plan.deletes, vec!["team-b".to_string()]);
        assert!(plan.creates.is_empty());
    }

    /// Story: Changing the role in a namespace rebinds it, since roleRef is immutable
    #[test]
    fn story_role_change_in_same_namespace_deletes_then_recreates() {
        let plan = BindingPlan::diff(&[grant("view", "team-a")], &[grant("edit", "team-a")]);
        assert_eq!(plan.deletes, vec!["team-a".to_string()]);
        assert_eq!(plan.creates, vec![grant("edit", "team-a")]);
    }

    #[test]
    fn duplicate_grants_collapse_to_one_binding() {
        let a = grant("view", "team-a");
        let plan = BindingPlan::diff(&[], &[a.clone(), a.clone()]);
        assert_eq!(plan.creates, vec![a.clone()]);

        // Dropping one copy of a duplicate removes nothing
        let plan = BindingPlan::diff(&[a.clone(), a.clone()], &[a]);
        assert!(plan.is_empty());
    }

    #[test]
    fn dropping_a_shadowed_grant_leaves_the_binding_alone() {
        let view = grant("view", "team-a");
        let edit = grant("edit", "team-a");
        let plan = BindingPlan::diff(&[view.clone(), edit], &[view]);
        assert!(plan.is_empty());
    }

    #[test]
    fn dropping_the_bound_grant_rebinds_to_the_survivor() {
        let view = grant("view", "team-a");
        let edit = grant("edit", "team-a");
        let plan = BindingPlan::diff(&[view, edit.clone()], &[edit.clone()]);
        assert_eq!(plan.deletes, vec!["team-a".to_string()]);
        assert_eq!(plan.creates, vec![edit]);
    }

    /// Story: Reordering two grants for one namespace moves the binding to the new first grant
    #[test]
    fn story_reordering_same_namespace_grants_rebinds() {
        let view = grant("view", "team-a");
        let edit = grant("edit", "team-a");
        let plan = BindingPlan::diff(&[view.clone(), edit.clone()], &[edit.clone(), view]);
        assert_eq!(plan.deletes, vec!["team-a".to_string()]);
        assert_eq!(plan.creates, vec![edit]);
    }

    #[test]
    fn effective_binding_is_first_grant_per_namespace() {
        let grants = [
            grant("edit", "team-a"),
            grant("view", "team-b"),
            grant("view", "team-a"),
        ];
        let bindings = effective_bindings(&grants);
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings.get("team-a"), Some(&"edit"));
        assert_eq!(bindings.get("team-b"), Some(&"view"));
    }

    #[test]
    fn dedup_preserves_first_occurrence_order() {
        let a = grant("view", "team-a");
        let b = grant("edit", "team-b");
        assert_eq!(
            dedup_grants(&[b.clone(), a.clone(), b.clone()]),
            vec![b, a]
        );
    }

    // =========================================================================
    // Applying
    // =========================================================================

    /// Story: Scenario B - adding team-b creates exactly one binding
    #[tokio::test]
    async fn story_adding_grant_creates_single_binding() {
        let mut gw = MockClusterGateway::new();
        gw.expect_delete_role_binding().never();
        gw.expect_create_role_binding()
            .withf(|ns, rb| {
                ns == "team-b"
                    && rb.metadata.name.as_deref() == Some("alice")
                    && rb.role_ref.name == "edit"
                    && rb.role_ref.kind == "ClusterRole"
                    && rb.subjects.as_ref().is_some_and(|s| {
                        s.len() == 1
                            && s[0].kind == "ServiceAccount"
                            && s[0].name == "alice"
                            && s[0].namespace.as_deref() == Some("kube-system")
                    })
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let old = vec![grant("view", "team-a")];
        let new = vec![grant("view", "team-a"), grant("edit", "team-b")];
        let applied = reconcile_bindings(
            &gw,
            &ManifestRenderer::new(),
            "alice",
            "kube-system",
            &old,
            &new,
        )
        .await
        .expect("reconcile should succeed");

        assert_eq!(applied, new);
    }

    /// Story: Scenario C - removing team-b deletes exactly that binding
    #[tokio::test]
    async fn story_removing_grant_deletes_single_binding() {
        let mut gw = MockClusterGateway::new();
        gw.expect_create_role_binding().never();
        gw.expect_delete_role_binding()
            .withf(|name, ns| name == "alice" && ns == "team-b")
            .times(1)
            .returning(|_, _| Ok(()));

        let old = vec![grant("view", "team-a"), grant("edit", "team-b")];
        let new = vec![grant("view", "team-a")];
        let applied = reconcile_bindings(
            &gw,
            &ManifestRenderer::new(),
            "alice",
            "kube-system",
            &old,
            &new,
        )
        .await
        .expect("reconcile should succeed");

        assert_eq!(applied, new);
    }

    #[tokio::test]
    async fn deletes_run_before_creates() {
        let mut seq = Sequence::new();
        let mut gw = MockClusterGateway::new();
        gw.expect_delete_role_binding()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        gw.expect_create_role_binding()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        reconcile_bindings(
            &gw,
            &ManifestRenderer::new(),
            "alice",
            "kube-system",
            &[grant("view", "team-a")],
            &[grant("edit", "team-a")],
        )
        .await
        .expect("rebind should succeed");
    }

    /// Story: Re-running after a crash finds objects already in place
    #[tokio::test]
    async fn story_existing_and_missing_objects_are_tolerated() {
        let mut gw = MockClusterGateway::new();
        gw.expect_delete_role_binding()
            .returning(|_, _| Err(api_error(404, "NotFound")));
        gw.expect_create_role_binding()
            .returning(|_, _| Err(api_error(409, "AlreadyExists")));

        let applied = reconcile_bindings(
            &gw,
            &ManifestRenderer::new(),
            "alice",
            "kube-system",
            &[grant("view", "team-a"), grant("edit", "team-b")],
            &[grant("view", "team-a"), grant("admin", "team-c")],
        )
        .await
        .expect("tolerated errors must not fail");
        assert_eq!(applied.len(), 2);
    }

    #[tokio::test]
    async fn delete_failure_aborts_before_any_create() {
        let mut gw = MockClusterGateway::new();
        gw.expect_delete_role_binding()
            .times(1)
            .returning(|_, _| Err(api_error(403, "Forbidden")));
        gw.expect_create_role_binding().never();

        let err = reconcile_bindings(
            &gw,
            &ManifestRenderer::new(),
            "alice",
            "kube-system",
            &[grant("view", "team-a")],
            &[grant("edit", "team-b")],
        )
        .await
        .expect_err("forbidden delete must abort");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn create_failure_aborts_remaining_grants() {
        let mut gw = MockClusterGateway::new();
        gw.expect_create_role_binding()
            .times(1)
            .returning(|_, _| Err(api_error(422, "Invalid")));

        let result = reconcile_bindings(
            &gw,
            &ManifestRenderer::new(),
            "alice",
            "kube-system",
            &[],
            &[grant("view", "team-a"), grant("edit", "team-b")],
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unchanged_grants_make_no_calls() {
        let gw = MockClusterGateway::new();
        let grants = vec![grant("view", "team-a")];
        let applied = reconcile_bindings(
            &gw,
            &ManifestRenderer::new(),
            "alice",
            "kube-system",
            &grants,
            &grants,
        )
        .await
        .expect("no-op");
        assert_eq!(applied, grants);
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Story: Bindings removed by hand do not block deletion
    #[tokio::test]
    async fn story_cleanup_tolerates_missing_and_counts_failures() {
        let mut gw = MockClusterGateway::new();
        gw.expect_delete_role_binding().returning(|_, ns| match ns {
            "team-a" => Err(api_error(404, "NotFound")),
            "team-b" => Err(api_error(500, "InternalError")),
            _ => Ok(()),
        });

        let failures = remove_bindings(
            &gw,
            "alice",
            &["team-a".to_string(), "team-b".to_string(), "team-c".to_string()],
        )
        .await;
        assert_eq!(failures, 1);
    }
}
