//! Diff planner: desired vs observed manager workloads
//!
//! Manager workloads are immutable from the operator's standpoint; any
//! configuration change is replace-only, so the plan for a changed manager is
//! always Delete followed by Create, in that order.

use super::manager::ManagerSpec;

/// One reconcile action against the cluster
#[derive(Clone, Debug)]
pub enum Action {
    /// Materialize and submit a manager workload, waiting for readiness
    Create(ManagerSpec),
    /// Tear down a manager workload
    Delete(ManagerSpec),
}

impl Action {
    /// Short description used in error aggregation and logs
    pub fn describe(&self) -> String {
        match self {
            Action::Create(m) => format!("create manager for '{}'", m.network_name),
            Action::Delete(m) => format!("delete manager for '{}'", m.network_name),
        }
    }
}

/// Produce the ordered action plan transforming `observed` into `desired`.
///
/// Managers are matched by network name. A desired manager with no observed
/// counterpart is created; a matched pair whose configuration differs is
/// replaced (Delete before Create); observed managers without a desired
/// counterpart are deleted last.
pub fn plan(mut desired: Vec<ManagerSpec>, mut observed: Vec<ManagerSpec>) -> Vec<Action> {
    desired.sort_by(|a, b| a.cmp_key(b));
    observed.sort_by(|a, b| a.cmp_key(b));

    let mut actions = Vec::new();

    for want in &desired {
        match observed.iter().find(|have| have.network_name == want.network_name) {
            None => actions.push(Action::Create(want.clone())),
            Some(have) if !want.same_config(have) => {
                actions.push(Action::Delete(have.clone()));
                actions.push(Action::Create(want.clone()));
            }
            Some(_) => {}
        }
    }

    for have in &observed {
        if !desired.iter().any(|want| want.network_name == have.network_name) {
            actions.push(Action::Delete(have.clone()));
        }
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(network: &str, vlan_id: u16) -> ManagerSpec {
        ManagerSpec {
            network_name: network.into(),
            vlan_id,
            gateways: vec![],
            manager_affinity: None,
            mappings: vec![],
            pools: vec![],
        }
    }

    #[test]
    fn unknown_desired_managers_are_created() {
        let actions = plan(vec![manager("n1", 10)], vec![]);
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], Action::Create(m) if m.network_name == "n1"));
    }

    #[test]
    fn orphaned_observed_managers_are_deleted() {
        let actions = plan(vec![], vec![manager("n1", 10)]);
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], Action::Delete(m) if m.network_name == "n1"));
    }

    #[test]
    fn matching_managers_produce_no_actions() {
        let actions = plan(vec![manager("n1", 10)], vec![manager("n1", 10)]);
        assert!(actions.is_empty());
    }

    #[test]
    fn vlan_change_replaces_delete_first() {
        // Replace is Delete then Create, never the other way around: two
        // managers for the same network must not coexist.
        let actions = plan(vec![manager("n1", 20)], vec![manager("n1", 10)]);
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], Action::Delete(m) if m.vlan_id == 10));
        assert!(matches!(&actions[1], Action::Create(m) if m.vlan_id == 20));
    }

    #[test]
    fn mixed_worlds_diff_independently() {
        let desired = vec![manager("a", 1), manager("b", 2), manager("c", 3)];
        let observed = vec![manager("b", 2), manager("c", 9), manager("d", 4)];

        let actions = plan(desired, observed);

        let descriptions: Vec<String> = actions.iter().map(|a| a.describe()).collect();
        assert_eq!(
            descriptions,
            vec![
                "create manager for 'a'",
                "delete manager for 'c'",
                "create manager for 'c'",
                "delete manager for 'd'",
            ]
        );
    }
}
