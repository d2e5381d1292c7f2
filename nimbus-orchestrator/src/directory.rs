//! Lookups over the control-plane instance pool.

use nimbus_common::{ClusterError, ClusterResult, Instance};
use nimbus_providers::inventory::PoolQuery;
use nimbus_providers::ControlPlane;

pub async fn list(cp: &dyn ControlPlane, query: &PoolQuery) -> ClusterResult<Vec<Instance>> {
    cp.find_instances(query).await.map_err(ClusterError::service)
}

pub async fn get(cp: &dyn ControlPlane, id: i64) -> ClusterResult<Instance> {
    cp.get_instance(id).await.map_err(ClusterError::service)
}

/// Live (not DONE) instance named exactly `name`, visible to the user or group.
///
/// Always a fresh query. When several instances share the name the lowest id
/// wins.
pub async fn find_by_name(cp: &dyn ControlPlane, name: &str) -> ClusterResult<Option<Instance>> {
    let mut matches: Vec<Instance> = list(cp, &PoolQuery::default())
        .await?
        .into_iter()
        .filter(|i| i.name == name)
        .collect();
    if matches.len() > 1 {
        tracing::warn!(
            "⚠️ [directory] {} instances are named {}; using the oldest",
            matches.len(),
            name
        );
    }
    matches.sort_by_key(|i| i.id);
    Ok(matches.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::{InstanceStatus, VmState};
    use nimbus_providers::inventory::{Ownership, StateFilter};
    use nimbus_providers::mock::MockProvider;

    #[tokio::test]
    async fn find_by_name_ignores_done_instances() {
        let mock = MockProvider::new();
        mock.insert_instance("vfxt-01", None, InstanceStatus::new(VmState::Done));
        assert_eq!(find_by_name(&mock, "vfxt-01").await.unwrap(), None);

        let live = mock.insert_instance("vfxt-01", None, InstanceStatus::running());
        let found = find_by_name(&mock, "vfxt-01").await.unwrap().unwrap();
        assert_eq!(found.id, live);
        assert_eq!(find_by_name(&mock, "vfxt-0").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_honours_range_and_state() {
        let mock = MockProvider::new();
        let a = mock.insert_instance("a", None, InstanceStatus::running());
        let b = mock.insert_instance("b", None, InstanceStatus::poweroff());
        mock.insert_instance("c", None, InstanceStatus::running());

        let query = PoolQuery {
            range_start: a,
            range_end: b,
            state: StateFilter::Any,
            ownership: Ownership::All,
        };
        let names: Vec<String> = list(&mock, &query).await.unwrap().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        let active = PoolQuery {
            state: StateFilter::Active,
            ..PoolQuery::default()
        };
        assert_eq!(list(&mock, &active).await.unwrap().len(), 2);
    }
}
