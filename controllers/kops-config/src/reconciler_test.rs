//! Reconciler tests against in-memory cluster objects

#[cfg(test)]
mod tests {
    use crate::error::ControllerError;
    use crate::reconciler::{instance_group_source, secret_matches, well_known_addresses};
    use crate::test_utils::*;
    use crds::*;
    use kops_bootstrap::ErrorKind;
    use kops_bootstrap::model::{Role, WellKnownService};
    use kops_bootstrap::pipeline::InstanceGroupSource;
    use kube_runtime::controller::Action;
    use std::time::Duration;

    fn ready_objects() -> MockClusterObjects {
        let objects = MockClusterObjects::new();
        objects.add_control_plane(create_test_control_plane(
            "dev",
            "default",
            Some("dev.example.com"),
            "10.0.16.2",
        ));
        objects
    }

    fn user_data(objects: &MockClusterObjects, name: &str) -> String {
        let secret = objects.secret("default", name).expect("secret");
        let data = secret.data.expect("data");
        String::from_utf8(data[BOOTSTRAP_DATA_KEY].0.clone()).expect("utf8")
    }

    #[tokio::test]
    async fn test_reconcile_creates_bootstrap_secret() {
        let store = state_store();
        let objects = ready_objects();
        let reconciler = test_reconciler(&store, &objects);
        let config = create_test_kops_config("node-0", "default", Some("dev"), "nodes");

        let action = reconciler.reconcile_kops_config(&config).await.expect("reconcile");
        assert_eq!(action, Action::await_change());

        let secret = objects.secret("default", "node-0").expect("secret");
        assert_eq!(secret.type_.as_deref(), Some(CLUSTER_SECRET_TYPE));
        let labels = secret.metadata.labels.as_ref().expect("labels");
        assert_eq!(labels.get(CLUSTER_NAME_LABEL).map(String::as_str), Some("dev"));
        let owners = secret.metadata.owner_references.as_ref().expect("owners");
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "KopsConfig");
        assert_eq!(owners[0].uid, "uid-node-0");
        assert_eq!(owners[0].controller, Some(true));

        let script = user_data(&objects, "node-0");
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("server: https://10.0.16.2:3988/"));

        let status = objects.status("default", "node-0").expect("status");
        assert!(status.ready);
        assert_eq!(status.data_secret_name.as_deref(), Some("node-0"));
        assert_eq!(status.error, None);
    }

    #[tokio::test]
    async fn test_missing_ca_keyset_writes_no_secret() {
        let store = state_store();
        store.remove(KEYSET_PATH);
        let objects = ready_objects();
        let reconciler = test_reconciler(&store, &objects);
        let config = create_test_kops_config("node-0", "default", Some("dev"), "nodes");

        let err = reconciler
            .build_bootstrap_data(&config, "default", "dev")
            .await
            .expect_err("no keyset");
        match &err {
            ControllerError::Bootstrap(e) => assert_eq!(e.kind(), ErrorKind::PrerequisiteMissing),
            other => panic!("unexpected error: {other}"),
        }

        let action = reconciler.reconcile_kops_config(&config).await.expect("reconcile");
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
        assert!(objects.secret("default", "node-0").is_none());
        assert_eq!(objects.creates(), 0);

        let status = objects.status("default", "node-0").expect("status");
        assert!(!status.ready);
        assert!(status.error.as_deref().unwrap_or_default().contains("kubernetes-ca"));
    }

    #[tokio::test]
    async fn test_repeated_failures_back_off() {
        let store = state_store();
        store.remove(KEYSET_PATH);
        let objects = ready_objects();
        let reconciler = test_reconciler(&store, &objects);
        let config = create_test_kops_config("node-0", "default", Some("dev"), "nodes");

        let mut actions = Vec::new();
        for _ in 0..4 {
            actions.push(reconciler.reconcile_kops_config(&config).await.expect("reconcile"));
        }
        let expected: Vec<Action> = [1, 1, 2, 3]
            .into_iter()
            .map(|m| Action::requeue(Duration::from_secs(m * 60)))
            .collect();
        assert_eq!(actions, expected);

        // Other resources keep their own sequence
        assert_eq!(reconciler.next_backoff("default/node-1"), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_success_clears_backoff_state() {
        let store = state_store();
        store.remove(KEYSET_PATH);
        let objects = ready_objects();
        let reconciler = test_reconciler(&store, &objects);
        let config = create_test_kops_config("node-0", "default", Some("dev"), "nodes");

        for _ in 0..3 {
            reconciler.reconcile_kops_config(&config).await.expect("reconcile");
        }
        assert!(reconciler.tracks_backoff("default/node-0"));

        store.insert(KEYSET_PATH, KEYSET_YAML);
        let action = reconciler.reconcile_kops_config(&config).await.expect("reconcile");
        assert_eq!(action, Action::await_change());
        assert!(!reconciler.tracks_backoff("default/node-0"));

        // A later failure starts over at the shortest delay
        store.remove(KEYSET_PATH);
        let action = reconciler.reconcile_kops_config(&config).await.expect("reconcile");
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_deleted_config_drops_backoff_state() {
        let store = state_store();
        store.remove(KEYSET_PATH);
        let objects = ready_objects();
        let reconciler = test_reconciler(&store, &objects);
        let config = create_test_kops_config("node-0", "default", Some("dev"), "nodes");

        reconciler.reconcile_kops_config(&config).await.expect("reconcile");
        assert!(reconciler.tracks_backoff("default/node-0"));

        objects.delete_config("default", "node-0");
        let action = reconciler.reconcile_kops_config(&config).await.expect("reconcile");
        assert_eq!(action, Action::await_change());
        assert!(!reconciler.tracks_backoff("default/node-0"));
    }

    #[tokio::test]
    async fn test_failure_after_success_clears_ready() {
        let store = state_store();
        let objects = ready_objects();
        let reconciler = test_reconciler(&store, &objects);
        let mut config = create_test_kops_config("node-0", "default", Some("dev"), "nodes");

        reconciler.reconcile_kops_config(&config).await.expect("reconcile");
        config.status = objects.status("default", "node-0");
        assert!(config.status.as_ref().is_some_and(|s| s.ready));

        store.remove(KEYSET_PATH);
        reconciler.reconcile_kops_config(&config).await.expect("reconcile");

        let status = objects.status("default", "node-0").expect("status");
        assert!(!status.ready);
        assert!(status.error.is_some());
        // The earlier secret is still there and still named
        assert_eq!(status.data_secret_name.as_deref(), Some("node-0"));
        assert!(objects.secret("default", "node-0").is_some());
    }

    #[tokio::test]
    async fn test_second_reconcile_with_identical_bytes_is_noop() {
        let store = state_store();
        let objects = ready_objects();
        let reconciler = test_reconciler(&store, &objects);
        let config = create_test_kops_config("node-0", "default", Some("dev"), "nodes");

        reconciler.reconcile_kops_config(&config).await.expect("first");
        reconciler.reconcile_kops_config(&config).await.expect("second");

        assert_eq!(objects.creates(), 1);
        assert_eq!(objects.replaces(), 0);
    }

    #[tokio::test]
    async fn test_changed_bytes_replace_secret() {
        let store = state_store();
        let objects = ready_objects();
        let reconciler = test_reconciler(&store, &objects);
        let config = create_test_kops_config("node-0", "default", Some("dev"), "nodes");

        reconciler.reconcile_kops_config(&config).await.expect("first");
        let rendered = user_data(&objects, "node-0");
        objects.tamper_secret("default", "node-0", b"#!/bin/bash\necho stale\n");

        reconciler.reconcile_kops_config(&config).await.expect("second");
        assert_eq!(objects.replaces(), 1);
        assert_eq!(user_data(&objects, "node-0"), rendered);
    }

    #[tokio::test]
    async fn test_missing_cluster_label_waits_for_change() {
        let store = state_store();
        let objects = ready_objects();
        let reconciler = test_reconciler(&store, &objects);
        let config = create_test_kops_config("node-0", "default", None, "nodes");

        let action = reconciler.reconcile_kops_config(&config).await.expect("reconcile");
        assert_eq!(action, Action::await_change());
        assert!(objects.secret("default", "node-0").is_none());

        let status = objects.status("default", "node-0").expect("status");
        assert!(status.error.as_deref().unwrap_or_default().contains(CLUSTER_NAME_LABEL));
    }

    #[tokio::test]
    async fn test_missing_control_plane_requeues_node() {
        let store = state_store();
        let objects = MockClusterObjects::new();
        let reconciler = test_reconciler(&store, &objects);
        let config = create_test_kops_config("node-0", "default", Some("dev.example.com"), "nodes");

        let action = reconciler.reconcile_kops_config(&config).await.expect("reconcile");
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
        assert!(objects.secret("default", "node-0").is_none());
    }

    #[tokio::test]
    async fn test_embedded_bastion_needs_no_control_plane() {
        let store = state_store();
        let objects = MockClusterObjects::new();
        let reconciler = test_reconciler(&store, &objects);
        let mut config = create_test_kops_config("bastion-0", "default", Some("dev.example.com"), "nodes");
        config.spec.instance_group_name = None;
        config.spec.instance_group = Some(EmbeddedInstanceGroup {
            name: None,
            role: "Bastion".to_string(),
            machine_type: "t3.micro".to_string(),
            compress_user_data: None,
        });

        reconciler.reconcile_kops_config(&config).await.expect("reconcile");
        assert!(objects.secret("default", "bastion-0").is_some());
        assert!(objects.status("default", "bastion-0").expect("status").ready);
    }

    #[tokio::test]
    async fn test_unknown_embedded_role_is_not_retried() {
        let store = state_store();
        let objects = ready_objects();
        let reconciler = test_reconciler(&store, &objects);
        let mut config = create_test_kops_config("node-0", "default", Some("dev"), "nodes");
        config.spec.instance_group = Some(EmbeddedInstanceGroup {
            name: None,
            role: "Toaster".to_string(),
            machine_type: String::new(),
            compress_user_data: None,
        });

        let action = reconciler.reconcile_kops_config(&config).await.expect("reconcile");
        assert_eq!(action, Action::await_change());
        let status = objects.status("default", "node-0").expect("status");
        assert!(status.error.as_deref().unwrap_or_default().contains("Toaster"));
    }

    #[test]
    fn test_instance_group_source_precedence() {
        let mut config = create_test_kops_config("node-0", "default", Some("dev"), "nodes");
        assert_eq!(
            instance_group_source(&config).expect("named"),
            InstanceGroupSource::Named("nodes".to_string())
        );

        config.spec.instance_group = Some(EmbeddedInstanceGroup {
            name: None,
            role: "ControlPlane".to_string(),
            machine_type: "m5.large".to_string(),
            compress_user_data: Some(true),
        });
        match instance_group_source(&config).expect("embedded") {
            InstanceGroupSource::Embedded(ig) => {
                assert_eq!(ig.metadata.name, "node-0");
                assert_eq!(ig.spec.role, Some(Role::ControlPlane));
                assert_eq!(ig.spec.compress_user_data, Some(true));
            }
            other => panic!("unexpected source: {other:?}"),
        }

        config.spec.instance_group = None;
        config.spec.instance_group_name = None;
        assert!(matches!(
            instance_group_source(&config),
            Err(ControllerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_system_endpoints_map_to_well_known_addresses() {
        let mut cp = create_test_control_plane("dev", "default", None, "10.0.16.2");
        if let Some(status) = cp.status.as_mut() {
            status.system_endpoints.push(SystemEndpoint {
                endpoint_type: SystemEndpointType::KubeApiServer,
                endpoint: "api.dev.example.com".to_string(),
                scope: SystemEndpointScope::External,
            });
        }

        let wka = well_known_addresses(&cp);
        assert_eq!(wka.get(WellKnownService::KopsController)[0].as_str(), "10.0.16.2");
        assert_eq!(wka.get(WellKnownService::KubeApiServerInternal)[0].as_str(), "10.0.16.2");
        assert_eq!(
            wka.get(WellKnownService::KubeApiServerExternal)[0].as_str(),
            "api.dev.example.com"
        );

        cp.status = None;
        assert!(well_known_addresses(&cp).is_empty());
    }

    #[tokio::test]
    async fn test_secret_comparison_ignores_resource_version() {
        let store = state_store();
        let objects = ready_objects();
        let reconciler = test_reconciler(&store, &objects);
        let config = create_test_kops_config("node-0", "default", Some("dev"), "nodes");
        reconciler.reconcile_kops_config(&config).await.expect("reconcile");

        let stored = objects.secret("default", "node-0").expect("secret");
        let mut desired = stored.clone();
        desired.metadata.resource_version = None;
        assert!(secret_matches(&stored, &desired));

        desired.type_ = Some("Opaque".to_string());
        assert!(!secret_matches(&stored, &desired));
    }
}
