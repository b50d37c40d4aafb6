use super::error::{self, Result};

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::{ControllerRevision, DaemonSet},
    core::v1::Pod,
};
use kube::api::{Api, DeleteParams, ListParams};
use snafu::ResultExt;
use std::sync::Arc;
use tracing::{event, instrument, Level};

#[cfg(feature = "mockall")]
use mockall::{mock, predicate::*};

const HTTP_NOT_FOUND: u16 = 404;

#[async_trait]
/// A trait providing an interface to the cluster objects consumed by the rollout controller. This is provided
/// as a trait in order to allow mocks and in-memory clusters to be used for testing purposes.
pub trait ClusterClient: Clone + Sized + Send + Sync {
    /// Fetch a DaemonSet. Returns `None` if it does not exist.
    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>>;
    /// List the Pods in a namespace matching a label selector, in the order returned by the API server.
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;
    /// List the ControllerRevisions in a namespace matching a label selector.
    async fn list_controller_revisions(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ControllerRevision>>;
    /// Delete a Pod with default propagation. A Pod which no longer exists is reported as `PodNotFound`.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock ClusterClient for use in tests.
    pub ClusterClient {}
    #[async_trait]
    impl ClusterClient for ClusterClient {
        async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>>;
        async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;
        async fn list_controller_revisions(
            &self,
            namespace: &str,
            label_selector: &str,
        ) -> Result<Vec<ControllerRevision>>;
        async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
    }

    impl Clone for ClusterClient {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> ClusterClient for Arc<T>
where
    T: ClusterClient,
{
    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>> {
        (**self).get_daemonset(namespace, name).await
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        (**self).list_pods(namespace, label_selector).await
    }

    async fn list_controller_revisions(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ControllerRevision>> {
        (**self)
            .list_controller_revisions(namespace, label_selector)
            .await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        (**self).delete_pod(namespace, name).await
    }
}

#[derive(Clone)]
/// Concrete implementation of the `ClusterClient` trait. This implementation will almost
/// certainly be used in any case that isn't a unit test.
pub struct K8SClusterClient {
    k8s_client: kube::client::Client,
}

impl K8SClusterClient {
    pub fn new(k8s_client: kube::client::Client) -> Self {
        K8SClusterClient { k8s_client }
    }
}

#[async_trait]
impl ClusterClient for K8SClusterClient {
    #[instrument(skip(self), err)]
    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>> {
        let api: Api<DaemonSet> = Api::namespaced(self.k8s_client.clone(), namespace);
        api.get_opt(name).await.context(error::GetDaemonSetSnafu {
            namespace,
            name,
        })
    }

    #[instrument(skip(self), err)]
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.k8s_client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .context(error::ListPodsSnafu {
                namespace,
                label_selector,
            })?;

        event!(Level::DEBUG, count = pods.items.len(), "Listed pods.");
        Ok(pods.items)
    }

    #[instrument(skip(self), err)]
    async fn list_controller_revisions(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ControllerRevision>> {
        let api: Api<ControllerRevision> = Api::namespaced(self.k8s_client.clone(), namespace);
        let revisions = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .context(error::ListControllerRevisionsSnafu {
                namespace,
                label_selector,
            })?;

        Ok(revisions.items)
    }

    #[instrument(skip(self), err)]
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.k8s_client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                event!(Level::INFO, "Deleted pod '{}/{}'.", namespace, name);
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == HTTP_NOT_FOUND => error::PodNotFoundSnafu {
                namespace,
                name,
            }
            .fail(),
            Err(e) => Err(e).context(error::DeletePodSnafu { namespace, name }),
        }
    }
}
