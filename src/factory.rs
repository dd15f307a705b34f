//! Cluster connection construction
//!
//! The pool builds connections through the [`ConnectionFactory`] trait so
//! that tests can substitute fakes and so that credential loading stays an
//! external concern. The production [`KubeconfigFactory`] loads a
//! selection's context from its kubeconfig file and assembles a kube
//! client whose transport is wrapped with the cluster's 401 interceptor
//! before any request is made.

use std::sync::Arc;

use async_trait::async_trait;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use kube::client::ConfigExt;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Config;
use tower::ServiceBuilder;

#[cfg(test)]
use mockall::automock;

use crate::aggregate::ClusterQuery;
use crate::auth::transport::AuthInterceptLayer;
use crate::selection::{ClusterMeta, ClusterSelection};
use crate::{Error, Result};

/// Health probe for one cluster: succeeds when the endpoint is reachable
/// with working credentials.
///
/// The pool runs this once synchronously at build time (the pre-flight
/// probe) and the auth monitor re-runs it during recovery. Exec-provider
/// failures surface here even though no HTTP request was ever made.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Issue one cheap call against the cluster
    async fn check(&self) -> Result<()>;
}

/// Concrete kube-rs clients for one cluster.
///
/// One `Client` serves typed, dynamic, and metrics APIs alike, so there is
/// a single client here rather than the per-API-family split other
/// ecosystems use.
#[derive(Clone)]
pub struct KubeHandles {
    /// Resolved client configuration, retained for collaborators that
    /// need the low-level transport parameters
    pub config: Config,
    /// The API client, transport already wrapped with the 401 interceptor
    pub client: kube::Client,
}

/// Everything a pool entry owns for talking to one cluster
pub struct ClusterHandles {
    /// Pre-flight and recovery probe
    pub probe: Arc<dyn HealthProbe>,
    /// The local per-cluster query service the aggregator fans out to
    pub query: Arc<dyn ClusterQuery>,
    /// Concrete kube clients; `None` when a custom factory keeps its
    /// clients inside its probe and query services
    pub kube: Option<KubeHandles>,
}

/// Builds the connection handles for one selection
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Construct handles for `selection`.
    ///
    /// `transport` is the cluster's 401 interceptor; implementations must
    /// wire it into their outbound HTTP stack so credential expiry is
    /// observed mid-stream.
    async fn connect(
        &self,
        selection: &ClusterSelection,
        transport: AuthInterceptLayer,
    ) -> Result<ClusterHandles>;
}

/// Probe that asks the API server for its version
pub struct ApiServerProbe {
    client: kube::Client,
}

impl ApiServerProbe {
    /// Create a probe over an already-built client
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for ApiServerProbe {
    async fn check(&self) -> Result<()> {
        self.client.apiserver_version().await?;
        Ok(())
    }
}

/// Constructs the query service for a freshly built cluster.
///
/// Resource-domain query logic lives outside this crate; callers inject
/// whatever service interprets their domains.
pub type QueryBuilder = Arc<dyn Fn(kube::Client, ClusterMeta) -> Arc<dyn ClusterQuery> + Send + Sync>;

/// Production factory: kubeconfig file + context name → kube client stack
pub struct KubeconfigFactory {
    query_builder: QueryBuilder,
}

impl KubeconfigFactory {
    /// Create a factory that builds query services with `query_builder`
    pub fn new(query_builder: QueryBuilder) -> Self {
        Self { query_builder }
    }
}

#[async_trait]
impl ConnectionFactory for KubeconfigFactory {
    async fn connect(
        &self,
        selection: &ClusterSelection,
        transport: AuthInterceptLayer,
    ) -> Result<ClusterHandles> {
        let meta = ClusterMeta::from_selection(selection).ok_or_else(|| {
            Error::construction(selection.describe(), "selection has no resolvable identity")
        })?;

        let kubeconfig = Kubeconfig::read_from(&selection.path).map_err(|e| {
            Error::construction(selection.describe(), format!("reading kubeconfig: {e}"))
        })?;
        let options = KubeConfigOptions {
            context: Some(selection.context.clone()),
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| {
                Error::construction(selection.describe(), format!("loading context: {e}"))
            })?;

        let client = build_client(&config, transport)?;
        Ok(ClusterHandles {
            probe: Arc::new(ApiServerProbe::new(client.clone())),
            query: (self.query_builder)(client.clone(), meta),
            kube: Some(KubeHandles { config, client }),
        })
    }
}

/// Assemble the kube client with the interceptor between the auth layer
/// and the connector, where it sees raw response statuses
fn build_client(config: &Config, transport: AuthInterceptLayer) -> Result<kube::Client> {
    let https = config.rustls_https_connector()?;
    let connector = HyperClient::builder(TokioExecutor::new()).build::<_, kube::client::Body>(https);
    let service = ServiceBuilder::new()
        .layer(config.base_uri_layer())
        .option_layer(config.auth_layer()?)
        .layer(transport)
        .map_err(tower::BoxError::from)
        .service(connector);
    Ok(kube::Client::new(service, config.default_namespace.clone()))
}
