//! Shared test fixtures: in-process fakes for every port and a fully wired
//! [`Fleet`] on an in-memory database.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use opscenter_core::Config;
use opscenter_core::db::unix_timestamp;
use opscenter_crypto::certs::{IdentityBundle, generate_self_signed_identity};
use serde_json::json;
use tokio::sync::Notify;
use tonic::Request;

use crate::auth::Identity;
use crate::config_store::ConfigStore;
use crate::ports::{
    BootstrapRequest, ClusterIdentity, ClusterTransport, Endpoint, ProviderConfig,
    Provisioner, ProvisionerError, ServerFacts, ServerTransport, TransportError, UpdateRelease,
    UpdateSource,
};
use crate::provisioning::{Fleet, Ports, Registration};
use crate::storage::{
    ClusterDetail, FleetDatabase, NewArtifact, NewArtifactFile, NewInventoryRecord, Server,
};
use crate::tls::{CertificateStore, ConnectionInfo, ServerIdentity};

// =========================================================================
// Port fakes
// =========================================================================

/// Machines are reachable unless marked otherwise.
#[derive(Default)]
pub struct FakeServerTransport {
    unreachable: Mutex<HashSet<String>>,
    failing_resets: Mutex<HashSet<String>>,
    pushes: Mutex<Vec<(String, ProviderConfig)>>,
    resets: Mutex<Vec<(String, Option<String>)>>,
    probes: AtomicUsize,
}

impl FakeServerTransport {
    pub fn set_reachable(&self, server: &str, reachable: bool) {
        let mut unreachable = self.unreachable.lock().unwrap();
        if reachable {
            unreachable.remove(server);
        } else {
            unreachable.insert(server.to_string());
        }
    }

    pub fn fail_reset(&self, server: &str) {
        self.failing_resets
            .lock()
            .unwrap()
            .insert(server.to_string());
    }

    pub fn pushes(&self) -> Vec<(String, ProviderConfig)> {
        self.pushes.lock().unwrap().clone()
    }

    pub fn resets(&self) -> Vec<(String, Option<String>)> {
        self.resets.lock().unwrap().clone()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    fn check(&self, target: &Endpoint) -> Result<(), TransportError> {
        if self.unreachable.lock().unwrap().contains(&target.name) {
            return Err(TransportError::Unreachable(format!(
                "{} refused connection",
                target.name
            )));
        }
        Ok(())
    }
}

pub fn sample_facts() -> ServerFacts {
    ServerFacts {
        hardware: json!({"cpu": 8, "memory_gib": 64}),
        os: json!({"name": "linux"}),
        version: json!({"version": "1.0"}),
    }
}

#[async_trait]
impl ServerTransport for FakeServerTransport {
    async fn probe(&self, target: &Endpoint) -> Result<ServerFacts, TransportError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.check(target)?;
        Ok(sample_facts())
    }

    async fn push_config(
        &self,
        target: &Endpoint,
        config: &ProviderConfig,
    ) -> Result<(), TransportError> {
        self.check(target)?;
        self.pushes
            .lock()
            .unwrap()
            .push((target.name.clone(), config.clone()));
        Ok(())
    }

    async fn factory_reset(
        &self,
        target: &Endpoint,
        token: Option<&str>,
    ) -> Result<(), TransportError> {
        self.check(target)?;
        if self.failing_resets.lock().unwrap().contains(&target.name) {
            return Err(TransportError::Rejected(format!(
                "{} refused reset",
                target.name
            )));
        }
        self.resets
            .lock()
            .unwrap()
            .push((target.name.clone(), token.map(str::to_string)));
        Ok(())
    }
}

/// Parks a fake call until the test releases it.
#[derive(Default)]
pub struct Gate {
    armed: AtomicBool,
    entered: Notify,
    released: Notify,
}

impl Gate {
    /// Make the next call park.
    pub fn close(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Resolves once a call is parked.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn open(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.released.notify_one();
    }

    async fn pass(&self) {
        if self.armed.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.released.notified().await;
        }
    }
}

#[derive(Default)]
pub struct FakeClusterTransport {
    pub inventory_gate: Gate,
    fail_bootstrap: AtomicBool,
    fail_inventory: AtomicBool,
    inventory: Mutex<Vec<NewInventoryRecord>>,
    bootstraps: Mutex<Vec<Vec<String>>>,
}

impl FakeClusterTransport {
    pub fn set_bootstrap_failing(&self, failing: bool) {
        self.fail_bootstrap.store(failing, Ordering::SeqCst);
    }

    pub fn set_inventory_failing(&self, failing: bool) {
        self.fail_inventory.store(failing, Ordering::SeqCst);
    }

    pub fn set_inventory(&self, records: Vec<NewInventoryRecord>) {
        *self.inventory.lock().unwrap() = records;
    }

    /// Member names of every bootstrap request seen.
    pub fn bootstraps(&self) -> Vec<Vec<String>> {
        self.bootstraps.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterTransport for FakeClusterTransport {
    async fn bootstrap(
        &self,
        request: &BootstrapRequest,
    ) -> Result<ClusterIdentity, TransportError> {
        self.bootstraps
            .lock()
            .unwrap()
            .push(request.members.iter().map(|m| m.name.clone()).collect());
        if self.fail_bootstrap.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("first member went away".into()));
        }
        let bundle = generate_self_signed_identity(&request.name, &[])
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        Ok(ClusterIdentity {
            connection_url: format!("https://{}.cluster.test:8443", request.name),
            certificate: bundle.cert_pem,
            fingerprint: bundle.fingerprint,
        })
    }

    async fn fetch_inventory(
        &self,
        _cluster: &Endpoint,
    ) -> Result<Vec<NewInventoryRecord>, TransportError> {
        self.inventory_gate.pass().await;
        if self.fail_inventory.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("cluster API down".into()));
        }
        Ok(self.inventory.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeProvisioner {
    pub gate: Gate,
    failing: AtomicBool,
    runs: AtomicUsize,
}

impl FakeProvisioner {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn materialize(
        &self,
        cluster: &ClusterDetail,
    ) -> Result<Vec<NewArtifact>, ProvisionerError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        self.gate.pass().await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProvisionerError::Render("template engine exploded".into()));
        }
        Ok(vec![NewArtifact {
            name: "terraform-configuration".into(),
            description: format!("Terraform for {}", cluster.cluster.name),
            properties: BTreeMap::from([("run".to_string(), run.to_string())]),
            files: vec![NewArtifactFile {
                name: "main.tf.json".into(),
                mime_type: "application/json".into(),
                content: format!(r#"{{"members":{}}}"#, cluster.members.len()).into_bytes(),
            }],
        }])
    }
}

pub struct FakeUpdateSource {
    releases: Mutex<Vec<UpdateRelease>>,
    failing: AtomicBool,
}

impl FakeUpdateSource {
    pub const fn new(releases: Vec<UpdateRelease>) -> Self {
        Self {
            releases: Mutex::new(releases),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_releases(&self, releases: Vec<UpdateRelease>) {
        *self.releases.lock().unwrap() = releases;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl UpdateSource for FakeUpdateSource {
    async fn releases(&self) -> Result<Vec<UpdateRelease>, TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("index.json unavailable".into()));
        }
        Ok(self.releases.lock().unwrap().clone())
    }
}

// =========================================================================
// Fleet fixture
// =========================================================================

/// Self-signed identity for a machine named `name`.
pub fn machine_identity(name: &str) -> IdentityBundle {
    generate_self_signed_identity(name, &[format!("{name}.fleet.test")]).unwrap()
}

pub fn control_plane_identity() -> CertificateStore {
    let bundle = generate_self_signed_identity("opscenter", &["localhost".to_string()]).unwrap();
    CertificateStore::new(ServerIdentity::from_pem(&bundle.cert_pem, &bundle.key_pem).unwrap())
}

/// A [`Fleet`] on an in-memory database with fake ports.
pub struct TestFleet {
    pub fleet: Fleet,
    pub db: FleetDatabase,
    pub config: ConfigStore,
    pub identity: CertificateStore,
    pub server_transport: Arc<FakeServerTransport>,
    pub cluster_transport: Arc<FakeClusterTransport>,
    pub provisioner: Arc<FakeProvisioner>,
    pub update_source: Arc<FakeUpdateSource>,
}

impl TestFleet {
    pub async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let db = FleetDatabase::open_in_memory().await.unwrap();
        let config = ConfigStore::new(config);
        let identity = control_plane_identity();
        let server_transport = Arc::new(FakeServerTransport::default());
        let cluster_transport = Arc::new(FakeClusterTransport::default());
        let provisioner = Arc::new(FakeProvisioner::default());
        let update_source = Arc::new(FakeUpdateSource::new(Vec::new()));

        let ports = Ports {
            server_transport: server_transport.clone(),
            cluster_transport: cluster_transport.clone(),
            provisioner: provisioner.clone(),
            update_source: Some(update_source.clone()),
        };
        let fleet = Fleet::new(db.clone(), config.clone(), identity.clone(), ports);

        Self {
            fleet,
            db,
            config,
            identity,
            server_transport,
            cluster_transport,
            provisioner,
            update_source,
        }
    }

    /// A fresh single-use token.
    pub async fn token(&self) -> String {
        self.fleet
            .tokens
            .create(1, unix_timestamp() + 3600, "test")
            .await
            .unwrap()
            .uuid
    }

    /// Register `name` through a fresh token; the server is `Pending`.
    pub async fn register(&self, name: &str) -> (Server, IdentityBundle) {
        let identity = machine_identity(name);
        let token = self.token().await;
        let (server, _) = self
            .fleet
            .servers
            .register(Some(&identity.cert_pem), &registration(name, &token))
            .await
            .unwrap();
        (server, identity)
    }

    /// Register `name` and probe it into `Ready`.
    pub async fn ready_server(&self, name: &str) -> Server {
        self.register(name).await;
        self.fleet.servers.resync(name).await.unwrap()
    }
}

pub fn registration(name: &str, token: &str) -> Registration {
    Registration {
        name: name.to_string(),
        connection_url: format!("https://{name}.fleet.test:8443"),
        server_type: "fleet-member".to_string(),
        token: token.to_string(),
    }
}

// =========================================================================
// Request builders
// =========================================================================

/// A request as it looks after the access interceptor admitted `identity`.
pub fn request_as<T>(inner: T, identity: Identity) -> Request<T> {
    let mut req = Request::new(inner);
    req.extensions_mut().insert(identity);
    req
}

/// A request from the local socket.
pub fn local_request<T>(inner: T) -> Request<T> {
    request_as(inner, Identity::Local)
}

/// A request over a TLS connection presenting `cert_pem`.
pub fn request_with_certificate<T>(inner: T, cert_pem: &str) -> Request<T> {
    let mut req = Request::new(inner);
    req.extensions_mut().insert(ConnectionInfo {
        peer_certificate: Some(opscenter_crypto::first_certificate_der(cert_pem).unwrap()),
        ..ConnectionInfo::default()
    });
    req
}
