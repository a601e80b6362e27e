// tests/common/mod.rs

//! Shared test utilities: throwaway signing keys and an in-process mirror.

#![allow(dead_code)]

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use netboot::profile::ProfileStore;
use netboot::provision::Provisioner;
use netboot::server::{ServerConfig, ServerState};
use netboot::storage::FsStore;
use netboot::upstream::{Fetcher, FetcherOptions, Mirror, TrustedKey};
use sequoia_openpgp as openpgp;
use openpgp::cert::CertBuilder;
use openpgp::crypto::KeyPair;
use openpgp::policy::StandardPolicy;
use openpgp::serialize::SerializeInto;
use openpgp::serialize::stream::{Message, Signer};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

pub const VERSION: &str = "3815.2.0";
pub const KERNEL_FILE: &str = "flatcar_production_pxe.vmlinuz";
pub const INITRD_FILE: &str = "flatcar_production_pxe_image.cpio.gz";

/// Signing key generated per test
pub struct TestSigner {
    cert: openpgp::Cert,
}

impl TestSigner {
    pub fn generate() -> Self {
        let (cert, _) = CertBuilder::new()
            .add_userid("Netboot Test Signing Key")
            .add_signing_subkey()
            .generate()
            .unwrap();
        Self { cert }
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.cert.to_vec().unwrap()
    }

    pub fn trusted_key(&self) -> Arc<TrustedKey> {
        Arc::new(TrustedKey::from_bytes(&self.public_key()).unwrap())
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut sink = Vec::new();
        {
            let message = Message::new(&mut sink);
            let mut signer = Signer::new(message, self.keypair()).detached().build().unwrap();
            signer.write_all(data).unwrap();
            signer.finalize().unwrap();
        }
        sink
    }

    fn keypair(&self) -> KeyPair {
        let policy = StandardPolicy::new();
        self.cert
            .keys()
            .unencrypted_secret()
            .with_policy(&policy, None)
            .supported()
            .alive()
            .revoked(false)
            .for_signing()
            .next()
            .unwrap()
            .key()
            .clone()
            .into_keypair()
            .unwrap()
    }
}

/// Deterministic payload spanning many HTTP chunks
pub fn payload(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Files served by a [`MockMirror`], keyed by URL path
#[derive(Default, Clone)]
pub struct MirrorFiles {
    files: HashMap<String, Vec<u8>>,
    hang: HashSet<String>,
    delay: Duration,
}

impl MirrorFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, data: Vec<u8>) {
        self.files.insert(path.into(), data);
    }

    pub fn remove(&mut self, path: &str) {
        self.files.remove(path);
    }

    pub fn get_mut(&mut self, path: &str) -> &mut Vec<u8> {
        self.files.get_mut(path).unwrap()
    }

    /// Requests for `path` never get a response
    pub fn hang(&mut self, path: impl Into<String>) {
        self.hang.insert(path.into());
    }

    /// Hold every request this long before answering
    pub fn delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    /// Publish a signed release: kernel, initrd and their signatures
    pub fn add_release(
        &mut self,
        signer: &TestSigner,
        channel: &str,
        arch: &str,
        version: &str,
        kernel: &[u8],
        initrd: &[u8],
    ) {
        let dir = release_dir(channel, arch, version);
        for (name, data) in [(KERNEL_FILE, kernel), (INITRD_FILE, initrd)] {
            self.insert(format!("{dir}/{name}"), data.to_vec());
            self.insert(format!("{dir}/{name}.sig"), signer.sign(data));
        }
    }

    /// Publish a signed `current/version.txt` pointing at `version`
    pub fn set_current(&mut self, signer: &TestSigner, channel: &str, arch: &str, version: &str) {
        let dir = release_dir(channel, arch, "current");
        let descriptor = format!(
            "FLATCAR_BUILD=3815\nFLATCAR_BRANCH=2\nFLATCAR_VERSION={version}\nFLATCAR_VERSION_ID={version}\n"
        );
        let signature = signer.sign(descriptor.as_bytes());
        self.insert(format!("{dir}/version.txt"), descriptor.into_bytes());
        self.insert(format!("{dir}/version.txt.sig"), signature);
    }
}

pub fn release_dir(channel: &str, arch: &str, version: &str) -> String {
    format!("/{channel}/{arch}-usr/{version}")
}

/// Flip the last byte of a file, e.g. the tail of a signature
pub fn tamper(files: &mut MirrorFiles, path: &str) {
    let data = files.get_mut(path);
    let last = data.len() - 1;
    data[last] ^= 0xff;
}

struct MirrorState {
    files: HashMap<String, Vec<u8>>,
    hang: HashSet<String>,
    delay: Duration,
    requests: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Counts a request as in flight until its handler returns or is dropped
struct InFlight<'a>(&'a MirrorState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a MirrorState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Upstream mirror served from memory on 127.0.0.1
pub struct MockMirror {
    pub addr: SocketAddr,
    state: Arc<MirrorState>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockMirror {
    pub async fn start(files: MirrorFiles) -> Self {
        let state = Arc::new(MirrorState {
            files: files.files,
            hang: files.hang,
            delay: files.delay,
            requests: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        });
        let app = Router::new().fallback(serve_file).with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state, handle }
    }

    /// Mirror template for this server
    pub fn template(&self) -> String {
        format!("http://{}/{{channel}}/{{arch}}-usr/{{version}}", self.addr)
    }

    pub fn mirror(&self) -> Mirror {
        Mirror::new(self.template()).unwrap()
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Most requests ever handled at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` requests have arrived
    pub async fn wait_for_requests(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.requests() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}

impl Drop for MockMirror {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_file(State(state): State<Arc<MirrorState>>, uri: Uri) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    let _in_flight = InFlight::enter(&state);

    if state.hang.contains(uri.path()) {
        std::future::pending::<()>().await;
    }
    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }

    match state.files.get(uri.path()) {
        Some(data) => Body::from(data.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Store plus fetcher against a mock mirror
pub struct Fixture {
    pub dir: TempDir,
    pub store: FsStore,
    pub fetcher: Arc<Fetcher>,
    pub provisioner: Provisioner,
}

impl Fixture {
    pub fn new(signer: &TestSigner, mirror: &MockMirror) -> Self {
        Self::with_concurrency(signer, mirror, 4)
    }

    pub fn with_concurrency(signer: &TestSigner, mirror: &MockMirror, concurrency: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path().join("data"), dir.path().join("scratch")).unwrap();
        let options = FetcherOptions {
            mirror: mirror.mirror(),
            request_concurrency: concurrency,
            ..Default::default()
        };
        let fetcher = Arc::new(Fetcher::new(signer.trusted_key(), options).unwrap());
        let provisioner = Provisioner::new(fetcher.clone(), store.clone());
        Self {
            dir,
            store,
            fetcher,
            provisioner,
        }
    }

    /// Number of files left in the scratch directory
    pub fn staged_files(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("scratch")).unwrap().count()
    }
}

/// Server state against a mock mirror with the given profiles
pub fn server_state(
    dir: &TempDir,
    signer: &TestSigner,
    mirror: &MockMirror,
    profiles: ProfileStore,
) -> Arc<ServerState> {
    let config = ServerConfig {
        data_dir: dir.path().join("data"),
        scratch_dir: dir.path().join("scratch"),
        assets_dir: dir.path().join("assets"),
        public_url: "http://netboot.test".to_string(),
        fetcher: FetcherOptions {
            mirror: mirror.mirror(),
            ..Default::default()
        },
        ..Default::default()
    };
    Arc::new(ServerState::new(config, signer.trusted_key(), profiles).unwrap())
}
