// tests/server.rs

//! HTTP surface: boot, retry and error scripts, artifacts, ignition, shutdown.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use common::{
    KERNEL_FILE, MirrorFiles, MockMirror, TestSigner, VERSION, payload, release_dir, server_state,
    tamper,
};
use netboot::profile::{Profile, ProfileStore};
use netboot::server::{ServerState, create_router, serve};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const MACHINE_QUERY: &str = "mac=52-54-00-00-00-01&hostname=node1&arch=arm64";

fn profiles() -> ProfileStore {
    let flatcar: Profile = serde_json::from_str(
        r#"{
            "id": "node1",
            "labels": {"mac": "52:54:00:00:00:01"},
            "boot": {"flatcar": {"channel": "beta", "version": "current", "args": ["console=ttyS0"]}},
            "ignition": {"inline": "{\"ignition\":{\"version\":\"3.4.0\"}}"}
        }"#,
    )
    .unwrap();
    let remote: Profile = serde_json::from_str(
        r#"{
            "id": "remote",
            "labels": {"hostname": "remote"},
            "boot": {"kernel": {"uri": "http://images.lan/vmlinuz", "args": ["quiet"]},
                     "images": [{"name": "initrd.img", "uri": "http://images.lan/initrd"}]},
            "ignition": {"source": "http://configs.lan/remote.ign"}
        }"#,
    )
    .unwrap();
    let bare: Profile = serde_json::from_str(
        r#"{"id": "bare", "labels": {"hostname": "bare"}, "boot": {"kernel": {"uri": "http://images.lan/k"}}}"#,
    )
    .unwrap();
    ProfileStore::from_profiles(vec![flatcar, remote, bare]).unwrap()
}

async fn release_mirror(signer: &TestSigner, edit: impl FnOnce(&mut MirrorFiles)) -> MockMirror {
    let mut files = MirrorFiles::new();
    files.add_release(
        signer,
        "beta",
        "arm64",
        VERSION,
        &payload(7, 128 * 1024),
        &payload(8, 64 * 1024),
    );
    files.set_current(signer, "beta", "arm64", VERSION);
    edit(&mut files);
    MockMirror::start(files).await
}

async fn get(state: &Arc<ServerState>, uri: &str) -> Response {
    create_router(state.clone())
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_string(response: Response) -> String {
    String::from_utf8(body_bytes(response).await).unwrap()
}

fn script_value<'a>(script: &'a str, command: &str) -> &'a str {
    script
        .lines()
        .find_map(|line| line.strip_prefix(command))
        .unwrap_or_else(|| panic!("no {command:?} in {script}"))
}

#[tokio::test]
async fn test_boot_script_for_flatcar_profile() {
    let signer = TestSigner::generate();
    let mirror = release_mirror(&signer, |_| {}).await;
    let dir = TempDir::new().unwrap();
    let state = server_state(&dir, &signer, &mirror, profiles());

    let response = get(&state, &format!("/ipxe?{MACHINE_QUERY}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let script = body_string(response).await;

    let base = format!("http://netboot.test/flatcar/beta/arm64/{VERSION}");
    assert_eq!(
        script_value(&script, "kernel "),
        format!(
            "{base}/kernel initrd=flatcar_production_pxe_image.cpio.gz flatcar.first_boot=1 \
             ignition.config.url=http://netboot.test/ignition?{MACHINE_QUERY} console=ttyS0"
        )
    );
    assert_eq!(script_value(&script, "initrd "), format!("{base}/initrd"));
    assert!(script.ends_with("boot\n"));

    // Both artifacts were provisioned before the script was rendered
    let stats = state.metrics.snapshot();
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.boot_scripts, 1);

    let response = get(&state, &format!("/flatcar/beta/arm64/{VERSION}/kernel")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_LENGTH],
        (128 * 1024).to_string().as_str()
    );
    assert_eq!(body_bytes(response).await, payload(7, 128 * 1024));
    assert_eq!(state.metrics.snapshot().hits, 1);
}

#[tokio::test]
async fn test_explicit_kernel_profile() {
    let signer = TestSigner::generate();
    let mirror = MockMirror::start(MirrorFiles::new()).await;
    let dir = TempDir::new().unwrap();
    let state = server_state(&dir, &signer, &mirror, profiles());

    let script = body_string(get(&state, "/ipxe?hostname=remote").await).await;
    assert_eq!(
        script,
        "#!ipxe\nkernel http://images.lan/vmlinuz quiet\ninitrd --name initrd.img http://images.lan/initrd\nboot\n"
    );
    assert_eq!(mirror.requests(), 0);
}

#[tokio::test]
async fn test_retry_script_without_attempt() {
    let signer = TestSigner::generate();
    let mirror = MockMirror::start(MirrorFiles::new()).await;
    let dir = TempDir::new().unwrap();
    let state = server_state(&dir, &signer, &mirror, profiles());

    let script = body_string(get(&state, &format!("/ipxe?{MACHINE_QUERY}")).await).await;
    assert_eq!(script_value(&script, "chain "), format!("/ipxe?{MACHINE_QUERY}&attempt=1"));

    let sleep: u64 = script_value(&script, "sleep ").parse().unwrap();
    assert!((5..10).contains(&sleep), "{sleep}");
    assert_eq!(state.metrics.snapshot().retry_scripts, 1);
}

#[tokio::test]
async fn test_retry_script_increments_attempt() {
    let signer = TestSigner::generate();
    let mirror = MockMirror::start(MirrorFiles::new()).await;
    let dir = TempDir::new().unwrap();
    let state = server_state(&dir, &signer, &mirror, profiles());

    let script = body_string(get(&state, &format!("/ipxe?{MACHINE_QUERY}&attempt=5")).await).await;
    assert_eq!(script_value(&script, "chain "), format!("/ipxe?{MACHINE_QUERY}&attempt=6"));

    // attempt 5: target 320s, sleep within [160s, 320s)
    let sleep: u64 = script_value(&script, "sleep ").parse().unwrap();
    assert!((160..320).contains(&sleep), "{sleep}");
}

#[tokio::test]
async fn test_integrity_failure_is_error_script() {
    let signer = TestSigner::generate();
    let sig_path = format!("{}/{KERNEL_FILE}.sig", release_dir("beta", "arm64", VERSION));
    let mirror = release_mirror(&signer, |files| tamper(files, &sig_path)).await;
    let dir = TempDir::new().unwrap();
    let state = server_state(&dir, &signer, &mirror, profiles());

    let script = body_string(get(&state, &format!("/ipxe?{MACHINE_QUERY}")).await).await;
    assert!(script.contains("status 502"), "{script}");
    assert!(script.ends_with("shell\n"));

    let stats = state.metrics.snapshot();
    assert_eq!(stats.integrity_failures, 1);
    assert_eq!(stats.error_scripts, 1);
    assert!(!state.store().contains(&format!("flatcar-beta-arm64-{VERSION}-kernel")));

    let response = get(&state, &format!("/flatcar/beta/arm64/{VERSION}/kernel")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_write_in_progress_is_conflict() {
    let signer = TestSigner::generate();
    let mirror = release_mirror(&signer, |_| {}).await;
    let dir = TempDir::new().unwrap();
    let state = server_state(&dir, &signer, &mirror, profiles());

    let busy = state
        .store()
        .add(&format!("flatcar-beta-arm64-{VERSION}-kernel"))
        .await
        .unwrap();

    let response = get(&state, &format!("/flatcar/beta/arm64/{VERSION}/kernel")).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(response.headers()[header::RETRY_AFTER], "10");

    let script = body_string(get(&state, &format!("/ipxe?{MACHINE_QUERY}")).await).await;
    assert!(script.contains("attempt=1"), "{script}");
    drop(busy);
}

#[tokio::test]
async fn test_ignition() {
    let signer = TestSigner::generate();
    let mirror = MockMirror::start(MirrorFiles::new()).await;
    let dir = TempDir::new().unwrap();
    let state = server_state(&dir, &signer, &mirror, profiles());

    let response = get(&state, &format!("/ignition?{MACHINE_QUERY}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    assert_eq!(body_string(response).await, r#"{"ignition":{"version":"3.4.0"}}"#);

    let response = get(&state, "/ignition?hostname=remote").await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(response.headers()[header::LOCATION], "http://configs.lan/remote.ign");

    let response = get(&state, "/ignition?hostname=bare").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = get(&state, "/ignition?hostname=unknown").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_shutdown_rolls_back_open_transactions() {
    let signer = TestSigner::generate();
    let mirror = MockMirror::start(MirrorFiles::new()).await;
    let dir = TempDir::new().unwrap();
    let state = server_state(&dir, &signer, &mirror, profiles());

    let mut pending = state.store().add("flatcar-stable-amd64-1.2.3-kernel").await.unwrap();
    pending.write(b"partial").await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(serve(state.clone(), listener, async move {
        let _ = stop_rx.await;
    }));

    stop_tx.send(()).unwrap();
    server.await.unwrap().unwrap();

    assert!(state.shutdown.is_cancelled());
    assert_eq!(state.store().open_transactions(), 0);
    assert!(pending.commit().await.is_err());
    assert_eq!(std::fs::read_dir(dir.path().join("scratch")).unwrap().count(), 0);
}
