//! Node HTTP surface: lease gating, op start/result endpoints, op id
//! mismatch handling.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use hyper::{Body, Request, Response};
use serde_json::{json, Value};

use astacus::common::ipc::SnapshotResult;
use astacus::common::objectstorage::{
    CompressionAlgorithm, CompressionConfig, ObjectStorage, ObjectStorageConfig,
};
use astacus::common::storage::HexDigestStorage;
use astacus::config::{NodeConfig, ParallelConfig};
use astacus::node::{api, Node};

struct Fixture {
    node: Arc<Node>,
    storage_config: ObjectStorageConfig,
    src: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("root");
    let mirror = dir.path().join("mirror");
    fs::create_dir_all(&src).unwrap();
    fs::create_dir_all(&mirror).unwrap();
    let storage_config = ObjectStorageConfig {
        directory: dir.path().join("objects"),
        compression: CompressionConfig {
            algorithm: Some(CompressionAlgorithm::Zstd),
        },
        encryption_key: None,
    };
    let node = Node::new(
        NodeConfig {
            root: src.clone(),
            snapshot_root: mirror,
            parallel: ParallelConfig {
                uploads: 2,
                downloads: 2,
            },
            embed_limit: 100,
        },
        storage_config.clone(),
    );
    Fixture {
        node,
        storage_config,
        src,
        _dir: dir,
    }
}

async fn request(
    node: &Arc<Node>,
    method: Method,
    subpath: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let uri = format!("http://node/node{}", subpath);
    let request = Request::builder()
        .method(method)
        .uri(&uri)
        .body(match &body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let path_only = subpath.split('?').next().unwrap();
    let response: Response<Body> = api::handle(
        node.clone(),
        request,
        path_only.to_string(),
        format!("http://node/node{}", path_only),
    )
    .await;
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn wait_final_result(node: &Arc<Node>, status_path: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let (status, value) = request(node, Method::GET, status_path, None).await;
            assert_eq!(status, StatusCode::OK, "{}", value);
            if value["progress"]["final"].as_bool() == Some(true) {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("op did not finish")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_api_snapshot_and_upload() {
    let fixture = fixture();
    let node = &fixture.node;
    fs::write(fixture.src.join("foo"), "foobar".repeat(100)).unwrap();

    // no body is a validation error
    let (status, _) = request(node, Method::POST, "/snapshot", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    // without the lease the op may not start
    let body = json!({ "root_globs": ["*"] });
    let (status, _) = request(node, Method::POST, "/snapshot", Some(body.clone())).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, value) = request(node, Method::POST, "/lock?locker=x&ttl=60", None).await;
    assert_eq!(status, StatusCode::OK, "{}", value);
    assert_eq!(value, json!({ "locked": true }));

    let (status, value) = request(node, Method::POST, "/snapshot", Some(body)).await;
    assert_eq!(status, StatusCode::OK, "{}", value);
    let op_id = value["op_id"].as_u64().unwrap();
    assert_eq!(op_id, 1);
    assert!(value["status_url"]
        .as_str()
        .unwrap()
        .ends_with("/node/snapshot/1"));

    let value = wait_final_result(node, "/snapshot/1").await;
    let result: SnapshotResult = serde_json::from_value(value).unwrap();
    assert!(result.progress.finished_successfully());
    assert_eq!(result.hashes.len(), 1);
    assert_eq!(result.files, 1);
    assert_eq!(result.total_size, 600);

    // upload what the snapshot found
    let (status, value) = request(
        node,
        Method::POST,
        "/upload",
        Some(json!({ "hashes": result.hashes })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", value);
    assert_eq!(value["op_id"].as_u64().unwrap(), 2);

    let value = wait_final_result(node, "/upload/2").await;
    assert_eq!(value["progress"]["failed"].as_u64(), Some(0));
    assert_eq!(value["hostname"].as_str(), Some(node.hostname()));

    let storage = ObjectStorage::open(&fixture.storage_config).unwrap();
    assert_eq!(
        storage.list_hexdigests().unwrap(),
        vec![result.hashes[0].hexdigest.clone()]
    );

    // the snapshot result has been superseded by the upload op
    let (status, value) = request(node, Method::GET, "/snapshot/1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(value["code"].as_str(), Some("operation_id_mismatch"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_api_clear() {
    let fixture = fixture();
    let node = &fixture.node;
    let mirror = fixture._dir.path().join("mirror");
    fs::write(fixture.src.join("foo"), "foobar").unwrap();
    fs::write(fixture.src.join("foobig"), "foobar".repeat(100)).unwrap();

    let (status, _) = request(node, Method::POST, "/lock?locker=x&ttl=60", None).await;
    assert_eq!(status, StatusCode::OK);

    let body = json!({ "root_globs": ["*"] });
    let (status, _) = request(node, Method::POST, "/snapshot", Some(body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    wait_final_result(node, "/snapshot/1").await;
    assert!(mirror.join("foo").is_file());

    let (status, value) = request(node, Method::POST, "/clear", Some(body.clone())).await;
    assert_eq!(status, StatusCode::OK, "{}", value);
    let value = wait_final_result(node, "/clear/2").await;
    assert_eq!(value["progress"]["failed"].as_u64(), Some(0));

    // both the live directory and the mirror are empty now
    assert!(!fixture.src.join("foo").exists());
    assert!(!fixture.src.join("foobig").exists());
    assert!(!mirror.join("foo").exists());
    assert!(!mirror.join("foobig").exists());

    // a fresh snapshot over the cleared tree finds nothing
    let (status, _) = request(node, Method::POST, "/snapshot", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    let value = wait_final_result(node, "/snapshot/3").await;
    let result: SnapshotResult = serde_json::from_value(value).unwrap();
    assert!(result.progress.finished_successfully());
    assert_eq!(result.files, 0);
    assert!(result.hashes.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_api_result_of_unknown_op_id() {
    let fixture = fixture();
    let (status, value) =
        request(&fixture.node, Method::GET, "/snapshot/7", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(value["code"].as_str(), Some("operation_id_mismatch"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_api_lease_endpoints() {
    let fixture = fixture();
    let node = &fixture.node;

    let (status, _) = request(node, Method::POST, "/relock?locker=a&ttl=60", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = request(node, Method::POST, "/lock?locker=a&ttl=60", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = request(node, Method::POST, "/lock?locker=b&ttl=60", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = request(node, Method::POST, "/relock?locker=b&ttl=60", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = request(node, Method::POST, "/unlock?locker=b", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, value) = request(node, Method::POST, "/unlock?locker=a", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value, json!({ "locked": false }));
    let (status, _) = request(node, Method::POST, "/unlock?locker=a", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}
