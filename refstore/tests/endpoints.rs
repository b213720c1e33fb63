use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::json;

async fn spawn_server() -> (SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(refstore::Store::new(dir.path().to_path_buf()).await.expect("store"));
    let app = refstore::router(store);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, dir)
}

#[tokio::test]
async fn health_check() {
    let (addr, _dir) = spawn_server().await;
    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn stat_missing_object_is_404() {
    let (addr, _dir) = spawn_server().await;
    let resp = reqwest::get(format!("http://{addr}/objects/b/missing.txt?stat=1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn resumable_upload_round_trip() {
    let (addr, _dir) = spawn_server().await;
    let client = reqwest::Client::new();

    let upload_id: String = client
        .post(format!("http://{addr}/resumable/mybucket/dir/file.txt?if_generation_match=0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let body = b"hello, object store";
    let resp = client
        .put(format!("http://{addr}/resumable/{upload_id}"))
        .header("Content-Range", format!("bytes 0-{}/*", body.len() - 1))
        .body(body.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = client
        .post(format!("http://{addr}/resumable/{upload_id}?finalize=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let record: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(record["size"], body.len());
    assert_eq!(record["generation"], 1);

    let resp = client
        .get(format!("http://{addr}/objects/mybucket/dir/file.txt"))
        .query(&[("generation", "1")])
        .header("Range", "bytes=0-6")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"hello, ");
}

#[tokio::test]
async fn create_precondition_zero_rejects_existing_object_at_finalize() {
    let (addr, _dir) = spawn_server().await;
    let client = reqwest::Client::new();

    let upload_id: String = client
        .post(format!("http://{addr}/resumable/b/exists.txt?if_generation_match=0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    client
        .put(format!("http://{addr}/resumable/{upload_id}"))
        .header("Content-Range", "bytes 0-3/*")
        .body("abcd")
        .send()
        .await
        .unwrap();
    let resp = client
        .post(format!("http://{addr}/resumable/{upload_id}?finalize=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // Second create with generation-must-not-exist fails at finalize.
    let upload_id: String = client
        .post(format!("http://{addr}/resumable/b/exists.txt?if_generation_match=0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    client
        .put(format!("http://{addr}/resumable/{upload_id}"))
        .header("Content-Range", "bytes 0-3/*")
        .body("wxyz")
        .send()
        .await
        .unwrap();
    let resp = client
        .post(format!("http://{addr}/resumable/{upload_id}?finalize=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn delete_is_idempotent_on_missing_object() {
    let (addr, _dir) = spawn_server().await;
    let client = reqwest::Client::new();
    let resp = client
        .delete(format!("http://{addr}/objects/b/nope.txt"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn list_separates_objects_and_subdirs() {
    let (addr, _dir) = spawn_server().await;
    let client = reqwest::Client::new();

    for name in ["a.txt", "sub/b.txt", "sub/c.txt"] {
        let upload_id: String = client
            .post(format!("http://{addr}/resumable/listbucket/{name}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        client
            .put(format!("http://{addr}/resumable/{upload_id}"))
            .header("Content-Range", "bytes 0-0/*")
            .body("x")
            .send()
            .await
            .unwrap();
        client
            .post(format!("http://{addr}/resumable/{upload_id}?finalize=1"))
            .send()
            .await
            .unwrap();
    }

    let resp = client
        .get(format!("http://{addr}/list/listbucket"))
        .query(&[("prefix", ""), ("delimiter", "/")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let page: refstore::wire::WireListPage = resp.json().await.unwrap();
    assert_eq!(page.objects.len(), 1);
    assert_eq!(page.objects[0].name, "a.txt");
    assert_eq!(page.subdirs, vec!["sub/".to_string()]);
}

#[tokio::test]
async fn compose_concatenates_parts_in_order() {
    let (addr, _dir) = spawn_server().await;
    let client = reqwest::Client::new();

    for (name, content) in [("part1", "foo"), ("part2", "bar")] {
        let upload_id: String = client
            .post(format!("http://{addr}/resumable/composebucket/{name}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        client
            .put(format!("http://{addr}/resumable/{upload_id}"))
            .header("Content-Range", format!("bytes 0-{}/*", content.len() - 1))
            .body(content)
            .send()
            .await
            .unwrap();
        client
            .post(format!("http://{addr}/resumable/{upload_id}?finalize=1"))
            .send()
            .await
            .unwrap();
    }

    let resp = client
        .post(format!("http://{addr}/compose/composebucket"))
        .json(&json!({
            "dest": "combined",
            "parts": [
                {"name": "part1", "generation": 1},
                {"name": "part2", "generation": 2},
            ],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let record: refstore::wire::WireObject = resp.json().await.unwrap();
    assert_eq!(record.size, 6);

    let resp = client
        .get(format!("http://{addr}/objects/composebucket/combined"))
        .query(&[("generation", &record.generation.to_string())])
        .header("Range", "bytes=0-5")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"foobar");
}
