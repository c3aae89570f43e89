// tests/replication_test.rs

//! Pull/push replication against a minimal hand-rolled HTTP/1.1 server
//! standing in for a CouchDB-v3-compatible peer. No mock-HTTP crate is
//! in the dependency graph, so the fixture below speaks just enough of
//! the protocol (one request per accepted connection, `Connection:
//! close`) to drive `ReplicationClient` through a single changes page.

use revtree::config::{CancellationToken, ReplicatorOptions, StoreOptions};
use revtree::revision::model::{compute_rev_id, DocId};
use revtree::store::Datastore;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::thread::JoinHandle;

/// Serves one canned JSON response per entry in `responses`, in order,
/// one per accepted TCP connection. Stops after the list is exhausted.
fn spawn_server(responses: Vec<String>) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        for body in responses {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();

            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
            if content_length > 0 {
                let mut discard = vec![0u8; content_length];
                reader.read_exact(&mut discard).unwrap();
            }

            let mut stream = stream;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();
        }
    });
    (format!("http://{}", addr), handle)
}

#[test]
fn pull_grafts_a_new_remote_document_without_conflicting() {
    let remote_body = serde_json::json!({"greeting": "hi"});
    let remote_rev = compute_rev_id(None, false, &remote_body, &[]).unwrap();

    let changes = serde_json::json!({
        "results": [{"seq": 1, "id": "doc1", "changes": [{"rev": remote_rev.to_string()}]}],
        "last_seq": 1
    })
    .to_string();
    let revs_diff = serde_json::json!({
        "doc1": {"missing": [remote_rev.to_string()]}
    })
    .to_string();
    let open_revs = serde_json::json!([
        {"ok": {"_id": "doc1", "_rev": remote_rev.to_string(), "greeting": "hi"}}
    ])
    .to_string();

    let (base_url, _server) = spawn_server(vec![changes, revs_diff, open_revs]);

    let dir = tempfile::tempdir().unwrap();
    let store = Datastore::open(StoreOptions::new(dir.path())).unwrap();
    let summary = store
        .pull(ReplicatorOptions::new(base_url), &CancellationToken::new())
        .unwrap();

    assert_eq!(summary.docs_written, 1);
    let doc = store.get(&DocId::new("doc1").unwrap(), false).unwrap();
    assert_eq!(doc["greeting"], "hi");
}

#[test]
fn push_sends_locally_created_documents_to_the_remote() {
    let revs_diff_response = serde_json::json!({}).to_string(); // filled in below per doc
    let _ = revs_diff_response;

    let dir = tempfile::tempdir().unwrap();
    let store = Datastore::open(StoreOptions::new(dir.path())).unwrap();
    let created = store
        .put(Some(DocId::new("doc1").unwrap()), serde_json::json!({"n": 1}))
        .unwrap();

    let revs_diff = serde_json::json!({
        "doc1": {"missing": [created.rev_id.to_string()]}
    })
    .to_string();
    let bulk_result = serde_json::json!([{"id": "doc1", "rev": created.rev_id.to_string()}]).to_string();

    let (base_url, _server) = spawn_server(vec![revs_diff, bulk_result]);

    let summary = store
        .push(ReplicatorOptions::new(base_url), &CancellationToken::new())
        .unwrap();
    assert_eq!(summary.docs_written, 1);
}

#[test]
fn cancelled_token_stops_pull_before_any_request_is_sent() {
    let dir = tempfile::tempdir().unwrap();
    let store = Datastore::open(StoreOptions::new(dir.path())).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = store.pull(ReplicatorOptions::new("http://127.0.0.1:1"), &cancel);
    assert!(matches!(result, Err(revtree::Error::Cancelled)));
}
