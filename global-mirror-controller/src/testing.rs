use http::{Method, Request, Response};
use kube::Client;
use kube::client::Body;
use serde_json::json;
use tokio::task::JoinHandle;
use tower_test::mock;

pub(crate) type MockHandle = mock::Handle<Request<Body>, Response<Body>>;

pub(crate) fn mock_client() -> (Client, MockHandle) {
    let (service, handle) = mock::pair();
    (Client::new(service, "default"), handle)
}

/// Answers API requests until every clone of the client is dropped,
/// recording each method and path for the test to assert on.
pub(crate) fn spawn_api(mut handle: MockHandle) -> JoinHandle<Vec<(Method, String)>> {
    tokio::spawn(async move {
        let mut calls = Vec::new();
        while let Some((request, send)) = handle.next_request().await {
            let method = request.method().clone();
            let path = request.uri().path().to_string();
            let body = if method == Method::DELETE {
                json!({"kind": "Status", "apiVersion": "v1", "status": "Success"})
            } else if path.contains("/endpointslices/") {
                json!({"metadata": {"name": "mirrored"}, "addressType": "IPv4", "endpoints": []})
            } else {
                json!({"metadata": {"name": "mirrored"}})
            };
            calls.push((method, path));
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&body).expect("response body")))
                    .expect("response"),
            );
        }
        calls
    })
}
