//! Send-token arbitration: FIFO fairness across competing acquirers and
//! idempotent release.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use fresco_core::{
    empty_node_frame, ConnectionDescription, LocalNode, LocalNodeConfig, Node, NodeCommand,
    NodeKind, TransportKind, TransportRegistry,
};

fn launch(registry: &Arc<TransportRegistry>, port: u16) -> Arc<LocalNode> {
    let mut config = LocalNodeConfig::default();
    config.transports = Arc::clone(registry);
    config.listen = vec![ConnectionDescription::new(
        TransportKind::Pipe,
        "node",
        port,
    )];
    let local = LocalNode::new(config);
    local.listen().unwrap();
    local
}

fn replica(of: &Arc<LocalNode>) -> Arc<Node> {
    Node::with_descriptions(of.id(), NodeKind::Node, of.self_node().descriptions())
}

#[test]
fn grants_are_fifo() {
    let registry = Arc::new(TransportRegistry::with_defaults());
    let holder = launch(&registry, 9201);
    let clients: Vec<Arc<LocalNode>> = (0..3)
        .map(|i| launch(&registry, 9210 + i))
        .collect();

    let handles: Vec<Arc<Node>> = clients
        .iter()
        .map(|client| client.connect_node(replica(&holder)).expect("connect"))
        .collect();

    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let mut workers = Vec::new();
    for (i, (client, handle)) in clients.iter().zip(&handles).enumerate() {
        let client = Arc::clone(client);
        let handle = Arc::clone(handle);
        let log = Arc::clone(&log);
        workers.push(thread::spawn(move || {
            // stagger the requests so arrival order is deterministic
            thread::sleep(Duration::from_millis(60 * i as u64));
            let token = client.acquire_send_token(&handle).expect("acquire");
            log.lock().unwrap().push(format!("grant-{i}"));
            thread::sleep(Duration::from_millis(120));
            log.lock().unwrap().push(format!("release-{i}"));
            client.release_send_token(token);
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    // grants complete in request-arrival order, each release before the
    // next grant fires
    let log = log.lock().unwrap().clone();
    assert_eq!(
        log,
        vec![
            "grant-0",
            "release-0",
            "grant-1",
            "release-1",
            "grant-2",
            "release-2",
        ]
    );

    for client in &clients {
        assert!(client.close());
    }
    assert!(holder.close());
}

#[test]
fn double_release_is_idempotent() {
    let registry = Arc::new(TransportRegistry::with_defaults());
    let holder = launch(&registry, 9221);
    let client = launch(&registry, 9222);
    let handle = client.connect_node(replica(&holder)).expect("connect");

    let token = client.acquire_send_token(&handle).expect("first acquire");
    client.release_send_token(token);

    // a stray second release must be a no-op on the holder
    handle
        .send(&empty_node_frame(NodeCommand::ReleaseSendToken))
        .unwrap();

    // the token is still grantable exactly once
    let token = client.acquire_send_token(&handle).expect("second acquire");
    client.release_send_token(token);

    assert!(client.close());
    assert!(holder.close());
}
