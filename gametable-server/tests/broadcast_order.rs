use gametable_client::Client;
use gametable_server as server;

/// Pull the next `count` body-bearing envelopes (Receipt or Peer) off a
/// connection, skipping membership traffic.
async fn next_bodies(client: &mut Client, count: usize) -> Vec<(u64, Vec<u8>)> {
    let mut out = Vec::new();
    while out.len() < count {
        let env = client
            .next()
            .await
            .unwrap()
            .expect("connection closed early");
        if let Some(body) = env.body() {
            out.push((env.num(), body.to_vec()));
        }
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_are_seen_in_one_order_by_everyone() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_task = tokio::spawn(async move {
        server::serve_incoming(listener).await.unwrap();
    });

    let mut a = Client::connect(&format!("ws://{}/g/three-way?id=a.1", addr))
        .await
        .unwrap();
    let _ = a.next().await.unwrap().expect("welcome for a");
    let mut b = Client::connect(&format!("ws://{}/g/three-way?id=b.2", addr))
        .await
        .unwrap();
    let _ = a.next().await.unwrap().expect("joiner b for a");
    let _ = b.next().await.unwrap().expect("welcome for b");
    let mut c = Client::connect(&format!("ws://{}/g/three-way?id=c.3", addr))
        .await
        .unwrap();
    let _ = a.next().await.unwrap().expect("joiner c for a");
    let _ = b.next().await.unwrap().expect("joiner c for b");
    let _ = c.next().await.unwrap().expect("welcome for c");

    // a and b send concurrently; the hub serializes them in whatever
    // order its queue observes.
    let (ra, rb) = tokio::join!(a.send(b"\"x\""), b.send(b"\"y\""));
    ra.unwrap();
    rb.unwrap();

    let seen_a = next_bodies(&mut a, 2).await;
    let seen_b = next_bodies(&mut b, 2).await;
    let seen_c = next_bodies(&mut c, 2).await;

    // Distinct consecutive nums for the two emissions.
    let nums: Vec<u64> = seen_c.iter().map(|(num, _)| *num).collect();
    assert_eq!(nums.len(), 2);
    assert_eq!(nums[1], nums[0] + 1);

    // Every client observes the same bodies in the same num order.
    assert_eq!(seen_a, seen_b);
    assert_eq!(seen_b, seen_c);

    server_task.abort();
}
