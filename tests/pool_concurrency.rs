/// Connection Pool Concurrency Stress Tests
///
/// Many tasks checking connections in and out against a handful of local upstreams.

use sockpool::{ConnectionPool, PoolConfig, Reactor, SocketConnector};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

async fn spawn_echo_servers(count: usize) -> Vec<String> {
    let mut servers = Vec::new();
    for _ in 0..count {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        servers.push(format!("tcp://{}", listener.local_addr().unwrap()));

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4];
                    while stream.read_exact(&mut buf).await.is_ok() {
                        if stream.write_all(&buf).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
    }
    servers
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checkouts_never_share_a_connection() {
    let pool = ConnectionPool::new(SocketConnector, Reactor::new(), PoolConfig::default());
    let servers = spawn_echo_servers(3).await;

    let mut tasks = Vec::new();
    for i in 0..60 {
        let pool = pool.clone();
        let uri = servers[i % servers.len()].clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                let socket = pool.checkout(&uri, None).await.unwrap();
                tokio::task::yield_now().await;
                pool.checkin(socket).unwrap();
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.destinations, servers.len());
    assert_eq!(stats.idle as u64, stats.opened);
    // Each task holds at most one connection at a time.
    assert!(stats.opened <= 60);
}

#[tokio::test]
#[ignore] // Stress test - run with --ignored
async fn pool_handles_hundreds_of_checkout_cycles() {
    let pool = ConnectionPool::new(SocketConnector, Reactor::new(), PoolConfig::default());
    let servers = spawn_echo_servers(5).await;

    let start = Instant::now();
    let mut tasks = Vec::new();

    for i in 0..500 {
        let pool = pool.clone();
        let uri = servers[i % servers.len()].clone();

        tasks.push(tokio::spawn(async move {
            let socket = pool.checkout(&uri, None).await?;

            // Simulate usage
            tokio::time::sleep(tokio::time::Duration::from_micros(100)).await;

            pool.checkin(socket)
        }));
    }

    let mut completed = 0;
    for task in tasks {
        if matches!(task.await, Ok(Ok(()))) {
            completed += 1;
        }
    }

    let elapsed = start.elapsed();

    println!("=== Checkout/Checkin Cycle Test ===");
    println!("Total cycles: 500");
    println!("Completed: {}", completed);
    println!("Elapsed: {:?}", elapsed);
    println!("Throughput: {:.2} ops/sec", 500.0 / elapsed.as_secs_f64());

    assert!(completed > 480, "Should complete >96% of cycles");

    let stats = pool.stats();
    println!(
        "Pool stats: {} idle in {} destinations, {} opened",
        stats.idle, stats.destinations, stats.opened
    );
    assert_eq!(stats.in_use, 0);
}
