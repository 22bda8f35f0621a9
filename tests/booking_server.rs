use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};

use fleetbook::clock::{Clock, SystemClock};
use fleetbook::engine::Engine;
use fleetbook::model::Ms;
use fleetbook::server;

const H: Ms = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

fn journal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("fleetbook_int_test_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{name}.journal"));
    let _ = std::fs::remove_file(&path);
    path
}

/// Start of tomorrow's first whole hour, so every booking is in the future.
fn tomorrow() -> Ms {
    let now = SystemClock.now_ms();
    (now / H + 24) * H
}

struct TestServer {
    addr: SocketAddr,
    accept: JoinHandle<()>,
}

async fn start_test_server(engine: Arc<Engine>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = server::process_connection(socket, engine).await;
            });
        }
    });

    TestServer { addr, accept }
}

async fn open_engine(path: &Path) -> Arc<Engine> {
    Arc::new(Engine::open(path, Arc::new(SystemClock)).unwrap())
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(stream, LinesCodec::new()),
        }
    }

    async fn call(&mut self, sql: &str) -> Value {
        self.framed.send(sql).await.unwrap();
        let line = self.framed.next().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_lifecycle_over_tcp() {
    let engine = open_engine(&journal_path("lifecycle")).await;
    let srv = start_test_server(engine).await;
    let mut client = Client::connect(srv.addr).await;
    let t = tomorrow();

    let reply = client
        .call("INSERT INTO vehicles VALUES (1, 'Toyota', 'Corolla', 'SBA1234A')")
        .await;
    assert_eq!(reply["status"], "ok");
    assert_eq!(reply["id"], 1);

    let first = client
        .call(&format!("INSERT INTO bookings VALUES (1, 100, {}, {})", t + 10 * H, t + 12 * H))
        .await;
    assert_eq!(first["tag"], "INSERT");
    let first_id = first["id"].as_u64().unwrap();

    // Back-to-back is fine.
    let second = client
        .call(&format!("INSERT INTO bookings VALUES (1, 200, {}, {})", t + 12 * H, t + 14 * H))
        .await;
    assert_eq!(second["status"], "ok");
    let second_id = second["id"].as_u64().unwrap();

    let clash = client
        .call(&format!("INSERT INTO bookings VALUES (1, 300, {}, {})", t + 11 * H, t + 13 * H))
        .await;
    assert_eq!(clash["status"], "error");
    assert_eq!(clash["code"], "booking_conflict");
    assert_eq!(clash["conflict"]["booking_id"], first_id);
    assert_eq!(clash["conflict"]["start"], t + 10 * H);
    assert_eq!(clash["conflict"]["end"], t + 12 * H);

    // Moving the second booking onto the first is rejected, moving it later is not.
    let moved = client
        .call(&format!(
            "UPDATE bookings SET start_time = {}, end_time = {} WHERE id = {second_id}",
            t + 11 * H,
            t + 13 * H
        ))
        .await;
    assert_eq!(moved["code"], "booking_conflict");
    let moved = client
        .call(&format!(
            "UPDATE bookings SET start_time = {}, end_time = {} WHERE id = {second_id}",
            t + 15 * H,
            t + 16 * H
        ))
        .await;
    assert_eq!(moved["tag"], "UPDATE");

    let canceled = client
        .call(&format!("DELETE FROM bookings WHERE id = {first_id}"))
        .await;
    assert_eq!(canceled["outcome"], "canceled");
    let again = client
        .call(&format!("DELETE FROM bookings WHERE id = {first_id}"))
        .await;
    assert_eq!(again["outcome"], "already_canceled");

    let active = client
        .call("SELECT * FROM bookings WHERE vehicle_id = 1 AND status = 'active'")
        .await;
    assert_eq!(active["rows"], 1);
    assert_eq!(active["data"][0]["status"], "modified");

    let history = client.call("SELECT * FROM rental_history WHERE user_id = 100").await;
    assert_eq!(history["rows"], 1);
    assert_eq!(history["data"][0]["status"], "canceled");
    assert_eq!(history["data"][0]["registration"], "SBA1234A");

    let vehicles = client.call("SELECT * FROM vehicles WHERE is_available = true").await;
    assert_eq!(vehicles["rows"], 1);

    srv.accept.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_clients_get_one_booking() {
    let engine = open_engine(&journal_path("race")).await;
    let srv = start_test_server(engine.clone()).await;
    let t = tomorrow();

    let mut setup = Client::connect(srv.addr).await;
    setup
        .call("INSERT INTO vehicles VALUES (7, 'Tesla', 'Model Y', 'SMY7')")
        .await;

    let mut handles = Vec::new();
    for user in 0..16u64 {
        let addr = srv.addr;
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            client
                .call(&format!(
                    "INSERT INTO bookings VALUES (7, {user}, {}, {})",
                    t + 9 * H,
                    t + 11 * H
                ))
                .await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for handle in handles {
        let reply = handle.await.unwrap();
        match reply["status"].as_str() {
            Some("ok") => ok += 1,
            _ => {
                assert_eq!(reply["code"], "booking_conflict");
                conflicts += 1;
            }
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 15);

    let rows = setup.call("SELECT * FROM bookings WHERE vehicle_id = 7").await;
    assert_eq!(rows["rows"], 1);

    srv.accept.abort();
}

#[tokio::test]
async fn bookings_survive_restart() {
    let path = journal_path("restart");
    let t = tomorrow();

    let booking_id = {
        let srv = start_test_server(open_engine(&path).await).await;
        let mut client = Client::connect(srv.addr).await;
        client
            .call("INSERT INTO vehicles VALUES (3, 'Hyundai', 'Ioniq', 'SKH3')")
            .await;
        let reply = client
            .call(&format!("INSERT INTO bookings VALUES (3, 42, {}, {})", t + H, t + 2 * H))
            .await;
        srv.accept.abort();
        reply["id"].as_u64().unwrap()
    };

    let srv = start_test_server(open_engine(&path).await).await;
    let mut client = Client::connect(srv.addr).await;

    let rows = client.call("SELECT * FROM bookings WHERE user_id = 42").await;
    assert_eq!(rows["rows"], 1);
    assert_eq!(rows["data"][0]["id"], booking_id);

    let clash = client
        .call(&format!("INSERT INTO bookings VALUES (3, 43, {}, {})", t + H, t + 2 * H))
        .await;
    assert_eq!(clash["code"], "booking_conflict");

    let dup = client
        .call("INSERT INTO vehicles VALUES (3, 'Hyundai', 'Kona', 'SKH4')")
        .await;
    assert_eq!(dup["code"], "already_exists");

    srv.accept.abort();
}

#[tokio::test]
async fn bad_statements_keep_the_connection() {
    let engine = open_engine(&journal_path("bad_statements")).await;
    let srv = start_test_server(engine).await;
    let mut client = Client::connect(srv.addr).await;

    let reply = client.call("SELECT * FROM bookings").await;
    assert_eq!(reply["code"], "syntax_error");
    let reply = client.call("DROP TABLE bookings").await;
    assert_eq!(reply["code"], "syntax_error");
    let reply = client
        .call("INSERT INTO bookings VALUES (99, 1, 1000, 2000)")
        .await;
    assert_eq!(reply["code"], "invalid_interval");
    let reply = client.call("SELECT * FROM vehicles").await;
    assert_eq!(reply["rows"], 0);

    srv.accept.abort();
}
