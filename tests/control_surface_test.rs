use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use plugin_host::{ContextBuilder, WorkerService, bind_shared};
use plugin_sdk::{
    Credentials, InProcessSpawner, LogLevelSwitch, Supervisor, SupervisorConfig,
    jsonrpc::{Id, Request, Response},
};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Notify,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(2);

/// Builder that blocks until released, counting invocations.
#[derive(Default)]
struct GatedBuilder {
    calls: Arc<AtomicUsize>,
    gate: Arc<Notify>,
}

#[async_trait]
impl ContextBuilder for GatedBuilder {
    type Context = Value;

    async fn build(&self, entity_id: &str, credentials: &Credentials) -> anyhow::Result<Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.gate.notified().await;
        Ok(json!({ "entity": entity_id, "build": n, "token": credentials.auth_token }))
    }
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
    next_id: i64,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            write,
            next_id: 0,
        }
    }

    async fn send(&mut self, method: &str, params: Value) -> i64 {
        self.next_id += 1;
        let req = Request::call(Id::Number(self.next_id), method, Some(params));
        let line = format!("{}\n", serde_json::to_string(&req).unwrap());
        self.write.write_all(line.as_bytes()).await.unwrap();
        self.next_id
    }

    async fn recv(&mut self) -> Response {
        let line = timeout(WAIT, self.lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn call(&mut self, method: &str, params: Value) -> Response {
        let id = self.send(method, params).await;
        let rsp = self.recv().await;
        assert_eq!(rsp.id, Id::Number(id));
        rsp
    }
}

#[tokio::test]
async fn init_on_one_worker_makes_the_whole_pool_ready() {
    let spawner = InProcessSpawner::default();
    let (supervisor, pool) = Supervisor::start(
        SupervisorConfig {
            workers: 2,
            ..SupervisorConfig::default()
        },
        spawner.clone(),
        LogLevelSwitch::default(),
    )
    .await;

    let mut addrs = Vec::new();
    for slot in 0..2 {
        let service = Arc::new(WorkerService::new(
            spawner.runtime(slot).unwrap(),
            GatedBuilder::default(),
            Duration::from_secs(60),
        ));
        let listener = bind_shared("127.0.0.1:0".parse().unwrap()).unwrap();
        addrs.push(listener.local_addr().unwrap());
        tokio::spawn(service.serve(listener, std::future::pending()));
    }

    let mut first = Client::connect(addrs[0]).await;
    let mut second = Client::connect(addrs[1]).await;

    let health = second.call("health", Value::Null).await.result.unwrap();
    assert_eq!(health["ready"], json!(false));

    let rsp = first
        .call("init", json!({"authToken": "t1", "workerId": "w1"}))
        .await;
    assert_eq!(rsp.result.unwrap(), json!({"ready": true}));

    timeout(WAIT, async {
        loop {
            let health = second.call("health", Value::Null).await.result.unwrap();
            if health["ready"] == json!(true) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    supervisor.shutdown().await;
    pool.await.unwrap().unwrap();
}

#[tokio::test]
async fn concurrent_context_calls_share_one_build() {
    let builder = GatedBuilder::default();
    let calls = Arc::clone(&builder.calls);
    let gate = Arc::clone(&builder.gate);

    let spawner = InProcessSpawner::default();
    let (supervisor, pool) =
        Supervisor::start(SupervisorConfig::default(), spawner.clone(), LogLevelSwitch::default())
            .await;
    let runtime = spawner.runtime(0).unwrap();
    runtime
        .on_credentials_received(Credentials::new("t1", "w1"))
        .unwrap();

    let service = Arc::new(WorkerService::new(runtime, builder, Duration::from_secs(60)));
    let listener = bind_shared("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&service).serve(listener, std::future::pending()));

    let mut clients = Vec::new();
    for _ in 0..4 {
        let mut c = Client::connect(addr).await;
        c.send("context", json!({"entityId": "creative-7168"})).await;
        clients.push(c);
    }

    // all four requests are parked on the same build
    timeout(WAIT, async {
        while service.cache().stats().hits < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    gate.notify_one();

    let replies = futures::future::join_all(clients.iter_mut().map(|c| c.recv())).await;
    for rsp in replies {
        let result = rsp.result.unwrap();
        assert_eq!(result["context"]["build"], json!(1));
        assert_eq!(result["context"]["token"], json!("t1"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    supervisor.shutdown().await;
    pool.await.unwrap().unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn workers_can_share_one_port() {
    let a = bind_shared("127.0.0.1:0".parse().unwrap()).unwrap();
    let port = a.local_addr().unwrap().port();
    let b = bind_shared(SocketAddr::from(([127, 0, 0, 1], port)));
    assert!(b.is_ok());
}
