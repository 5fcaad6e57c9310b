//! Storage coordinator tests against scripted SCP peers.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use dicomnet_core::tag::tags;
use dicomnet_storage::config::StorageConfig;
use dicomnet_storage::coordinator::{ClientOptions, StorageClient};
use dicomnet_storage::pool::{SelectionStrategy, ServerPool, ServerSpec};
use dicomnet_storage::queue::{QueueConfig, StoreQueue};
use dicomnet_storage::retry::RetryPolicy;
use dicomnet_storage::Error;
use dicomnet_ul::command::{CommandSet, NO_DATA_SET};
use dicomnet_ul::pdu::{
    read_pdu, write_pdu, AssociationAC, AssociationRJ, AssociationRJResult,
    AssociationRJServiceUserReason, AssociationRJSource, PDataValue, PDataValueType, Pdu,
    PresentationContextResult, PresentationContextResultReason, UserVariableItem,
    DEFAULT_MAX_PDU,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

fn instance_payload(sop_instance_uid: &str) -> Vec<u8> {
    // file meta group + an arbitrary body
    let mut data = build_file_meta(
        CT_IMAGE_STORAGE,
        sop_instance_uid,
        dicomnet_core::uids::EXPLICIT_VR_LITTLE_ENDIAN,
    );
    data.extend_from_slice(&[0xAB; 2_000]);
    data
}

fn build_file_meta(
    sop_class_uid: &str,
    sop_instance_uid: &str,
    transfer_syntax_uid: &str,
) -> Vec<u8> {
    fn element(out: &mut Vec<u8>, group: u16, elem: u16, vr: &[u8; 2], value: &[u8]) {
        let mut value = value.to_vec();
        if value.len() % 2 != 0 {
            value.push(0);
        }
        out.extend_from_slice(&group.to_le_bytes());
        out.extend_from_slice(&elem.to_le_bytes());
        out.extend_from_slice(vr);
        out.extend_from_slice(&(value.len() as u16).to_le_bytes());
        out.extend_from_slice(&value);
    }

    let mut group = Vec::new();
    element(&mut group, 0x0002, 0x0002, b"UI", sop_class_uid.as_bytes());
    element(
        &mut group,
        0x0002,
        0x0003,
        b"UI",
        sop_instance_uid.as_bytes(),
    );
    element(
        &mut group,
        0x0002,
        0x0010,
        b"UI",
        transfer_syntax_uid.as_bytes(),
    );

    let mut out = vec![0u8; 128];
    out.extend_from_slice(b"DICM");
    element(
        &mut out,
        0x0002,
        0x0000,
        b"UL",
        &(group.len() as u32).to_le_bytes(),
    );
    out.extend_from_slice(&group);
    out
}

/// Accept the association and serve `count` C-STOREs with the
/// given status, then release.
fn scripted_store_scp(
    stream: &mut TcpStream,
    count: usize,
    status: u16,
) -> Result<()> {
    let pdu = read_pdu(stream, DEFAULT_MAX_PDU, true)?.expect("expected A-ASSOCIATE-RQ");
    let Pdu::AssociationRQ(rq) = pdu else {
        panic!("expected A-ASSOCIATE-RQ");
    };
    let presentation_contexts = rq
        .presentation_contexts
        .iter()
        .map(|pc| PresentationContextResult {
            id: pc.id,
            reason: PresentationContextResultReason::Acceptance,
            transfer_syntax: pc.transfer_syntaxes[0].clone(),
        })
        .collect();
    let ac = AssociationAC {
        protocol_version: 1,
        called_ae_title: rq.called_ae_title,
        calling_ae_title: rq.calling_ae_title,
        application_context_name: rq.application_context_name,
        presentation_contexts,
        user_variables: vec![UserVariableItem::MaxLength(DEFAULT_MAX_PDU)],
    };
    write_pdu(stream, &ac.into())?;

    for _ in 0..count {
        let mut assembler = dicomnet_ul::pdata::MessageAssembler::new();
        let message = 'message: loop {
            let pdu = read_pdu(stream, DEFAULT_MAX_PDU, true)?.expect("peer closed");
            let Pdu::PData { data } = pdu else {
                panic!("expected P-DATA-TF");
            };
            for pdv in data {
                if let Some(message) = assembler.push(pdv)? {
                    break 'message message;
                }
            }
        };
        let mut rsp = CommandSet::new();
        rsp.put_u16(tags::COMMAND_FIELD, 0x8001);
        rsp.put_u16(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            message.command.message_id()?,
        );
        rsp.put_u16(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET);
        rsp.put_u16(tags::STATUS, status);
        write_pdu(
            stream,
            &Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: message.presentation_context_id,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: rsp.encode(),
                }],
            },
        )?;
    }

    let pdu = read_pdu(stream, DEFAULT_MAX_PDU, true)?.unwrap();
    assert_eq!(pdu, Pdu::ReleaseRQ);
    write_pdu(stream, &Pdu::ReleaseRP)?;
    Ok(())
}

fn spawn_store_scp(count: usize, status: u16) -> (std::thread::JoinHandle<Result<()>>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || -> Result<()> {
        for _ in 0..count {
            let (mut stream, _) = listener.accept()?;
            scripted_store_scp(&mut stream, 1, status)?;
        }
        Ok(())
    });
    (handle, addr)
}

fn client_options() -> ClientOptions {
    ClientOptions {
        calling_ae_title: "STORE-SCU".to_string(),
        connect_timeout: Some(Duration::from_secs(2)),
        read_timeout: Some(Duration::from_secs(5)),
        write_timeout: Some(Duration::from_secs(5)),
        operation_timeout: None,
        association_timeout: Duration::from_secs(5),
        max_pdu_length: DEFAULT_MAX_PDU,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_delivers_through_a_single_server() {
    let (scp, addr) = spawn_store_scp(1, 0x0000);

    let pool = Arc::new(ServerPool::new(
        SelectionStrategy::Priority,
        5,
        Duration::from_secs(30),
    ));
    pool.add(ServerSpec::new(addr.ip().to_string(), addr.port(), "PACS1"));

    let client = StorageClient::new(pool, client_options());
    let report = client.store(instance_payload("1.2.3.4.1")).await.unwrap();

    assert_eq!(report.status, 0x0000);
    assert_eq!(report.retries, 0);
    assert!(!report.used_failover);
    assert_eq!(report.called_ae_title, "PACS1");

    scp.join().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_skips_server_with_open_breaker_and_fails_over() {
    // server A must never see a connection
    let listener_a = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr_a = listener_a.local_addr().unwrap();
    listener_a.set_nonblocking(true).unwrap();

    let (scp_b, addr_b) = spawn_store_scp(1, 0x0000);

    let pool = Arc::new(ServerPool::new(
        SelectionStrategy::Priority,
        5,
        Duration::from_secs(30),
    ));
    let server_a = pool.add(
        ServerSpec::new(addr_a.ip().to_string(), addr_a.port(), "PACS-A").priority(10),
    );
    let server_b = pool.add(
        ServerSpec::new(addr_b.ip().to_string(), addr_b.port(), "PACS-B").priority(5),
    );

    // A's breaker is open before the call
    pool.breaker(server_a).unwrap().trip();

    let client = StorageClient::new(Arc::clone(&pool), client_options());
    let report = client.store(instance_payload("1.2.3.4.2")).await.unwrap();

    assert_eq!(report.server, server_b);
    assert_eq!(report.called_ae_title, "PACS-B");
    assert_eq!(report.retries, 0);
    assert!(report.used_failover);

    // no transport was ever opened towards A
    match listener_a.accept() {
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        other => panic!("server A saw a connection: {:?}", other),
    }

    scp_b.join().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_fails_over_after_rejections() {
    // server A rejects the association permanently?
    // no: a transient rejection is retryable and exhausts retries,
    // then the coordinator moves on to server B
    let listener_a = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr_a = listener_a.local_addr().unwrap();
    let scp_a = std::thread::spawn(move || -> Result<()> {
        // one rejection per configured attempt
        for _ in 0..2 {
            let (mut stream, _) = listener_a.accept()?;
            let _ = read_pdu(&mut stream, DEFAULT_MAX_PDU, true)?;
            let rj = AssociationRJ {
                result: AssociationRJResult::Transient,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::NoReasonGiven,
                ),
            };
            write_pdu(&mut stream, &rj.into())?;
        }
        Ok(())
    });

    let (scp_b, addr_b) = spawn_store_scp(1, 0x0000);

    let pool = Arc::new(ServerPool::new(
        SelectionStrategy::Priority,
        5,
        Duration::from_secs(30),
    ));
    pool.add(ServerSpec::new(addr_a.ip().to_string(), addr_a.port(), "PACS-A").priority(10));
    let server_b = pool.add(
        ServerSpec::new(addr_b.ip().to_string(), addr_b.port(), "PACS-B").priority(5),
    );

    let client = StorageClient::new(pool, client_options()).retry_policy(RetryPolicy {
        max_attempts: 2,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
        jitter: 0.0,
    });

    let report = client.store(instance_payload("1.2.3.4.3")).await.unwrap();
    assert_eq!(report.server, server_b);
    assert!(report.used_failover);

    scp_a.join().unwrap().unwrap();
    scp_b.join().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn all_servers_failing_is_reported() {
    let pool = Arc::new(ServerPool::new(
        SelectionStrategy::Priority,
        5,
        Duration::from_secs(30),
    ));
    let a = pool.add(ServerSpec::new("127.0.0.1", 1, "PACS-A"));
    let b = pool.add(ServerSpec::new("127.0.0.1", 1, "PACS-B"));
    pool.breaker(a).unwrap().trip();
    pool.breaker(b).unwrap().trip();

    let client = StorageClient::new(pool, client_options());
    let outcome = client.store(instance_payload("1.2.3.4.4")).await;
    assert!(matches!(
        outcome,
        Err(Error::AllServersFailed { attempted: 2 })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_failure_status_is_permanent() {
    let (scp, addr) = spawn_store_scp(1, 0xA700);

    let pool = Arc::new(ServerPool::new(
        SelectionStrategy::Priority,
        5,
        Duration::from_secs(30),
    ));
    pool.add(ServerSpec::new(addr.ip().to_string(), addr.port(), "PACS1"));

    let client = StorageClient::new(pool, client_options());
    let outcome = client.store(instance_payload("1.2.3.4.5")).await;
    assert!(matches!(outcome, Err(Error::StoreFailed { status: 0xA700 })));

    scp.join().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_drain_delivers_and_commits() {
    let (scp, addr) = spawn_store_scp(2, 0x0000);

    let pool = Arc::new(ServerPool::new(
        SelectionStrategy::Priority,
        5,
        Duration::from_secs(30),
    ));
    pool.add(ServerSpec::new(addr.ip().to_string(), addr.port(), "PACS1"));
    let client = StorageClient::new(pool, client_options());

    let dir = tempfile::tempdir().unwrap();
    let queue = StoreQueue::open(QueueConfig::new(dir.path())).unwrap();
    for uid in ["1.2.3.5.1", "1.2.3.5.2"] {
        queue
            .enqueue(
                CT_IMAGE_STORAGE,
                uid,
                dicomnet_core::uids::EXPLICIT_VR_LITTLE_ENDIAN,
                0,
                &instance_payload(uid),
            )
            .unwrap();
    }

    let delivered = queue.drain(&client).await.unwrap();
    assert_eq!(delivered, 2);
    assert!(queue.peek().unwrap().is_none());

    scp.join().unwrap().unwrap();
}

#[test]
fn configuration_builds_a_working_pool() {
    let config: StorageConfig = {
        let yaml = r#"
calling-ae-title: TEST-SCU
max-pdu-length: 16384
strategy: failover
timeouts:
  association-seconds: 10
retry:
  max-attempts: 2
  initial-delay-ms: 100
  max-delay-ms: 1000
  multiplier: 2.0
  jitter: 0.0
circuit-breaker:
  failure-threshold: 3
  reset-timeout-seconds: 10
servers:
  - host: pacs1.example.com
    port: 104
    called-ae-title: PACS1
    priority: 10
  - host: pacs2.example.com
    port: 104
    called-ae-title: PACS2
    priority: 5
"#;
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    };
    config.validate().unwrap();

    let pool = ServerPool::new(
        config.strategy,
        config.circuit_breaker.failure_threshold,
        Duration::from_secs(config.circuit_breaker.reset_timeout_seconds),
    );
    for server in &config.servers {
        pool.add(server.to_spec(config.max_pdu_length));
    }
    assert_eq!(pool.enabled_len(), 2);

    let (entry, _) = pool.select(&Default::default()).unwrap();
    assert_eq!(entry.called_ae_title, "PACS1");
}
