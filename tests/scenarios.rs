//! End-to-end scenarios exercising the public API across subsystems.

use std::time::{Duration, Instant};

use pmlib::archive::{ArchiveLabel, ArchiveMeta, ArchiveWriter, RawIndom, RawInstance};
use pmlib::desc::{Descriptor, MetricType, Semantics};
use pmlib::error::Error;
use pmlib::ident::{IndomId, MetricId, INST_NULL};
use pmlib::pdu::transport::{frame_len, new_frame, seal, Link};
use pmlib::pdu::{self, PduStream, PduType, SizeLimit, Wait};
use pmlib::profile::{IndomProfile, Profile, ProfileState};
use pmlib::result::{FetchResult, FetchValue, ValueSet, WireValue};
use pmlib::timestamp::Timestamp;
use pmlib::units::{TimeScale, Units};
use pmlib::value::Value;
use pmlib::{CachedMetadata, Context};

use bytes::BufMut;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

async fn stream_pair() -> (PduStream, PduStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (
        PduStream::new(Link::from(client)),
        PduStream::new(Link::from(server)),
    )
}

/// S1: profile encoding, exact frame size and caller-ordered instances.
#[tokio::test]
async fn s1_profile_encode() {
    let mut profile = Profile::default();
    profile.entries.push(IndomProfile {
        indom: IndomId(0x4000_0001),
        state: ProfileState::ExcludeAll,
        instances: vec![3, 7, 1],
    });
    let frame = pdu::profile::encode(1, 0, &profile);
    assert_eq!(frame_len(&frame), 56);

    let (mut tx, mut rx) = stream_pair().await;
    tx.send(&frame).await.unwrap();
    let got = rx.recv(SizeLimit::Any, Wait::Default).await.unwrap().unwrap();
    assert_eq!(got.typed(), Some(PduType::Profile));
    let (_, decoded) = pdu::profile::decode(&got).unwrap();
    assert_eq!(decoded.entries[0].instances, vec![3, 7, 1]);
    assert_eq!(decoded, profile);
}

/// S2: an instance response whose entries are all null flattens both
/// columns at the receiver.
#[tokio::test]
async fn s2_instance_all_null_flattening() {
    let names = vec![String::new(), String::new(), String::new()];
    let frame = pdu::instance::encode_reply(1, IndomId(0x4000_0001), None, Some(&names));
    // header, indom + count, then only the three 8-byte preambles
    assert_eq!(frame_len(&frame), 12 + 8 + 3 * 8);

    let (mut tx, mut rx) = stream_pair().await;
    tx.send(&frame).await.unwrap();
    let got = rx.recv(SizeLimit::Any, Wait::Default).await.unwrap().unwrap();
    let reply = pdu::instance::decode_reply(&got).unwrap();
    assert_eq!(reply.count, 3);
    assert!(reply.instances.is_none());
    assert!(reply.names.is_none());
}

/// S3: delta-indom reconstruction through the archive store.
#[test]
fn s3_indom_delta_reconstruction() {
    let indom = IndomId::new(60, 1);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.meta");

    let label = ArchiveLabel {
        version: 3,
        pid: 1,
        start: Timestamp::new(0, 0),
        hostname: "host".to_string(),
        timezone: "UTC".to_string(),
    };
    let mut writer = ArchiveWriter::create(&path, &label).unwrap();
    writer
        .put_desc(
            &Descriptor {
                pmid: MetricId::new(60, 0, 1),
                typ: MetricType::U32,
                indom,
                sem: Semantics::Instant,
                units: Units::NONE,
            },
            &["disk.dev.reads".to_string()],
        )
        .unwrap();
    let named = |inst, name: &str| RawInstance {
        inst,
        name: Some(name.to_string()),
    };
    writer
        .put_indom(
            &RawIndom {
                indom,
                stamp: Timestamp::new(1, 0),
                instances: vec![named(1, "a"), named(2, "b"), named(3, "c")],
            },
            true,
        )
        .unwrap();
    writer
        .put_indom_delta(&RawIndom {
            indom,
            stamp: Timestamp::new(2, 0),
            instances: vec![
                RawInstance {
                    inst: 2,
                    name: None,
                },
                named(4, "d"),
            ],
        })
        .unwrap();
    writer.finish().unwrap();

    let mut meta = ArchiveMeta::open(&path).unwrap();
    let (insts, names) = meta.get_indom(indom, Some(Timestamp::new(2, 0))).unwrap();
    assert_eq!(insts, vec![1, 3, 4]);
    assert_eq!(names, vec!["a", "c", "d"]);
}

const COUNTER: MetricId = MetricId(0x0100_0001);

fn counter_desc() -> Descriptor {
    Descriptor {
        pmid: COUNTER,
        typ: MetricType::U64,
        indom: IndomId::NULL,
        sem: Semantics::Counter,
        units: Units::time(TimeScale::Sec),
    }
}

async fn serve_counter_fetches(mut server: PduStream, samples: Vec<(i64, u64)>) {
    let profile = server
        .recv(SizeLimit::Any, Wait::Default)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(profile.typed(), Some(PduType::Profile));
    for (sec, counter) in samples {
        let fetch = server
            .recv(SizeLimit::Any, Wait::Default)
            .await
            .unwrap()
            .unwrap();
        let (_, ids) = pdu::idlist::decode_fetch(&fetch).unwrap();
        let mut result = FetchResult::new(Timestamp::new(sec, 0));
        for pmid in ids {
            if pmid == COUNTER {
                result.vsets.push(ValueSet {
                    pmid,
                    values: Ok(vec![FetchValue {
                        inst: INST_NULL,
                        value: WireValue::from_value(&Value::U64(counter)).unwrap(),
                    }]),
                });
            } else {
                result
                    .vsets
                    .push(ValueSet::error(pmid, Error::NoSuchMetric.code()));
            }
        }
        server.send(&pdu::result::encode(0, &result)).await.unwrap();
    }
}

/// S4: rate() over a time-dimensioned counter comes out dimensionless
/// with magnitude delta / delta-t.
#[tokio::test]
async fn s4_rate_computation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    let task = tokio::spawn(serve_counter_fetches(
        PduStream::new(Link::from(server)),
        vec![(0, 100), (2, 300)],
    ));

    let mut ctx = Context::from_stream(PduStream::new(Link::from(client)));
    ctx.metadata_mut().insert_desc(counter_desc());
    ctx.metadata_mut().insert_name("cpu.busy", COUNTER);
    let rate = ctx.register_derived("cpu.busy.rate", "rate(cpu.busy)").unwrap();

    let first = ctx.fetch(&[rate]).await.unwrap();
    assert_eq!(first.vsets[0].values.as_ref().unwrap().len(), 0);

    let second = ctx.fetch(&[rate]).await.unwrap();
    let values = second.vsets[0].values.as_ref().unwrap();
    assert_eq!(values.len(), 1);
    match &values[0].value {
        WireValue::Block(block) => {
            assert_eq!(block.to_value().unwrap(), Value::Double(100.0));
        }
        other => panic!("expected a value block, got {:?}", other),
    }
    task.await.unwrap();
}

/// S5: count() maps a child error to the literal value zero.
#[tokio::test]
async fn s5_count_tolerates_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();

    let task = tokio::spawn(async move {
        let mut server = PduStream::new(Link::from(server));
        let _profile = server.recv(SizeLimit::Any, Wait::Default).await.unwrap();
        let fetch = server
            .recv(SizeLimit::Any, Wait::Default)
            .await
            .unwrap()
            .unwrap();
        let (_, ids) = pdu::idlist::decode_fetch(&fetch).unwrap();
        let mut result = FetchResult::new(Timestamp::new(5, 0));
        for pmid in ids {
            result
                .vsets
                .push(ValueSet::error(pmid, Error::NoSuchInstanceLog.code()));
        }
        server.send(&pdu::result::encode(0, &result)).await.unwrap();
    });

    let mut ctx = Context::from_stream(PduStream::new(Link::from(client)));
    ctx.metadata_mut().insert_desc(counter_desc());
    ctx.metadata_mut().insert_name("cpu.busy", COUNTER);
    let n = ctx.register_derived("cpu.busy.count", "count(cpu.busy)").unwrap();

    let result = ctx.fetch(&[n]).await.unwrap();
    let values = result.vsets[0].values.as_ref().unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].value, WireValue::Insitu(0));
    task.await.unwrap();
}

/// S6: an oversized frame is rejected in limited mode without reading
/// its body.
#[tokio::test]
async fn s6_oversize_rejection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    let mut server = PduStream::new(Link::from(server));

    let mut header = Vec::new();
    header.put_u32(70_000);
    header.put_u32(PduType::Result as u32);
    header.put_u32(0);
    client.write_all(&header).await.unwrap();
    client.flush().await.unwrap();

    let err = server
        .recv(SizeLimit::Limited, Wait::Default)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TooBig(70_000)));
}

/// Framing round-trip across every typed codec.
#[tokio::test]
async fn framing_round_trips() {
    let (mut tx, mut rx) = stream_pair().await;

    let frames: Vec<bytes::BytesMut> = vec![
        pdu::desc::encode_req(1, MetricId::new(60, 0, 2)),
        pdu::desc::encode_desc(1, &counter_desc()),
        pdu::desc::encode_error(1, Error::Timeout.code()),
        pdu::text::encode_req(1, 77, pdu::text::TEXT_HELP | pdu::text::TEXT_PMID),
        pdu::text::encode_reply(1, 77, "some help"),
        pdu::idlist::encode_pmns_ids(1, 0, &[MetricId::new(1, 2, 3)]),
        pdu::creds::encode(1, &[pdu::creds::Credential::version(2, 0x5)]),
        pdu::auth::encode_auth(1, b"plain\0x").unwrap(),
        pdu::auth::encode_attr(1, pdu::auth::Attr::UserId, b"1000").unwrap(),
    ];
    let count = frames.len();
    let task = tokio::spawn(async move {
        for frame in frames {
            tx.send(&frame).await.unwrap();
        }
        tx
    });
    for _ in 0..count {
        let got = rx.recv(SizeLimit::Any, Wait::Default).await.unwrap().unwrap();
        assert!(got.typed().is_some());
        // declared length equals the received byte count
        assert_eq!(frame_len(&got.buf), got.buf.len());
    }
    task.await.unwrap();
}

/// Regex instance filtering with usage-count garbage collection stays
/// correct across repeated evaluations (the eviction property).
#[tokio::test]
async fn regex_filter_across_many_fetches() {
    let indom = IndomId::new(9, 9);
    let gauge = MetricId::new(9, 0, 1);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();

    let rounds = 20usize;
    let task = tokio::spawn(async move {
        let mut server = PduStream::new(Link::from(server));
        let _profile = server.recv(SizeLimit::Any, Wait::Default).await.unwrap();
        for round in 0..rounds {
            let fetch = server
                .recv(SizeLimit::Any, Wait::Default)
                .await
                .unwrap()
                .unwrap();
            let (_, ids) = pdu::idlist::decode_fetch(&fetch).unwrap();
            let mut result = FetchResult::new(Timestamp::new(round as i64, 0));
            for pmid in ids {
                if pmid == gauge {
                    result.vsets.push(ValueSet {
                        pmid,
                        values: Ok(vec![
                            FetchValue {
                                inst: 1,
                                value: WireValue::Insitu(10),
                            },
                            FetchValue {
                                inst: 2,
                                value: WireValue::Insitu(20),
                            },
                        ]),
                    });
                } else {
                    result
                        .vsets
                        .push(ValueSet::error(pmid, Error::NoSuchMetric.code()));
                }
            }
            server.send(&pdu::result::encode(0, &result)).await.unwrap();
        }
    });

    let mut ctx = Context::from_stream(PduStream::new(Link::from(client)));
    ctx.metadata_mut().insert_desc(Descriptor {
        pmid: gauge,
        typ: MetricType::I32,
        indom,
        sem: Semantics::Instant,
        units: Units::NONE,
    });
    ctx.metadata_mut().insert_name("net.if.octets", gauge);
    ctx.metadata_mut()
        .insert_indom(indom, vec![(1, "eth0".to_string()), (2, "lo".to_string())]);
    let filtered = ctx
        .register_derived("net.eth.octets", "matchinst(/^eth/, net.if.octets)")
        .unwrap();

    for _ in 0..rounds {
        let result = ctx.fetch(&[filtered]).await.unwrap();
        let values = result.vsets[0].values.as_ref().unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].inst, 1);
    }
    task.await.unwrap();
}

/// Request-port bind retry: a conflicting listener makes the open fail
/// only after the four spaced attempts.
#[tokio::test]
async fn bind_retry_spacing() {
    use pmlib::server::ports::{PortConfig, RequestPorts, LOOPBACK};

    let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = holder.local_addr().unwrap().port();

    let config = PortConfig {
        addresses: vec![LOOPBACK.to_string()],
        ports: vec![port],
        backlog: 5,
        ..Default::default()
    };
    let start = Instant::now();
    let outcome = RequestPorts::open(&config, None).await;
    // the v4 family retries four times at 250ms spacing before giving
    // up, whatever the v6 outcome
    assert!(start.elapsed() >= Duration::from_millis(750));
    if let Ok(ports) = outcome {
        ports.shutdown(None);
    }
}

/// Discovery workers observe the interrupt flag promptly.
#[tokio::test]
async fn discovery_interruption() {
    use pmlib::discover::{subnet_probe, subnet::SubnetOptions, DiscoveryOptions};
    use std::sync::atomic::Ordering;

    std::env::set_var("PMPROBETEST_PORT", "44321");
    let options = DiscoveryOptions {
        max_workers: 4,
        ..Default::default()
    };
    options.interrupted.store(true, Ordering::Relaxed);
    let subnet = SubnetOptions::parse("probe=10.254.0.0/24").unwrap();
    let start = Instant::now();
    let urls = subnet_probe("pmprobetest", &subnet, &options).await.unwrap();
    assert!(urls.is_empty());
    assert!(start.elapsed() < Duration::from_secs(2));
    std::env::remove_var("PMPROBETEST_PORT");
}

/// Derived metrics that mix scalar and instance operands broadcast the
/// scalar across the instances.
#[test]
fn scalar_broadcast_in_expressions() {
    let indom = IndomId::new(7, 7);
    let gauge = MetricId::new(7, 0, 1);
    let mut meta = CachedMetadata::new();
    meta.insert_desc(Descriptor {
        pmid: gauge,
        typ: MetricType::I32,
        indom,
        sem: Semantics::Instant,
        units: Units::NONE,
    });
    meta.insert_name("mem.per_node", gauge);

    let mut registry = pmlib::deriv::DerivedRegistry::new();
    let derived = registry.register("mem.scaled", "mem.per_node * 3").unwrap();
    let list = registry.prefetch(&meta, &[derived]).unwrap();
    assert_eq!(list, vec![derived, gauge]);

    let mut input = FetchResult::new(Timestamp::new(1, 0));
    input.vsets.push(ValueSet::error(derived, -1));
    input.vsets.push(ValueSet {
        pmid: gauge,
        values: Ok(vec![
            FetchValue {
                inst: 0,
                value: WireValue::Insitu(5),
            },
            FetchValue {
                inst: 1,
                value: WireValue::Insitu(7),
            },
        ]),
    });
    let out = registry.postfetch(&meta, input);
    let values = out.vsets[0].values.as_ref().unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(values[0].value, WireValue::Insitu(15));
    assert_eq!(values[1].value, WireValue::Insitu(21));
    assert_eq!(values[1].inst, 1);
}

/// A sealed frame built with the transport helpers is well-formed.
#[test]
fn frame_builder_invariants() {
    let mut frame = new_frame(PduType::TextReq, 3);
    frame.put_u32(1);
    frame.put_u32(2);
    seal(&mut frame);
    assert_eq!(frame_len(&frame), frame.len());
    assert_eq!(frame.len(), 20);
}
