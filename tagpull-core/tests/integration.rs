//! End-to-end engine tests: a scripted adapter plays back per-cycle
//! payloads while a captured sink records every emission, exercising the
//! full pull → decode → transform → dedup → emit pipeline the CLI drives.
//!
//! Time is paused; the scheduler's sleeps auto-advance, so loop-mode tests
//! see exact one-interval spacing between cycles.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tagpull_core::config::OutputKind;
use tagpull_core::decode::Decoder;
use tagpull_core::engine::Engine;
use tagpull_core::error::{Error, Result};
use tagpull_core::output::{LineOutput, Output};
use tagpull_core::pipeline::ProcessStep;
use tagpull_core::proto::{Adapter, Payload};
use tagpull_core::transform::{TransformChain, TransformSpec};

#[derive(Default)]
struct AdapterState {
    connects: usize,
    shutdowns: usize,
}

/// Plays back one payload per pull per cycle; fetches past the script fail
/// with a protocol error, which ends a loop-mode run.
struct ScriptedAdapter {
    cycles: Vec<Vec<Payload>>,
    fetches: Vec<usize>,
    state: Arc<Mutex<AdapterState>>,
    sink_marker: Option<Sink>,
    fail_connect_after: Option<usize>,
}

impl ScriptedAdapter {
    fn new(cycles: Vec<Vec<Payload>>, state: Arc<Mutex<AdapterState>>) -> Self {
        let pulls = cycles.first().map(Vec::len).unwrap_or(0);
        Self {
            cycles,
            fetches: vec![0; pulls],
            state,
            sink_marker: None,
            fail_connect_after: None,
        }
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if let Some(limit) = self.fail_connect_after {
            if state.connects > limit {
                return Err(Error::config("scripted connect limit reached"));
            }
        }
        Ok(())
    }

    async fn fetch(&mut self, pull: usize) -> Result<Payload> {
        let cycle = self.fetches[pull];
        self.fetches[pull] += 1;
        self.cycles
            .get(cycle)
            .and_then(|payloads| payloads.get(pull))
            .cloned()
            .ok_or_else(|| Error::proto("script exhausted"))
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state.lock().unwrap().shutdowns += 1;
        if let Some(sink) = &self.sink_marker {
            sink.push_marker("<<shutdown>>");
        }
        Ok(())
    }
}

/// Shared in-memory sink buffer.
#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl Sink {
    fn output(&self, kind: OutputKind) -> Arc<dyn Output> {
        colored::control::set_override(false);
        Arc::new(LineOutput::new(kind, None, Box::new(self.clone())))
    }

    fn push_marker(&self, marker: &str) {
        let mut buf = self.0.lock().unwrap();
        buf.extend_from_slice(marker.as_bytes());
        buf.push(b'\n');
    }

    fn lines(&self) -> Vec<String> {
        String::from_utf8(self.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn point(id: &str, decoder: Decoder, transform: &[TransformSpec]) -> ProcessStep {
    let chain = TransformChain::bind(id, transform, Some(decoder.data_type())).unwrap();
    ProcessStep::Point {
        id: id.to_string(),
        decoder,
        chain,
    }
}

fn engine_with(
    cycles: Vec<Vec<Payload>>,
    steps: Vec<Vec<ProcessStep>>,
    kind: OutputKind,
) -> (Engine, Sink, Arc<Mutex<AdapterState>>) {
    let sink = Sink::default();
    let state = Arc::new(Mutex::new(AdapterState::default()));
    let mut adapter = ScriptedAdapter::new(cycles, state.clone());
    adapter.sink_marker = Some(sink.clone());
    let engine = Engine::new(
        Duration::from_secs(1),
        0.0,
        Box::new(adapter),
        steps.into_iter().map(Arc::new).collect(),
        sink.output(kind),
    );
    (engine, sink, state)
}

fn data_lines(sink: &Sink) -> Vec<String> {
    sink.lines()
        .into_iter()
        .filter(|l| !l.is_empty() && l != "<<shutdown>>")
        .collect()
}

#[tokio::test(start_paused = true)]
async fn bit_decode_with_deduplication() {
    let (mut engine, sink, _) = engine_with(
        vec![
            vec![Payload::Registers(vec![0x0005])],
            vec![Payload::Registers(vec![0x0004])],
        ],
        vec![vec![
            point("d.a", Decoder::RegBit { offset: 0, bit: 0 }, &[]),
            point("d.b", Decoder::RegBit { offset: 0, bit: 2 }, &[]),
        ]],
        OutputKind::Text,
    );

    let err = engine.run(true, false).await.unwrap_err();
    assert!(matches!(err, Error::Proto(_)));
    // Second cycle only re-emits the bit that changed.
    assert_eq!(data_lines(&sink), vec!["d.a 1", "d.b 1", "d.a 0"]);
}

#[tokio::test(start_paused = true)]
async fn signed_int16_recovery() {
    let (mut engine, sink, _) = engine_with(
        vec![vec![Payload::Registers(vec![0xFFFE])]],
        vec![vec![point("s.level", Decoder::RegI16 { offset: 0 }, &[])]],
        OutputKind::Text,
    );

    engine.run(false, false).await.unwrap();
    assert_eq!(data_lines(&sink), vec!["s.level -2"]);
}

#[tokio::test(start_paused = true)]
async fn real32_from_register_pair() {
    let (mut engine, sink, _) = engine_with(
        vec![vec![Payload::Registers(vec![0x0FDB, 0x4049])]],
        vec![vec![point("s.pi", Decoder::RegF32 { offset: 0 }, &[])]],
        OutputKind::Text,
    );

    engine.run(false, false).await.unwrap();
    let lines = data_lines(&sink);
    assert_eq!(lines.len(), 1);
    let value: f64 = lines[0].strip_prefix("s.pi ").unwrap().parse().unwrap();
    assert!((value - 3.14159).abs() < 1e-4);
}

#[tokio::test(start_paused = true)]
async fn speed_over_uint32_wrap() {
    let (mut engine, sink, _) = engine_with(
        vec![
            // 4294967290, then 5 one second later: the counter wrapped.
            vec![Payload::Registers(vec![0xFFFF, 0xFFFA])],
            vec![Payload::Registers(vec![0x0000, 0x0005])],
        ],
        vec![vec![point(
            "c.rate",
            Decoder::RegU32 { offset: 0 },
            &[TransformSpec::Speed { interval: 1.0 }],
        )]],
        OutputKind::Text,
    );

    let _ = engine.run(true, false).await.unwrap_err();
    assert_eq!(data_lines(&sink), vec!["c.rate 0", "c.rate 10.0"]);
}

#[tokio::test(start_paused = true)]
async fn transform_chain_with_deduplication() {
    let chain = [
        TransformSpec::Divide { divisor: 10.0 },
        TransformSpec::Round { digits: 2 },
    ];
    let (mut engine, sink, _) = engine_with(
        vec![
            vec![Payload::Registers(vec![1000])],
            vec![Payload::Registers(vec![1005])],
            vec![Payload::Registers(vec![1005])],
        ],
        vec![vec![point("p.flow", Decoder::RegU16 { offset: 0 }, &chain)]],
        OutputKind::Text,
    );

    let _ = engine.run(true, false).await.unwrap_err();
    assert_eq!(data_lines(&sink), vec!["p.flow 100.0", "p.flow 100.5"]);
}

#[tokio::test(start_paused = true)]
async fn eva_datapuller_suffix_routing() {
    let (mut engine, sink, _) = engine_with(
        vec![vec![Payload::Registers(vec![215, 1])]],
        vec![vec![
            point(
                "sensor.temp.value",
                Decoder::RegU16 { offset: 0 },
                &[TransformSpec::Divide { divisor: 10.0 }],
            ),
            point("sensor.temp.status", Decoder::RegU16 { offset: 1 }, &[]),
        ]],
        OutputKind::EvaDatapuller,
    );

    engine.run(false, false).await.unwrap();
    assert_eq!(
        data_lines(&sink),
        vec!["sensor.temp u None 21.5", "sensor.temp u 1"]
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_runs_once_after_the_last_emission() {
    let (mut engine, sink, state) = engine_with(
        vec![vec![Payload::Registers(vec![7])]],
        vec![vec![point("s.a", Decoder::RegU16 { offset: 0 }, &[])]],
        OutputKind::Text,
    );

    engine.run(false, false).await.unwrap();

    assert_eq!(state.lock().unwrap().shutdowns, 1);
    let lines = sink.lines();
    // Every data line precedes the adapter-shutdown marker: the worker
    // drained before the transport was released.
    assert_eq!(lines.last().map(String::as_str), Some("<<shutdown>>"));
    assert_eq!(lines.iter().filter(|l| *l == "<<shutdown>>").count(), 1);
    assert_eq!(lines.first().map(String::as_str), Some("s.a 7"));
}

#[tokio::test(start_paused = true)]
async fn worker_death_fails_the_next_cycle() {
    // A register decoder bound to a bit payload makes the worker bail out;
    // the scheduler's liveness check must surface it.
    let (mut engine, _sink, _) = engine_with(
        vec![
            vec![Payload::Bits(vec![true])],
            vec![Payload::Bits(vec![true])],
        ],
        vec![vec![point("s.a", Decoder::RegU16 { offset: 0 }, &[])]],
        OutputKind::Text,
    );

    let err = engine.run(true, false).await.unwrap_err();
    assert!(matches!(err, Error::WorkerDead));
}

#[tokio::test(start_paused = true)]
async fn worker_death_is_fatal_even_with_auto_restart() {
    // Same bad binding as above, but under -L -R: a dead worker must
    // terminate the engine, not feed the restart loop.
    let (mut engine, _sink, state) = engine_with(
        vec![
            vec![Payload::Bits(vec![true])],
            vec![Payload::Bits(vec![true])],
            vec![Payload::Bits(vec![true])],
        ],
        vec![vec![point("s.a", Decoder::RegU16 { offset: 0 }, &[])]],
        OutputKind::Text,
    );

    let err = engine.run(true, true).await.unwrap_err();
    assert!(matches!(err, Error::WorkerDead));
    // No reinitialization happened: one session, one connect, one shutdown.
    assert_eq!(state.lock().unwrap().connects, 1);
    assert_eq!(state.lock().unwrap().shutdowns, 1);
}

#[tokio::test(start_paused = true)]
async fn auto_restart_reinitializes_until_a_fatal_error() {
    let sink = Sink::default();
    let state = Arc::new(Mutex::new(AdapterState::default()));
    let mut adapter = ScriptedAdapter::new(vec![], state.clone());
    // No scripted cycles: every session fails its first fetch. The third
    // connect attempt raises a configuration error, which is fatal.
    adapter.fetches = vec![0];
    adapter.fail_connect_after = Some(2);
    let mut engine = Engine::new(
        Duration::from_secs(1),
        0.0,
        Box::new(adapter),
        vec![Arc::new(vec![point(
            "s.a",
            Decoder::RegU16 { offset: 0 },
            &[],
        )])],
        sink.output(OutputKind::Text),
    );

    let err = engine.run(true, true).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert_eq!(state.lock().unwrap().connects, 3);
    assert_eq!(state.lock().unwrap().shutdowns, 2);
}

#[tokio::test(start_paused = true)]
async fn beacon_interleaves_with_data_lines() {
    let sink = Sink::default();
    let state = Arc::new(Mutex::new(AdapterState::default()));
    let adapter = ScriptedAdapter::new(
        vec![
            vec![Payload::Registers(vec![1])],
            vec![Payload::Registers(vec![1])],
            vec![Payload::Registers(vec![1])],
        ],
        state,
    );
    let mut engine = Engine::new(
        Duration::from_secs(1),
        0.5,
        Box::new(adapter),
        vec![Arc::new(vec![point(
            "s.a",
            Decoder::RegU16 { offset: 0 },
            &[],
        )])],
        sink.output(OutputKind::Text),
    );

    let _ = engine.run(true, false).await.unwrap_err();
    let lines = sink.lines();
    // One data line (dedup suppresses repeats) and a heartbeat roughly
    // every half second of virtual time across three one-second cycles.
    assert_eq!(lines.iter().filter(|l| *l == "s.a 1").count(), 1);
    assert_eq!(lines.iter().filter(|l| l.is_empty()).count(), 2);
}

#[tokio::test(start_paused = true)]
async fn multiple_pulls_emit_in_registration_order() {
    let (mut engine, sink, _) = engine_with(
        vec![vec![
            Payload::Registers(vec![1]),
            Payload::Registers(vec![2]),
        ]],
        vec![
            vec![point("a.first", Decoder::RegU16 { offset: 0 }, &[])],
            vec![point("b.second", Decoder::RegU16 { offset: 0 }, &[])],
        ],
        OutputKind::Text,
    );

    engine.run(false, false).await.unwrap();
    assert_eq!(data_lines(&sink), vec!["a.first 1", "b.second 2"]);
}

#[tokio::test(start_paused = true)]
async fn snmp_varbind_payloads_flow_through() {
    use std::collections::{HashMap, HashSet};

    use tagpull_core::pipeline::VarBindRule;
    use tagpull_core::proto::SnmpValue;

    let mut rules = HashMap::new();
    rules.insert(
        "1.3.6.1.2.1.2.2.1.10.1".to_string(),
        VarBindRule {
            set_id: Some("net.octets".to_string()),
            chain: TransformChain::bind(
                "net.octets",
                &[TransformSpec::Speed { interval: 1.0 }],
                None,
            )
            .unwrap(),
        },
    );
    let ignore: HashSet<String> = ["1.3.6.1.2.1.2.2.1.10.9".to_string()].into();
    let step = ProcessStep::VarBinds { rules, ignore };

    let cycle = |octets: u32| {
        vec![Payload::VarBinds(vec![
            (
                "1.3.6.1.2.1.2.2.1.10.1".to_string(),
                SnmpValue::Counter32(octets),
            ),
            (
                "1.3.6.1.2.1.2.2.1.10.9".to_string(),
                SnmpValue::Counter32(999),
            ),
            (
                "1.3.6.1.2.1.1.5.0".to_string(),
                SnmpValue::OctetString(b"switch-7".to_vec()),
            ),
        ])]
    };

    let (mut engine, sink, _) = engine_with(
        vec![cycle(1000), cycle(1500)],
        vec![vec![step]],
        OutputKind::Text,
    );

    let _ = engine.run(true, false).await.unwrap_err();
    assert_eq!(
        data_lines(&sink),
        vec![
            "net.octets 0",
            "1.3.6.1.2.1.1.5.0 switch-7",
            "net.octets 500.0",
        ]
    );
}

/// Property check for phase-preserving pacing: N loop cycles take exactly
/// N intervals of virtual time, fetch timestamps landing on the grid.
#[tokio::test(start_paused = true)]
async fn cycle_phase_does_not_drift() {
    let start = tokio::time::Instant::now();
    let (mut engine, _sink, _) = engine_with(
        vec![
            vec![Payload::Registers(vec![1])],
            vec![Payload::Registers(vec![2])],
            vec![Payload::Registers(vec![3])],
            vec![Payload::Registers(vec![4])],
        ],
        vec![vec![point("s.a", Decoder::RegU16 { offset: 0 }, &[])]],
        OutputKind::Text,
    );

    let _ = engine.run(true, false).await.unwrap_err();
    // Four scripted cycles and the failing fifth start on the 1 s grid.
    let elapsed = start.elapsed();
    assert_eq!(elapsed.as_secs(), 4);
}
