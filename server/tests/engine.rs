use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use hashpin_common::{
    config::{BulkConfig, EngineConfig},
    error::{Error, TransportError},
    memory,
    transport::{Session, Stream},
};
use hashpin_server::{BulkReport, EchoEngine};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn spawn_inbound(
    engine: &EchoEngine,
    session: &memory::MemorySession,
    token: &CancellationToken,
) -> tokio::task::JoinHandle<u64> {
    let (engine, session, token) = (engine.clone(), session.clone(), token.clone());
    tokio::spawn(async move { engine.run_inbound(&session, &token).await })
}

fn spawn_outbound(
    engine: &EchoEngine,
    session: &memory::MemorySession,
    token: &CancellationToken,
) -> tokio::task::JoinHandle<u64> {
    let (engine, session, token) = (engine.clone(), session.clone(), token.clone());
    tokio::spawn(async move { engine.run_outbound(&session, &token).await })
}

#[tokio::test]
async fn inbound_bytes_are_echoed_up_to_the_read_limit() {
    let (session, peer) = memory::pair();
    let token = CancellationToken::new();
    let task = spawn_inbound(&EchoEngine::new(EngineConfig::default()), &session, &token);

    let mut short = peer.open_stream().await.unwrap();
    short.write_all(b"hello").await.unwrap();
    assert_eq!(short.read_to_end(1024).await.unwrap(), b"hello");

    let mut long = peer.open_stream().await.unwrap();
    long.write_all(b"abcdefghijklmnopqrst").await.unwrap();
    assert_eq!(long.read_to_end(1024).await.unwrap(), b"abcdefghijklmno");

    drop(peer);
    assert_eq!(task.await.unwrap(), 2);
}

#[tokio::test]
async fn empty_inbound_stream_is_closed_without_reply() {
    let (session, peer) = memory::pair();
    let token = CancellationToken::new();
    let task = spawn_inbound(&EchoEngine::new(EngineConfig::default()), &session, &token);

    let empty = peer.open_stream().await.unwrap();
    empty.close().unwrap();

    // The loop keeps serving after the empty stream.
    let mut next = peer.open_stream().await.unwrap();
    next.write_all(b"still here").await.unwrap();
    assert_eq!(next.read_to_end(1024).await.unwrap(), b"still here");

    token.cancel();
    assert_eq!(task.await.unwrap(), 2);
}

#[tokio::test]
async fn echo_can_be_turned_off() {
    let mut config = EngineConfig::default();
    config.echo.echo_reply = false;

    let (session, peer) = memory::pair();
    let token = CancellationToken::new();
    let task = spawn_inbound(&EchoEngine::new(config), &session, &token);

    let mut stream = peer.open_stream().await.unwrap();
    stream.write_all(b"quiet").await.unwrap();
    assert!(stream.read_to_end(1024).await.unwrap().is_empty());

    token.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn outbound_streams_carry_the_payload_once_per_interval() {
    let (session, mut peer) = memory::pair();
    let token = CancellationToken::new();
    let task = spawn_outbound(&EchoEngine::new(EngineConfig::default()), &session, &token);

    let mut first = peer.accept_stream().await.unwrap();
    let opened_at = Instant::now();
    assert_eq!(first.read_to_end(1024).await.unwrap(), vec![10, 10, 10]);

    let mut second = peer.accept_stream().await.unwrap();
    assert!(opened_at.elapsed() >= Duration::from_secs(1));
    assert_eq!(second.read_to_end(1024).await.unwrap(), vec![10, 10, 10]);

    token.cancel();
    assert!(task.await.unwrap() >= 2);
}

#[tokio::test(start_paused = true)]
async fn outbound_loop_ends_with_the_session() {
    let (session, peer) = memory::pair();
    let token = CancellationToken::new();
    let task = spawn_outbound(&EchoEngine::new(EngineConfig::default()), &session, &token);

    drop(peer);
    // Ends on the next open attempt without the token being touched.
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("outbound loop did not stop")
        .unwrap();
    assert!(!token.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_both_loops() {
    let (session, _peer) = memory::pair();
    let token = CancellationToken::new();
    let engine = EchoEngine::new(EngineConfig::default());
    let inbound = spawn_inbound(&engine, &session, &token);
    let outbound = spawn_outbound(&engine, &session, &token);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    token.cancel();

    let stopped = tokio::time::timeout(Duration::from_millis(100), async {
        (inbound.await.unwrap(), outbound.await.unwrap())
    })
    .await
    .expect("loops ignored cancellation");
    assert_eq!(stopped.0, 0);
    assert!(stopped.1 >= 1);
}

fn small_bulk() -> EngineConfig {
    EngineConfig {
        bulk: BulkConfig {
            chunk_count: 4,
            chunk_size: 1024,
            ..BulkConfig::default()
        },
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn bulk_fills_the_client_stream() {
    let (session, peer) = memory::pair();
    let token = CancellationToken::new();
    let engine = EchoEngine::new(small_bulk());
    let task = {
        let (engine, session, token) = (engine.clone(), session.clone(), token.clone());
        tokio::spawn(async move { engine.run_bulk(&session, &token).await })
    };

    let mut stream = peer.open_stream().await.unwrap();
    assert_eq!(stream.drain().await.unwrap(), 4096);

    let report = task.await.unwrap().unwrap();
    assert_eq!(report, BulkReport { chunks: 4, bytes: 4096 });
}

#[tokio::test(start_paused = true)]
async fn bulk_gives_up_when_no_stream_arrives() {
    let (session, _peer) = memory::pair();
    let token = CancellationToken::new();
    let engine = EchoEngine::new(EngineConfig::default());

    let started = Instant::now();
    let err = engine.run_bulk(&session, &token).await.unwrap_err();

    assert!(matches!(
        err,
        Error::StreamAccept(TransportError::TimedOut(timeout)) if timeout == Duration::from_secs(5)
    ));
    assert!(started.elapsed() >= Duration::from_secs(5));
}

#[tokio::test]
async fn bulk_write_failure_ends_only_the_transfer() {
    let (session, peer) = memory::pair();
    let token = CancellationToken::new();
    let engine = EchoEngine::new(small_bulk());

    let gone = peer.open_stream().await.unwrap();
    drop(gone);

    let err = engine.run_bulk(&session, &token).await.unwrap_err();
    assert!(matches!(err, Error::StreamIo(_)));
    assert!(!err.is_session_terminal());
    assert!(!peer.is_closed());
}

/// Records the size of every write instead of moving bytes.
#[derive(Default)]
struct Recorder {
    writes: Vec<usize>,
    closed: bool,
}

struct RecordingStream {
    log: Arc<Mutex<Recorder>>,
}

#[async_trait]
impl Stream for RecordingStream {
    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, TransportError> {
        Ok(0)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        self.log.lock().unwrap().writes.push(buf.len());
        Ok(buf.len())
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.write(buf).await.map(|_| ())
    }

    fn close(self) -> Result<(), TransportError> {
        self.log.lock().unwrap().closed = true;
        Ok(())
    }
}

#[derive(Clone)]
struct RecordingSession {
    pending: Arc<Mutex<Option<RecordingStream>>>,
}

#[async_trait]
impl Session for RecordingSession {
    type Stream = RecordingStream;

    async fn accept_stream(&self) -> Result<RecordingStream, TransportError> {
        let next = self.pending.lock().unwrap().take();
        match next {
            Some(stream) => Ok(stream),
            None => std::future::pending().await,
        }
    }

    async fn open_stream(&self) -> Result<RecordingStream, TransportError> {
        Err(TransportError::Stream("not supported".into()))
    }

    async fn closed(&self) -> TransportError {
        std::future::pending().await
    }

    fn close(&self, _code: u32, _reason: &str) {}

    fn peer(&self) -> String {
        "recorder".to_string()
    }
}

#[tokio::test]
async fn bulk_writes_256_chunks_of_one_mebibyte_then_closes() {
    let log = Arc::new(Mutex::new(Recorder::default()));
    let session = RecordingSession {
        pending: Arc::new(Mutex::new(Some(RecordingStream { log: log.clone() }))),
    };
    let engine = EchoEngine::new(EngineConfig::default());

    let report = engine
        .run_bulk(&session, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.chunks, 256);
    assert_eq!(report.bytes, 256 * 1024 * 1024);

    let log = log.lock().unwrap();
    assert_eq!(log.writes.len(), 256);
    assert!(log.writes.iter().all(|&n| n == 1024 * 1024));
    assert!(log.closed);
}

/// What a scripted stream saw.
#[derive(Default)]
struct StreamLog {
    written: Vec<u8>,
    closed:  usize,
}

/// Stream with a fixed read outcome and an optional cap on each write.
struct ScriptedStream {
    read:        Result<Vec<u8>, TransportError>,
    write_limit: Option<usize>,
    log:         Arc<Mutex<StreamLog>>,
}

impl ScriptedStream {
    fn new(read: Result<Vec<u8>, TransportError>, log: &Arc<Mutex<StreamLog>>) -> Self {
        Self {
            read,
            write_limit: None,
            log: log.clone(),
        }
    }

    fn short_writes(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }
}

#[async_trait]
impl Stream for ScriptedStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let data = std::mem::replace(&mut self.read, Ok(Vec::new()))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        let n = self.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
        self.log.lock().unwrap().written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.log.lock().unwrap().written.extend_from_slice(buf);
        Ok(())
    }

    fn close(self) -> Result<(), TransportError> {
        self.log.lock().unwrap().closed += 1;
        Ok(())
    }
}

type Script = Arc<Mutex<VecDeque<Result<ScriptedStream, TransportError>>>>;

/// Session that plays back fixed accept and open outcomes, then reports
/// itself closed.
#[derive(Clone, Default)]
struct ScriptedSession {
    accepts:   Script,
    opens:     Script,
    opened_at: Arc<Mutex<Vec<Instant>>>,
}

impl ScriptedSession {
    fn next(script: &Script) -> Result<ScriptedStream, TransportError> {
        let next = script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(TransportError::SessionClosed("script finished".into())))
    }
}

#[async_trait]
impl Session for ScriptedSession {
    type Stream = ScriptedStream;

    async fn accept_stream(&self) -> Result<ScriptedStream, TransportError> {
        Self::next(&self.accepts)
    }

    async fn open_stream(&self) -> Result<ScriptedStream, TransportError> {
        self.opened_at.lock().unwrap().push(Instant::now());
        Self::next(&self.opens)
    }

    async fn closed(&self) -> TransportError {
        std::future::pending().await
    }

    fn close(&self, _code: u32, _reason: &str) {}

    fn peer(&self) -> String {
        "scripted".to_string()
    }
}

fn stream_error() -> TransportError {
    TransportError::Stream("reset by peer".into())
}

#[tokio::test]
async fn accept_and_read_errors_only_cost_one_iteration() {
    let log = Arc::new(Mutex::new(StreamLog::default()));
    let session = ScriptedSession::default();
    session.accepts.lock().unwrap().extend([
        Err(stream_error()),
        Ok(ScriptedStream::new(Err(stream_error()), &log)),
        Err(stream_error()),
        Ok(ScriptedStream::new(Ok(b"hi".to_vec()), &log)),
    ]);

    let engine = EchoEngine::new(EngineConfig::default());
    let served = engine
        .run_inbound(&session, &CancellationToken::new())
        .await;

    // Both accepted streams are served and closed, the failed read included.
    assert_eq!(served, 2);
    assert!(session.accepts.lock().unwrap().is_empty());
    let log = log.lock().unwrap();
    assert_eq!(log.closed, 2);
    assert_eq!(log.written, b"hi");
}

#[tokio::test(start_paused = true)]
async fn open_failures_and_short_writes_keep_the_outbound_pace() {
    let log = Arc::new(Mutex::new(StreamLog::default()));
    let session = ScriptedSession::default();
    session.opens.lock().unwrap().extend([
        Err(stream_error()),
        Ok(ScriptedStream::new(Ok(Vec::new()), &log)),
        Err(stream_error()),
        Ok(ScriptedStream::new(Ok(Vec::new()), &log).short_writes(2)),
    ]);

    let engine = EchoEngine::new(EngineConfig::default());
    let sent = engine
        .run_outbound(&session, &CancellationToken::new())
        .await;

    // Only the full write counts; the short one is logged and dropped.
    assert_eq!(sent, 1);
    let log = log.lock().unwrap();
    assert_eq!(log.closed, 2);
    assert_eq!(log.written, vec![10, 10, 10, 10, 10]);

    // Four scripted outcomes plus the terminal one, one interval apart.
    let opened_at = session.opened_at.lock().unwrap();
    assert_eq!(opened_at.len(), 5);
    for pair in opened_at.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= Duration::from_secs(1) && gap < Duration::from_millis(1100));
    }
}
