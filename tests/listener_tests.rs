use evobus::catalog::CommandCatalog;
use evobus::listener::{BusListener, ListenerError, ListenerHandles, ListenerSettings};
use evobus::measurement::{BufferedSink, Measurement, MeasurementSink, MemorySink, SinkError};
use evobus::protocol::{DeviceAddress, PendingCommand};
use evobus::transport::{LineRead, MockTransport, TransportError};
use evobus::zones::ZoneStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TEMPERATURES: &str = "045  I --- 01:160371 --:------ 01:160371 30C9 006 0008020B0834";
const GARBAGE: &str = "045  I --- 01:160371 --:------ 01:1603";

fn bad_zone_name(zone: &str) -> String {
    format!(
        "053 RP --- 01:160371 18:000730 --:------ 0004 022 {}00{}",
        zone,
        "ZZ".repeat(20)
    )
}

fn controller() -> DeviceAddress {
    "01:160371".parse().unwrap()
}

fn settings() -> ListenerSettings {
    ListenerSettings {
        read_timeout: Duration::from_millis(10),
        settle_delay: Duration::ZERO,
        reconnect_delay: Duration::from_millis(5),
        repair_limit: 3,
    }
}

fn listener<S: MeasurementSink>(
    transport: MockTransport,
    sink: S,
) -> (BusListener<MockTransport, S>, ListenerHandles) {
    BusListener::new(
        transport,
        sink,
        Arc::new(CommandCatalog::new()),
        "18:000730".parse().unwrap(),
        ZoneStore::new(),
        settings(),
    )
    .unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

struct OfflineSink;

impl MeasurementSink for OfflineSink {
    fn insert(&mut self, _rows: &[Measurement]) -> Result<(), SinkError> {
        Err(SinkError::Unavailable("warehouse offline".into()))
    }
}

/// Rejects the first `failures_left` inserts, then accepts everything.
struct FlakySink {
    failures_left: usize,
    accepted: Vec<Measurement>,
}

impl FlakySink {
    fn failing(times: usize) -> Self {
        Self {
            failures_left: times,
            accepted: Vec::new(),
        }
    }
}

impl MeasurementSink for FlakySink {
    fn insert(&mut self, rows: &[Measurement]) -> Result<(), SinkError> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(SinkError::Unavailable("warehouse offline".into()));
        }
        self.accepted.extend_from_slice(rows);
        Ok(())
    }
}

#[test]
fn test_process_line_emits_and_publishes() {
    let (mut listener, handles) = listener(MockTransport::new(), MemorySink::new());

    listener
        .process_line(&LineRead::Complete(TEMPERATURES.into()))
        .unwrap();
    listener
        .process_line(&LineRead::Complete(GARBAGE.into()))
        .unwrap();

    assert_eq!(listener.sink().rows().len(), 2);
    assert_eq!(listener.get_state().lines_read, 2);
    assert_eq!(listener.get_state().lines_dropped, 1);

    let snapshot = handles.snapshots.borrow().clone();
    let ids: Vec<u8> = snapshot.iter().map(|z| z.id).collect();
    assert_eq!(ids, vec![0, 11]);
}

#[test]
fn test_truncated_line_is_dropped() {
    let (mut listener, _handles) = listener(MockTransport::new(), MemorySink::new());
    listener
        .process_line(&LineRead::Truncated(TEMPERATURES.into()))
        .unwrap();
    assert!(listener.store().is_empty());
    assert_eq!(listener.get_state().lines_dropped, 1);
}

#[test]
fn test_zone_name_repairs_are_capped() {
    let (mut listener, _handles) = listener(MockTransport::new(), MemorySink::new());

    for _ in 0..5 {
        listener
            .process_line(&LineRead::Complete(bad_zone_name("01")))
            .unwrap();
    }
    assert_eq!(listener.get_state().repairs_queued, 3);
    assert_eq!(listener.get_state().repairs_dropped, 2);

    // another zone has its own allowance
    listener
        .process_line(&LineRead::Complete(bad_zone_name("02")))
        .unwrap();
    assert_eq!(listener.get_state().repairs_queued, 4);

    // a successful decode restores the zone's allowance
    listener
        .process_line(&LineRead::Complete(
            "053 RP --- 01:160371 18:000730 --:------ 0004 022 01004C6F676565726B616D6572000000000000000000"
                .into(),
        ))
        .unwrap();
    listener
        .process_line(&LineRead::Complete(bad_zone_name("01")))
        .unwrap();
    assert_eq!(listener.get_state().repairs_queued, 5);
}

#[test]
fn test_sink_overflow_is_fatal() {
    let sink = BufferedSink::new(OfflineSink, 1);
    let (mut listener, _handles) = listener(MockTransport::new(), sink);

    let result = listener.process_line(&LineRead::Complete(TEMPERATURES.into()));
    assert!(matches!(
        result,
        Err(ListenerError::Sink(SinkError::BufferOverflow { dropped: 2 }))
    ));
}

#[tokio::test]
async fn test_run_decodes_and_sends_repairs() {
    let mock = MockTransport::with_lines([TEMPERATURES.to_string(), bad_zone_name("01")]);
    let (mut listener, _handles) = listener(mock.clone(), MemorySink::new());
    let cancel = CancellationToken::new();

    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let result = listener.run(cancel).await;
            (listener, result)
        }
    });

    wait_until(|| mock.is_drained() && !mock.written().is_empty()).await;
    cancel.cancel();
    let (listener, result) = task.await.unwrap();

    result.unwrap();
    assert!(mock.is_closed());
    assert_eq!(listener.sink().rows().len(), 2);
    assert_eq!(
        mock.written(),
        vec!["RQ --- 18:000730 01:160371 --:------ 0004 002 0100\r\n".to_string()]
    );
}

#[tokio::test]
async fn test_queued_commands_are_sent_one_per_iteration() {
    let mock = MockTransport::new();
    let (mut listener, handles) = listener(mock.clone(), MemorySink::new());
    handles
        .outbound
        .enqueue(PendingCommand::heartbeat_request(controller()))
        .await
        .unwrap();
    handles
        .outbound
        .enqueue(PendingCommand::controller_mode_request(controller()))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move { listener.run(cancel).await }
    });

    wait_until(|| mock.written().len() == 2).await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    let written = mock.written();
    assert!(written[0].contains(" 10E0 001 00"));
    assert!(written[1].contains(" 2E04 001 FF"));
}

#[tokio::test]
async fn test_transport_fault_triggers_reconnect() {
    let mock = MockTransport::new();
    mock.push_failure(TransportError::ReadFailed("device unplugged".into()));
    mock.push_line(TEMPERATURES);
    let (mut listener, _handles) = listener(mock.clone(), MemorySink::new());

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let result = listener.run(cancel).await;
            (listener, result)
        }
    });

    wait_until(|| mock.is_drained()).await;
    // let the loop finish the last line
    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();
    let (listener, result) = task.await.unwrap();

    result.unwrap();
    assert_eq!(mock.reconnects(), 1);
    assert_eq!(listener.get_state().reconnects, 1);
    assert_eq!(listener.sink().rows().len(), 2);
}

#[tokio::test]
async fn test_health_check_signal_resets_link() {
    let mock = MockTransport::new();
    let (mut listener, handles) = listener(mock.clone(), MemorySink::new());
    handles.reconnect.notify_one();

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move { listener.run(cancel).await }
    });

    wait_until(|| mock.reconnects() == 1).await;
    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_write_failure_does_not_stall_the_loop() {
    let mock = MockTransport::new();
    mock.set_fail_writes(true);
    let (mut listener, handles) = listener(mock.clone(), MemorySink::new());
    handles
        .outbound
        .enqueue(PendingCommand::heartbeat_request(controller()))
        .await
        .unwrap();
    mock.push_line(TEMPERATURES);

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let result = listener.run(cancel).await;
            (listener, result)
        }
    });

    wait_until(|| mock.is_drained()).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();
    let (listener, result) = task.await.unwrap();

    result.unwrap();
    assert!(mock.written().is_empty());
    assert_eq!(listener.sink().rows().len(), 2);
}

#[tokio::test]
async fn test_refresh_restores_repair_allowance() {
    let mock = MockTransport::new();
    let (mut listener, handles) = listener(mock.clone(), MemorySink::new());
    for _ in 0..4 {
        listener
            .process_line(&LineRead::Complete(bad_zone_name("01")))
            .unwrap();
    }
    assert_eq!(listener.get_state().repairs_dropped, 1);

    handles.refresh_generation.send_modify(|g| *g += 1);
    mock.push_line(bad_zone_name("01"));

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let result = listener.run(cancel).await;
            (listener, result)
        }
    });

    wait_until(|| mock.is_drained()).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();
    let (listener, result) = task.await.unwrap();

    result.unwrap();
    assert_eq!(listener.get_state().repairs_queued, 4);
    assert_eq!(listener.get_state().repairs_dropped, 1);
}

#[test]
fn test_repair_dropped_on_full_queue_returns_one_slot() {
    let (mut listener, handles) = listener(MockTransport::new(), MemorySink::new());
    for _ in 0..2 {
        listener
            .process_line(&LineRead::Complete(bad_zone_name("01")))
            .unwrap();
    }
    assert_eq!(listener.outstanding_repairs(1), 2);

    while handles
        .outbound
        .try_enqueue(PendingCommand::heartbeat_request(controller()))
        .is_ok()
    {}
    assert_eq!(handles.outbound.remaining_capacity(), 0);

    listener
        .process_line(&LineRead::Complete(bad_zone_name("01")))
        .unwrap();
    assert_eq!(listener.get_state().follow_ups_dropped, 1);
    assert_eq!(listener.get_state().repairs_queued, 2);
    assert_eq!(listener.outstanding_repairs(1), 2);
}

#[tokio::test]
async fn test_repair_cap_holds_after_queue_drains() {
    let mock = MockTransport::new();
    let (mut listener, handles) = listener(mock.clone(), MemorySink::new());
    for _ in 0..2 {
        listener
            .process_line(&LineRead::Complete(bad_zone_name("01")))
            .unwrap();
    }
    while handles
        .outbound
        .try_enqueue(PendingCommand::heartbeat_request(controller()))
        .is_ok()
    {}
    listener
        .process_line(&LineRead::Complete(bad_zone_name("01")))
        .unwrap();

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let result = listener.run(cancel).await;
            (listener, result)
        }
    });
    for _ in 0..2000 {
        if handles.outbound.remaining_capacity() == 100 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();
    let (mut listener, result) = task.await.unwrap();
    result.unwrap();
    assert_eq!(handles.outbound.remaining_capacity(), 100);

    for _ in 0..3 {
        listener
            .process_line(&LineRead::Complete(bad_zone_name("01")))
            .unwrap();
    }
    assert_eq!(listener.get_state().repairs_queued, 3);
    assert_eq!(listener.outstanding_repairs(1), 3);
}

#[tokio::test]
async fn test_shutdown_delivers_buffered_rows() {
    let sink = BufferedSink::new(FlakySink::failing(1), 16);
    let (mut listener, _handles) = listener(MockTransport::new(), sink);

    listener
        .process_line(&LineRead::Complete(TEMPERATURES.into()))
        .unwrap();
    assert_eq!(listener.sink().pending(), 2);

    let cancel = CancellationToken::new();
    cancel.cancel();
    listener.run(cancel).await.unwrap();

    assert_eq!(listener.sink().pending(), 0);
    assert_eq!(listener.sink().inner().accepted.len(), 2);
}

#[tokio::test]
async fn test_overflow_still_attempts_final_delivery() {
    let mock = MockTransport::with_lines([TEMPERATURES.to_string()]);
    let sink = BufferedSink::new(FlakySink::failing(1), 2);
    let (mut listener, _handles) = listener(mock, sink);

    listener
        .process_line(&LineRead::Complete(TEMPERATURES.into()))
        .unwrap();
    assert_eq!(listener.sink().pending(), 2);

    let result = listener.run(CancellationToken::new()).await;
    assert!(matches!(
        result,
        Err(ListenerError::Sink(SinkError::BufferOverflow { dropped: 2 }))
    ));
    assert_eq!(listener.sink().pending(), 0);
    assert_eq!(listener.sink().inner().accepted.len(), 2);
}

#[tokio::test]
async fn test_undeliverable_rows_fail_shutdown() {
    let sink = BufferedSink::new(OfflineSink, 16);
    let (mut listener, _handles) = listener(MockTransport::new(), sink);
    listener
        .process_line(&LineRead::Complete(TEMPERATURES.into()))
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = listener.run(cancel).await;

    assert!(matches!(
        result,
        Err(ListenerError::Sink(SinkError::Unavailable(_)))
    ));
    assert_eq!(listener.sink().pending(), 2);
    assert!(listener.get_state().last_error.is_some());
}
