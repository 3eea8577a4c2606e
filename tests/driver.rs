use async_trait::async_trait;
use bluetti_lib::protocol::{self, Command, FunctionCode, DEVICE_ADDRESS};
use bluetti_lib::{
    ConnectionState, DomainValue, Driver, DriverConfig, DriverEvent, DriverEvents, Error,
    NotificationSink, Reading, Snapshot, Transport, TransportError,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

/// In-memory power station answering register reads and writes.
#[derive(Default)]
struct MockDevice {
    registers: Mutex<HashMap<u16, u16>>,
    /// Reads starting at these registers never get an answer.
    silent: Mutex<HashSet<u16>>,
    connect_results: Mutex<VecDeque<Result<(), TransportError>>>,
    connects: Mutex<Vec<Instant>>,
    disconnects: AtomicUsize,
    sink: Mutex<Option<NotificationSink>>,
    /// Subscribing never completes.
    stuck_subscribe: AtomicBool,
}

impl MockDevice {
    fn new(registers: &[(u16, u16)]) -> Arc<Self> {
        let device = Self::default();
        device.registers.lock().extend(registers.iter().copied());
        Arc::new(device)
    }

    fn silence(&self, start: u16) {
        self.silent.lock().insert(start);
    }

    fn register(&self, address: u16) -> u16 {
        self.registers.lock().get(&address).copied().unwrap_or(0)
    }

    fn drop_link(&self) {
        self.sink.lock().take();
    }

    fn reply_to(&self, command: Command) -> Option<Vec<u8>> {
        match command {
            Command::ReadHoldingRegisters { start, count } => {
                if self.silent.lock().contains(&start) {
                    return None;
                }
                let registers = self.registers.lock();
                let mut payload = vec![(count * 2) as u8];
                for address in start..start + count {
                    let word = registers.get(&address).copied().unwrap_or(0);
                    payload.extend_from_slice(&word.to_be_bytes());
                }
                protocol::encode(DEVICE_ADDRESS, FunctionCode::ReadHoldingRegisters, &payload).ok()
            }
            Command::WriteSingleRegister { register, value } => {
                self.registers.lock().insert(register, value);
                command.request().ok()
            }
        }
    }
}

fn parse_request(bytes: &[u8]) -> Command {
    let frame = protocol::decode(bytes).unwrap();
    let first = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
    let second = u16::from_be_bytes([frame.payload[2], frame.payload[3]]);
    match frame.function {
        FunctionCode::ReadHoldingRegisters => Command::read_holding_registers(first, second),
        FunctionCode::WriteSingleRegister => Command::write_single_register(first, second),
        other => panic!("unexpected request {other:?}"),
    }
}

#[async_trait]
impl Transport for MockDevice {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        assert_eq!(address, ADDRESS);
        self.connects.lock().push(Instant::now());
        self.connect_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn subscribe_notifications(&self, sink: NotificationSink) -> Result<(), TransportError> {
        if self.stuck_subscribe.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let Some(reply) = self.reply_to(parse_request(bytes)) else {
            return Ok(());
        };
        let sink = self.sink.lock().clone();
        let Some(sink) = sink else {
            return Err(TransportError::Disconnected);
        };
        // BLE notifications carry at most 20 bytes
        for chunk in reply.chunks(20) {
            sink.send(chunk.to_vec())
                .await
                .map_err(|_| TransportError::Disconnected)?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.sink.lock().take();
        Ok(())
    }
}

fn start(config: DriverConfig, device: &Arc<MockDevice>) -> (Driver, DriverEvents) {
    let transport: Arc<dyn Transport> = device.clone();
    Driver::start(config, transport).unwrap()
}

async fn next_event(events: &mut DriverEvents) -> DriverEvent {
    tokio::time::timeout(Duration::from_secs(600), events.recv())
        .await
        .expect("no driver event")
        .expect("driver stopped")
}

/// Collects events up to and including the first one matching `done`.
async fn wait_for(
    events: &mut DriverEvents,
    done: impl Fn(&DriverEvent) -> bool,
) -> Vec<DriverEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

async fn next_snapshot(events: &mut DriverEvents) -> Snapshot {
    match wait_for(events, |e| matches!(e, DriverEvent::Snapshot(_))).await.pop() {
        Some(DriverEvent::Snapshot(snapshot)) => snapshot,
        other => panic!("expected snapshot, got {other:?}"),
    }
}

fn station() -> Arc<MockDevice> {
    MockDevice::new(&[
        (36, 120),
        (43, 77),
        (48, 1),
        (70, 1),
        (77, 2301),
        (3001, 1),
        (3007, 1),
        (3061, 5),
    ])
}

#[tokio::test(start_paused = true)]
async fn handshake_then_snapshot() {
    let device = station();
    let (driver, mut events) = start(DriverConfig::new(ADDRESS), &device);

    assert_eq!(
        next_event(&mut events).await,
        DriverEvent::StateChanged(ConnectionState::Connecting)
    );
    assert_eq!(
        next_event(&mut events).await,
        DriverEvent::StateChanged(ConnectionState::Handshaking)
    );
    assert_eq!(
        next_event(&mut events).await,
        DriverEvent::StateChanged(ConnectionState::Ready)
    );
    assert_eq!(driver.state(), ConnectionState::Ready);

    let snapshot = next_snapshot(&mut events).await;
    assert!(snapshot.stale_groups.is_empty());
    assert_eq!(
        snapshot.value("total_battery_percent"),
        Some(&DomainValue::Percentage(77))
    );
    assert_eq!(snapshot.value("dc_input_power"), Some(&DomainValue::Power(120.0)));
    assert_eq!(snapshot.value("ac_output_state"), Some(&DomainValue::Switch(true)));
    assert_eq!(
        snapshot.value("ac_output_mode"),
        Some(&DomainValue::Enum("Inverter Output"))
    );
    assert_eq!(snapshot.value("ups_mode"), Some(&DomainValue::Enum("PV Priority")));
    assert_eq!(snapshot.value("auto_sleep_mode"), Some(&DomainValue::Enum("Never")));
    assert_eq!(snapshot.value("ac_output_on"), Some(&DomainValue::Switch(true)));
    match snapshot.value("ac_input_voltage") {
        Some(DomainValue::Measurement { value, .. }) => assert!((value - 230.1).abs() < 0.01),
        other => panic!("unexpected ac_input_voltage {other:?}"),
    }

    driver.stop().await;
    let rest = wait_for(&mut events, |e| {
        *e == DriverEvent::StateChanged(ConnectionState::Disconnected)
    })
    .await;
    assert!(rest.contains(&DriverEvent::StateChanged(ConnectionState::Disconnecting)));
    assert_eq!(device.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn silent_group_marks_only_its_fields() {
    let device = station();
    device.silence(70);
    let (driver, mut events) = start(DriverConfig::new(ADDRESS), &device);

    let snapshot = next_snapshot(&mut events).await;
    assert_eq!(snapshot.stale_groups, vec!["power".to_string()]);
    assert!(snapshot.is_stale("power"));
    assert_eq!(snapshot.get("ac_input_voltage"), Some(&Reading::Unavailable));
    assert_eq!(snapshot.get("ac_output_mode"), Some(&Reading::Unavailable));
    assert_eq!(
        snapshot.value("total_battery_percent"),
        Some(&DomainValue::Percentage(77))
    );
    assert_eq!(snapshot.value("ups_mode"), Some(&DomainValue::Enum("PV Priority")));
    // one bad group does not drop the connection
    assert_eq!(driver.state(), ConnectionState::Ready);

    driver.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unmapped_enum_reads_as_unknown() {
    let device = station();
    device.registers.lock().insert(3001, 9);
    let (driver, mut events) = start(DriverConfig::new(ADDRESS), &device);

    let snapshot = next_snapshot(&mut events).await;
    assert_eq!(snapshot.get("ups_mode"), Some(&Reading::Unknown));
    assert!(!snapshot.is_stale("control"));
    assert_eq!(snapshot.value("ac_output_on"), Some(&DomainValue::Switch(true)));

    driver.stop().await;
}

#[tokio::test(start_paused = true)]
async fn exclusive_lock_backs_off_and_recovers() {
    let device = station();
    device
        .connect_results
        .lock()
        .extend([Err(TransportError::ExclusiveLock), Err(TransportError::ExclusiveLock)]);
    let (driver, mut events) = start(DriverConfig::new(ADDRESS), &device);

    let seen = wait_for(&mut events, |e| {
        *e == DriverEvent::StateChanged(ConnectionState::Ready)
    })
    .await;
    let locks = seen
        .iter()
        .filter(|e| {
            **e == DriverEvent::ExclusiveLock {
                address: ADDRESS.to_string(),
            }
        })
        .count();
    assert_eq!(locks, 2);
    assert!(!seen
        .iter()
        .any(|e| matches!(e, DriverEvent::ConnectionDown { .. })));

    let connects = device.connects.lock().clone();
    assert_eq!(connects.len(), 3);
    let first_gap = connects[1] - connects[0];
    let second_gap = connects[2] - connects[1];
    assert!(first_gap >= Duration::from_secs(5) && first_gap < Duration::from_secs(6));
    assert!(second_gap >= Duration::from_secs(10) && second_gap < Duration::from_secs(11));

    let snapshot = next_snapshot(&mut events).await;
    assert!(snapshot.stale_groups.is_empty());
    driver.stop().await;
}

#[tokio::test(start_paused = true)]
async fn control_write_then_refresh() {
    let device = station();
    let (driver, mut events) = start(DriverConfig::new(ADDRESS), &device);
    let snapshot = next_snapshot(&mut events).await;
    assert_eq!(snapshot.value("ac_output_on"), Some(&DomainValue::Switch(true)));

    driver
        .submit_control("ac_output_on", DomainValue::Switch(false))
        .await
        .unwrap();
    assert_eq!(device.register(3007), 0);

    let seen = wait_for(&mut events, |e| matches!(e, DriverEvent::ControlResult { .. })).await;
    assert_eq!(
        seen.last(),
        Some(&DriverEvent::ControlResult {
            field: "ac_output_on".into(),
            outcome: Ok(()),
        })
    );
    let started = Instant::now();
    let refreshed = next_snapshot(&mut events).await;
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(refreshed.value("ac_output_on"), Some(&DomainValue::Switch(false)));

    driver
        .submit_control("ups_mode", DomainValue::Enum("Standard"))
        .await
        .unwrap();
    assert_eq!(device.register(3001), 2);

    driver
        .submit_control("ac_output_mode_control", DomainValue::Enum("Bypass Output C"))
        .await
        .unwrap();
    assert_eq!(device.register(3002), 2);

    driver.stop().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_controls_never_reach_the_device() {
    let device = station();
    let (driver, mut events) = start(DriverConfig::new(ADDRESS), &device);
    next_snapshot(&mut events).await;

    assert_eq!(
        driver
            .submit_control("ac_output_state", DomainValue::Switch(false))
            .await,
        Err(Error::ReadOnlyField("ac_output_state".into()))
    );
    assert_eq!(
        driver
            .submit_control("no_such_field", DomainValue::Switch(false))
            .await,
        Err(Error::UnknownField("no_such_field".into()))
    );
    assert!(matches!(
        driver
            .submit_control("battery_range_end", DomainValue::Percentage(120))
            .await,
        Err(Error::ValueOutOfRange { .. })
    ));
    assert_eq!(device.register(48), 1);
    assert_eq!(device.register(3016), 0);

    driver.stop().await;
}

#[tokio::test(start_paused = true)]
async fn control_rejected_when_not_ready() {
    let device = station();
    device.silence(10);
    let (driver, mut events) = start(DriverConfig::new(ADDRESS), &device);
    wait_for(&mut events, |e| {
        *e == DriverEvent::StateChanged(ConnectionState::Handshaking)
    })
    .await;

    assert_eq!(
        driver
            .submit_control("ac_output_on", DomainValue::Switch(false))
            .await,
        Err(Error::NotConnected)
    );
    assert_eq!(device.register(3007), 1);
    driver.stop().await;
}

#[tokio::test(start_paused = true)]
async fn battery_packs_polled_in_turn() {
    let device = station();
    device.registers.lock().extend([(91, 2), (99, 64)]);
    let mut config = DriverConfig::new(ADDRESS);
    config.pack_slots = vec![2];
    let (driver, mut events) = start(config, &device);

    let snapshot = next_snapshot(&mut events).await;
    assert_eq!(device.register(3006), 2);
    assert_eq!(
        snapshot.value("pack_2_battery_percent"),
        Some(&DomainValue::Percentage(64))
    );
    assert_eq!(snapshot.value("pack_num_max"), Some(&DomainValue::Integer(2)));
    assert!(snapshot.stale_groups.is_empty());

    driver.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_during_handshake() {
    let device = station();
    device.silence(10);
    let (driver, mut events) = start(DriverConfig::new(ADDRESS), &device);
    wait_for(&mut events, |e| {
        *e == DriverEvent::StateChanged(ConnectionState::Handshaking)
    })
    .await;

    driver.stop().await;
    assert_eq!(
        next_event(&mut events).await,
        DriverEvent::StateChanged(ConnectionState::Disconnecting)
    );
    assert_eq!(
        next_event(&mut events).await,
        DriverEvent::StateChanged(ConnectionState::Disconnected)
    );
    assert_eq!(events.recv().await, None);
    assert_eq!(device.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn lost_link_reconnects() {
    let device = station();
    let (driver, mut events) = start(DriverConfig::new(ADDRESS), &device);
    next_snapshot(&mut events).await;

    device.drop_link();
    let seen = wait_for(&mut events, |e| matches!(e, DriverEvent::ConnectionDown { .. })).await;
    assert!(seen.contains(&DriverEvent::StateChanged(ConnectionState::Disconnected)));

    wait_for(&mut events, |e| {
        *e == DriverEvent::StateChanged(ConnectionState::Ready)
    })
    .await;
    assert_eq!(device.connects.lock().len(), 2);
    let snapshot = next_snapshot(&mut events).await;
    assert_eq!(
        snapshot.value("total_battery_percent"),
        Some(&DomainValue::Percentage(77))
    );

    driver.stop().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_timeouts_drop_connection() {
    let device = station();
    device.silence(91);
    device.silence(3001);
    let mut config = DriverConfig::new(ADDRESS);
    config.retries = 1;
    config.max_consecutive_timeouts = 2;
    let (driver, mut events) = start(config, &device);

    let snapshot = next_snapshot(&mut events).await;
    assert_eq!(snapshot.stale_groups, vec!["pack".to_string(), "control".to_string()]);

    let seen = wait_for(&mut events, |e| matches!(e, DriverEvent::ConnectionDown { .. })).await;
    assert!(seen.contains(&DriverEvent::StateChanged(ConnectionState::Disconnected)));
    assert_eq!(device.disconnects.load(Ordering::SeqCst), 1);

    driver.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_while_subscribe_hangs() {
    let device = station();
    device.stuck_subscribe.store(true, Ordering::SeqCst);
    let (driver, mut events) = start(DriverConfig::new(ADDRESS), &device);
    wait_for(&mut events, |e| {
        *e == DriverEvent::StateChanged(ConnectionState::Connecting)
    })
    .await;
    tokio::task::yield_now().await;
    assert_eq!(device.connects.lock().len(), 1);

    let started = Instant::now();
    tokio::time::timeout(Duration::from_secs(3600), driver.stop())
        .await
        .expect("stop hangs while subscribing");
    assert!(started.elapsed() < Duration::from_secs(1));
    let rest = wait_for(&mut events, |e| {
        *e == DriverEvent::StateChanged(ConnectionState::Disconnected)
    })
    .await;
    assert!(rest.contains(&DriverEvent::StateChanged(ConnectionState::Disconnecting)));
    assert_eq!(device.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn hanging_subscribe_times_out() {
    let device = station();
    device.stuck_subscribe.store(true, Ordering::SeqCst);
    let mut config = DriverConfig::new(ADDRESS);
    config.connect_timeout = Duration::from_secs(10);
    let (driver, mut events) = start(config, &device);

    let started = Instant::now();
    wait_for(&mut events, |e| matches!(e, DriverEvent::ConnectionDown { .. })).await;
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(started.elapsed() < Duration::from_secs(11));
    assert_eq!(device.disconnects.load(Ordering::SeqCst), 1);

    driver.stop().await;
}
