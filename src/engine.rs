//! Polling engine.
//!
//! Walks the register table for one device at a time, within the time left
//! until the next cycle, and keeps per (block, device) bookkeeping next to the
//! shared read-only table.

use crate::cache::ValueCache;
use crate::device::Device;
use crate::error::Result;
use crate::hooks::{self, DeviceHook};
use crate::registers::{DeviceClass, Field, RefreshTier, RegisterBlock};
use crate::session::{ConnectionInfo, ModbusSession};
use crate::store::Store;
use crate::table;
use crate::transport::Transport;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// A pass stops issuing reads once less than this is left of its budget.
pub const MIN_BUDGET_LEFT: Duration = Duration::from_millis(1_000);

pub const ERRNO_OK: u16 = 0;
pub const ERRNO_NO_DATA: u16 = 101;
pub const ERRNO_STALE: u16 = 102;

#[derive(Debug, Clone, Default)]
struct BlockState {
    last_read: Option<Instant>,
    last_read_at: Option<DateTime<Utc>>,
    initialized: bool,
    expanded_count: usize,
    expanded: Vec<Field>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastRead {
    pub inverter: usize,
    pub modbus_id: u8,
    pub address: u16,
    pub info: &'static str,
    pub last_read: Option<DateTime<Utc>>,
}

/// Health snapshot: the first problem found plus the read times of every
/// periodically refreshed block.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub errno: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<LastRead>,
    pub last_reads: Vec<LastRead>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionInfo>,
}

impl HealthReport {
    pub fn is_ok(&self) -> bool {
        self.errno == ERRNO_OK
    }

    pub fn with_connection(mut self, connection: ConnectionInfo) -> Self {
        self.connection = Some(connection);
        self
    }
}

#[derive(Debug)]
pub struct RegisterEngine {
    table: Vec<RegisterBlock>,
    hooks: Vec<DeviceHook>,
    book: HashMap<(usize, usize), BlockState>,
    hooks_declared: HashSet<(usize, usize)>,
    low_interval: Duration,
}

impl RegisterEngine {
    pub fn new(table: Vec<RegisterBlock>, low_interval: Duration) -> Result<Self> {
        for block in &table {
            block.validate()?;
        }
        Ok(Self {
            table,
            hooks: hooks::device_hooks(),
            book: HashMap::new(),
            hooks_declared: HashSet::new(),
            low_interval,
        })
    }

    /// Engine over the SUN2000 register map.
    pub fn sun2000(low_interval: Duration) -> Result<Self> {
        Self::new(table::sun2000(), low_interval)
    }

    pub fn table(&self) -> &[RegisterBlock] {
        &self.table
    }

    /// Poll every device for `tier`, flushing the cache after each device.
    /// Returns the number of blocks read.
    pub async fn poll<T: Transport, S: Store>(
        &mut self,
        session: &mut ModbusSession<T>,
        store: &mut S,
        devices: &mut [Device],
        cache: &mut ValueCache,
        tier: RefreshTier,
        deadline: Instant,
    ) -> usize {
        let mut read = 0;
        for device in devices.iter_mut() {
            read += self.poll_device(session, device, cache, tier, deadline).await;
            cache.flush(store).await;
        }
        read
    }

    /// Read the blocks of `tier` for one device and run its derived hooks.
    pub async fn poll_device<T: Transport>(
        &mut self,
        session: &mut ModbusSession<T>,
        device: &mut Device,
        cache: &mut ValueCache,
        tier: RefreshTier,
        deadline: Instant,
    ) -> usize {
        let start = Instant::now();
        let mut read = 0;

        for (index, block) in self.table.iter().enumerate() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left < MIN_BUDGET_LEFT {
                tracing::debug!(
                    "Budget exhausted for id {}: used {} ms, {} ms left",
                    device.unit,
                    start.elapsed().as_millis(),
                    left.as_millis()
                );
                break;
            }
            if block.fields.is_empty() || !tier.covers(block.refresh) {
                continue;
            }
            if block.class == DeviceClass::Meter && !device.has_meter {
                continue;
            }

            let state = self.book.entry((index, device.index)).or_default();
            if tier != RefreshTier::High {
                if let Some(last) = state.last_read {
                    if block.refresh.is_none() {
                        continue;
                    }
                    let age = start.saturating_duration_since(last);
                    if age < self.low_interval {
                        tracing::debug!("Last read: {} ms", age.as_millis());
                        continue;
                    }
                }
            }

            tracing::debug!(
                "Try to read data from id/address {}/{}",
                device.unit,
                block.address
            );
            match session
                .read_holding_registers(device.unit, block.address, block.length)
                .await
            {
                Ok(words) => {
                    state.last_read = Some(Instant::now());
                    state.last_read_at = Some(Utc::now());
                    process_block(block, state, device, cache, &words, Local::now());
                    read += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "Error while reading [{}|{}] id: {}: {}",
                        block.address,
                        block.length,
                        device.unit,
                        e
                    );
                    if e.is_device_busy() || e.is_host_unreachable() {
                        break;
                    }
                }
            }
        }

        for (index, hook) in self.hooks.iter().enumerate() {
            if !tier.covers(Some(hook.tier)) {
                continue;
            }
            if self.hooks_declared.insert((index, device.index)) {
                cache.declare(device.inverter_key(&hook.field.key), hook.field.meta);
            }
            (hook.run)(device, cache, Local::now());
        }
        read
    }

    /// Check every periodically refreshed block of every device for
    /// staleness.
    pub fn health(&self, devices: &[Device], now: Instant, stale_after: Duration) -> HealthReport {
        let mut issue: Option<(u16, LastRead)> = None;
        let mut last_reads = Vec::new();

        for device in devices {
            let mut first = true;
            for (index, block) in self.table.iter().enumerate() {
                if block.fields.is_empty() || block.refresh.is_none() {
                    continue;
                }
                if block.class == DeviceClass::Meter && !device.has_meter {
                    continue;
                }
                let state = self.book.get(&(index, device.index));
                let last = state.and_then(|s| s.last_read);
                let entry = LastRead {
                    inverter: device.index,
                    modbus_id: device.unit,
                    address: block.address,
                    info: block.info,
                    last_read: state.and_then(|s| s.last_read_at),
                };

                let stale = match last {
                    None => true,
                    Some(t) => now.saturating_duration_since(t) > stale_after,
                };
                if stale && issue.is_none() {
                    let errno = if last.is_none() && first {
                        ERRNO_NO_DATA
                    } else {
                        ERRNO_STALE
                    };
                    issue = Some((errno, entry.clone()));
                }
                first = false;
                last_reads.push(entry);
            }
        }

        let (errno, message, issue) = match issue {
            None => (ERRNO_OK, "No problems detected", None),
            Some((ERRNO_NO_DATA, entry)) => (
                ERRNO_NO_DATA,
                "Can't read data from inverter! Please check the configuration.",
                Some(entry),
            ),
            Some((errno, entry)) => (
                errno,
                "Not all data can be read! Please inspect the logs.",
                Some(entry),
            ),
        };
        HealthReport {
            errno,
            message: message.to_string(),
            issue,
            last_reads,
            connection: None,
        }
    }
}

fn process_block(
    block: &RegisterBlock,
    state: &mut BlockState,
    device: &mut Device,
    cache: &mut ValueCache,
    words: &[u16],
    now: DateTime<Local>,
) {
    if let Some(expansion) = &block.expansion {
        let count = cache
            .number(&device.inverter_key(expansion.count_key))
            .unwrap_or(0.0) as usize;
        if count > 0 && count != state.expanded_count {
            let fields = (expansion.expand)(count);
            match block.check_fields(&fields) {
                Ok(()) => {
                    for field in &fields {
                        cache.declare(device.key(block.class, &field.key), field.meta);
                    }
                    state.expanded = fields;
                    state.expanded_count = count;
                }
                Err(e) => tracing::warn!("Cannot expand {}: {}", block.info, e),
            }
        }
    }

    if !state.initialized {
        for field in &block.fields {
            cache.declare(device.key(block.class, &field.key), field.meta);
        }
        state.initialized = true;
    }

    for field in block.fields.iter().chain(state.expanded.iter()) {
        let key = device.key(block.class, &field.key);
        match field.decode(block.address, words) {
            Ok(Some(value)) if field.force_persist => cache.renew(key, value),
            Ok(Some(value)) => cache.set(key, value),
            Ok(None) => {}
            Err(e) => tracing::warn!("{}", e),
        }
    }

    if let Some(hook) = block.post_hook {
        hook(device, cache, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockTransport, Outcome};
    use crate::pacing::ConnectionOptions;
    use crate::registers::Value;
    use crate::store::MemoryStore;

    const LOW_INTERVAL: Duration = Duration::from_secs(60);

    struct Rig {
        transport: MockTransport,
        session: ModbusSession<MockTransport>,
        engine: RegisterEngine,
        devices: Vec<Device>,
        cache: ValueCache,
        store: MemoryStore,
    }

    impl Rig {
        fn new(units: &[u8]) -> Self {
            let transport = MockTransport::new();
            let options = ConnectionOptions {
                connect_delay_ms: 0,
                ..ConnectionOptions::default()
            };
            Self {
                session: ModbusSession::new(transport.clone(), options),
                transport,
                engine: RegisterEngine::sun2000(LOW_INTERVAL).unwrap(),
                devices: Device::from_units(units),
                cache: ValueCache::new(),
                store: MemoryStore::new(),
            }
        }

        async fn pass(&mut self, tier: RefreshTier) -> usize {
            let deadline = Instant::now() + Duration::from_secs(30);
            self.engine
                .poll(
                    &mut self.session,
                    &mut self.store,
                    &mut self.devices,
                    &mut self.cache,
                    tier,
                    deadline,
                )
                .await
        }

        fn addresses(&self, unit: u8) -> Vec<u16> {
            self.transport
                .read_log()
                .into_iter()
                .filter(|(u, _, _)| *u == unit)
                .map(|(_, address, _)| address)
                .collect()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn high_pass_reads_fast_registers_and_meter_only_on_first_device() {
        let mut rig = Rig::new(&[1, 2]);
        assert_eq!(rig.pass(RefreshTier::High).await, 7);
        assert_eq!(rig.addresses(1), vec![37765, 32080, 32064, 37113]);
        assert_eq!(rig.addresses(2), vec![37765, 32080, 32064]);
    }

    #[tokio::test(start_paused = true)]
    async fn low_pass_respects_floor_and_reads_static_blocks_once() {
        let mut rig = Rig::new(&[1]);
        rig.pass(RefreshTier::High).await;
        let high_reads = rig.transport.reads();

        rig.pass(RefreshTier::Low).await;
        let low: Vec<u16> = rig.addresses(1)[high_reads..].to_vec();
        assert_eq!(low, vec![37000, 30000, 47081, 32000, 37100, 37200, 37700]);

        let before = rig.transport.reads();
        assert_eq!(rig.pass(RefreshTier::Low).await, 0);
        assert_eq!(rig.transport.reads(), before);

        tokio::time::advance(LOW_INTERVAL).await;
        rig.pass(RefreshTier::Low).await;
        let again: Vec<u16> = rig.addresses(1)[before..].to_vec();
        assert_eq!(
            again,
            vec![37765, 32080, 32064, 37113, 37000, 47081, 32000, 37100, 37700]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn decodes_into_device_and_meter_keys() {
        let mut rig = Rig::new(&[1, 2]);
        rig.transport.set_i32(1, 32080, 1200);
        rig.transport.set_i32(2, 32080, 800);
        rig.transport.set_i32(1, 37113, -500);
        rig.transport.set_i32(2, 37113, 9999);

        rig.pass(RefreshTier::High).await;

        assert_eq!(rig.cache.number("inverter.0.activePower"), Some(1.2));
        assert_eq!(rig.cache.number("inverter.1.activePower"), Some(0.8));
        assert_eq!(rig.cache.number("meter.activePower"), Some(-0.5));
        assert_eq!(rig.store.value("inverter.1.activePower"), Some(&Value::Number(0.8)));
    }

    #[tokio::test(start_paused = true)]
    async fn pv_strings_are_expanded_from_the_static_count() {
        let mut rig = Rig::new(&[1]);
        rig.transport.set_registers(1, 30071, &[2]);
        rig.transport.set_registers(1, 32016, &[4123, 761, 3988, 702]);

        rig.pass(RefreshTier::Low).await;

        assert_eq!(rig.cache.number("inverter.0.string.PV1Voltage"), Some(412.3));
        assert_eq!(rig.cache.number("inverter.0.string.PV1Power"), Some(3138.0));
        assert_eq!(rig.cache.number("inverter.0.string.PV2Power"), Some(2800.0));
        assert_eq!(rig.cache.number("inverter.0.string.PV3Voltage"), None);
        assert!(rig.store.object("inverter.0.string.PV2Current").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_device_aborts_only_its_own_pass() {
        let mut rig = Rig::new(&[1, 2]);
        rig.transport.push_read(Outcome::Exception(0x06));

        assert_eq!(rig.pass(RefreshTier::High).await, 3);
        assert_eq!(rig.addresses(1), vec![37765]);
        assert_eq!(rig.addresses(2), vec![37765, 32080, 32064]);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_host_aborts_only_its_own_pass() {
        let mut rig = Rig::new(&[1, 2]);
        rig.transport
            .push_read(Outcome::Io(std::io::ErrorKind::HostUnreachable));

        assert_eq!(rig.pass(RefreshTier::High).await, 3);
        assert_eq!(rig.addresses(1), vec![37765]);
        assert_eq!(rig.addresses(2), vec![37765, 32080, 32064]);
    }

    #[tokio::test(start_paused = true)]
    async fn other_exceptions_skip_only_the_block() {
        let mut rig = Rig::new(&[1]);
        rig.transport.push_read(Outcome::Exception(0x02));

        assert_eq!(rig.pass(RefreshTier::High).await, 3);
        assert_eq!(rig.addresses(1), vec![37765, 32080, 32064, 37113]);
    }

    #[tokio::test(start_paused = true)]
    async fn no_reads_without_budget() {
        let mut rig = Rig::new(&[1]);
        let deadline = Instant::now() + Duration::from_millis(900);
        let read = rig
            .engine
            .poll_device(
                &mut rig.session,
                &mut rig.devices[0],
                &mut rig.cache,
                RefreshTier::High,
                deadline,
            )
            .await;
        assert_eq!(read, 0);
        assert_eq!(rig.transport.reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn initialization_is_tracked_per_device() {
        let mut rig = Rig::new(&[1, 2]);
        let deadline = Instant::now() + Duration::from_secs(30);
        rig.engine
            .poll_device(
                &mut rig.session,
                &mut rig.devices[0],
                &mut rig.cache,
                RefreshTier::High,
                deadline,
            )
            .await;
        rig.cache.flush(&mut rig.store).await;
        assert!(rig.store.object("inverter.0.activePower").is_some());
        assert!(rig.store.object("inverter.1.activePower").is_none());

        rig.pass(RefreshTier::High).await;
        assert!(rig.store.object("inverter.1.activePower").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn health_reports_unreadable_and_stale_devices() {
        let mut rig = Rig::new(&[1, 2]);
        let stale_after = Duration::from_secs(600);

        let report = rig.engine.health(&rig.devices, Instant::now(), stale_after);
        assert_eq!(report.errno, ERRNO_NO_DATA);

        rig.pass(RefreshTier::High).await;
        rig.pass(RefreshTier::Low).await;
        let report = rig.engine.health(&rig.devices, Instant::now(), stale_after);
        assert!(report.is_ok(), "{:?}", report.issue);
        assert_eq!(report.message, "No problems detected");

        tokio::time::advance(Duration::from_secs(300)).await;
        rig.transport.set_offline(2);
        rig.pass(RefreshTier::High).await;
        let report = rig.engine.health(&rig.devices, Instant::now() + stale_after, stale_after);
        assert_eq!(report.errno, ERRNO_STALE);
        let issue = report.issue.unwrap();
        assert_eq!(issue.inverter, 0);
        assert_eq!(issue.address, 37000);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_device_never_read_is_reported() {
        let mut rig = Rig::new(&[1, 2]);
        rig.transport.set_offline(2);
        rig.pass(RefreshTier::High).await;
        rig.pass(RefreshTier::Low).await;

        let report = rig.engine.health(&rig.devices, Instant::now(), Duration::from_secs(600));
        assert_eq!(report.errno, ERRNO_NO_DATA);
        assert_eq!(report.issue.unwrap().modbus_id, 2);
    }
}
