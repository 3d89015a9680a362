//! Exclusive Modbus session with adaptive pacing and reconnection.
//!
//! The inverter accepts a single Modbus-TCP client. `ModbusSession` owns that
//! connection, opens it lazily, spaces requests according to the
//! [`DelayController`] and decides after each failure whether the socket has
//! to be rebuilt.

use crate::error::{ModbusExceptionCode, Result, Sun2000Error};
use crate::pacing::{Calibration, ConnectionOptions, ConnectionStats, DelayController};
use crate::transport::Transport;
use serde::Serialize;
use std::time::Duration;

/// Wait before the single automatic reconnect attempt.
pub const RECONNECT_BACKOFF: Duration = Duration::from_millis(2_000);
/// Backoff multiplier when the OS reports the host as unreachable.
pub const UNREACHABLE_FACTOR: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Closed,
    Connecting,
    Open,
}

/// Diagnostic snapshot of the session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub state: SessionState,
    pub options: ConnectionOptions,
    pub stats: ConnectionStats,
}

pub struct ModbusSession<T> {
    transport: T,
    pacer: DelayController,
    state: SessionState,
    calibration: Option<Calibration>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for ModbusSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusSession")
            .field("transport", &self.transport)
            .field("state", &self.state)
            .field("options", self.pacer.options())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> ModbusSession<T> {
    pub fn new(transport: T, options: ConnectionOptions) -> Self {
        Self {
            transport,
            pacer: DelayController::new(options),
            state: SessionState::Closed,
            calibration: None,
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            state: self.state,
            options: *self.pacer.options(),
            stats: *self.pacer.stats(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open && self.transport.is_open()
    }

    /// Result of a calibration run that finished since the last call.
    pub fn take_calibration(&mut self) -> Option<Calibration> {
        self.calibration.take()
    }

    /// Ensure the connection is open. A no-op when it already is.
    pub async fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        self.connect().await
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
        self.state = SessionState::Closed;
    }

    /// Connect, retrying once after a backoff. A second consecutive failure
    /// is returned to the caller.
    async fn connect(&mut self) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.try_connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!("Couldn't connect Modbus TCP: {}", e);
                    self.check_error(&e).await;
                    if attempt > 0 {
                        return Err(e);
                    }
                    let backoff = if e.is_host_unreachable() {
                        RECONNECT_BACKOFF * UNREACHABLE_FACTOR
                    } else {
                        RECONNECT_BACKOFF
                    };
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn try_connect(&mut self) -> Result<()> {
        if self.transport.is_open() {
            self.close().await;
        }
        tracing::info!("Open Connection...");
        self.state = SessionState::Connecting;

        let timeout = self.pacer.options().timeout();
        match tokio::time::timeout(timeout, self.transport.connect()).await {
            Ok(result) => result?,
            Err(_) => return Err(Sun2000Error::Timeout(timeout)),
        }

        tokio::time::sleep(self.pacer.options().connect_delay()).await;
        self.state = SessionState::Open;
        self.pacer.reset_transaction();
        tracing::info!("Connected Modbus TCP");
        Ok(())
    }

    /// Read `count` holding registers from `unit`.
    pub async fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        self.open().await?;
        self.pace().await;

        let timeout = self.pacer.options().timeout();
        let result = match tokio::time::timeout(
            timeout,
            self.transport.read_holding_registers(unit, address, count),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Sun2000Error::Timeout(timeout)),
        };

        match result {
            Ok(words) => {
                self.record_success(count);
                Ok(words)
            }
            Err(e) => {
                self.check_error(&e).await;
                Err(e)
            }
        }
    }

    /// Write holding registers on `unit`.
    pub async fn write_registers(&mut self, unit: u8, address: u16, words: &[u16]) -> Result<()> {
        self.open().await?;
        self.pace().await;

        let timeout = self.pacer.options().timeout();
        let result = match tokio::time::timeout(
            timeout,
            self.transport.write_multiple_registers(unit, address, words),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Sun2000Error::Timeout(timeout)),
        };

        match result {
            Ok(()) => {
                self.record_success(words.len() as u16);
                Ok(())
            }
            Err(e) => {
                self.check_error(&e).await;
                Err(e)
            }
        }
    }

    async fn pace(&self) {
        let wait = self.pacer.pacing_delay();
        if !wait.is_zero() {
            tracing::debug!(
                "Wait... {} ms; registers moved before: {}",
                wait.as_millis(),
                self.pacer.stats().last_transaction_length
            );
            tokio::time::sleep(wait).await;
        }
    }

    fn record_success(&mut self, length: u16) {
        self.pacer.record_transaction(length);
        if let Some(calibration) = self.pacer.on_success() {
            self.calibration = Some(calibration);
        }
    }

    /// Classify a failed transaction and recover the link.
    async fn check_error(&mut self, err: &Sun2000Error) {
        tracing::debug!("Modbus error: {:?}", err);
        self.close().await;
        match err.exception_code() {
            None => {
                self.pacer.on_failure();
                self.transport.reset();
                if err.is_connection_refused() {
                    tracing::warn!("Has another device interrupted the modbus connection?");
                    tracing::warn!("Only 1 client is allowed to connect to modbus at the same time!");
                }
            }
            Some(ModbusExceptionCode::SlaveDeviceBusy) => self.pacer.on_failure(),
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockTransport, Outcome};
    use std::io;

    fn refused() -> Outcome {
        Outcome::Io(io::ErrorKind::ConnectionRefused)
    }

    fn quick_options() -> ConnectionOptions {
        ConnectionOptions {
            connect_delay_ms: 0,
            ..ConnectionOptions::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_is_a_no_op_when_already_open() {
        let mut session = ModbusSession::new(MockTransport::new(), quick_options());
        session.open().await.unwrap();
        session.open().await.unwrap();
        assert_eq!(session.transport().connects(), 1);
        assert_eq!(session.info().state, SessionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn second_connect_failure_is_propagated() {
        let transport = MockTransport::new();
        transport.fail_connects([refused(), refused(), refused()]);
        let mut session = ModbusSession::new(transport, quick_options());

        let started = tokio::time::Instant::now();
        let err = session.read_holding_registers(1, 32080, 2).await.unwrap_err();

        assert!(err.is_connection_refused());
        assert_eq!(session.transport().connects(), 2);
        assert_eq!(session.transport().resets(), 2);
        assert_eq!(session.transport().reads(), 0);
        assert_eq!(session.info().stats.error_streak, 2);
        assert!(started.elapsed() >= RECONNECT_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn one_connect_failure_is_retried() {
        let transport = MockTransport::new();
        transport.fail_connects([refused()]);
        transport.push_read(Outcome::Words(vec![0, 37000]));
        let mut session = ModbusSession::new(transport, quick_options());

        let words = session.read_holding_registers(1, 32080, 2).await.unwrap();

        assert_eq!(words, vec![0, 37000]);
        assert_eq!(session.transport().connects(), 2);
        assert!(session.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_host_backs_off_ten_times_longer() {
        let transport = MockTransport::new();
        transport.fail_connects([Outcome::Io(io::ErrorKind::HostUnreachable)]);
        let mut session = ModbusSession::new(transport, quick_options());

        let started = tokio::time::Instant::now();
        session.open().await.unwrap();
        assert!(started.elapsed() >= RECONNECT_BACKOFF * UNREACHABLE_FACTOR);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_device_keeps_the_transport() {
        let transport = MockTransport::new();
        transport.push_read(Outcome::Exception(0x06));
        let mut session = ModbusSession::new(transport, quick_options());

        let err = session.read_holding_registers(1, 37000, 68).await.unwrap_err();

        assert!(err.is_device_busy());
        assert_eq!(session.transport().resets(), 0);
        assert_eq!(session.info().stats.error_streak, 1);
        assert!(!session.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn other_exceptions_are_not_a_pacing_problem() {
        let transport = MockTransport::new();
        transport.push_read(Outcome::Exception(0x02));
        let mut session = ModbusSession::new(transport, quick_options());

        let err = session.read_holding_registers(1, 47081, 8).await.unwrap_err();

        assert_eq!(err.exception_code(), Some(ModbusExceptionCode::IllegalDataAddress));
        assert_eq!(session.info().stats.error_streak, 0);
        assert_eq!(session.transport().resets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn socket_error_during_read_rebuilds_the_transport() {
        let transport = MockTransport::new();
        transport.push_read(Outcome::Io(io::ErrorKind::ConnectionReset));
        transport.push_read(Outcome::Words(vec![7]));
        let mut session = ModbusSession::new(transport, quick_options());

        assert!(session.read_holding_registers(1, 30071, 1).await.is_err());
        assert_eq!(session.transport().resets(), 1);

        let words = session.read_holding_registers(1, 30071, 1).await.unwrap();
        assert_eq!(words, vec![7]);
        assert_eq!(session.transport().connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_read_times_out() {
        let transport = MockTransport::new();
        transport.push_read(Outcome::Stall);
        let options = ConnectionOptions {
            timeout_ms: 500,
            ..quick_options()
        };
        let mut session = ModbusSession::new(transport, options);

        let err = session.read_holding_registers(1, 32080, 2).await.unwrap_err();
        assert!(matches!(err, Sun2000Error::Timeout(t) if t == Duration::from_millis(500)));
        assert_eq!(session.transport().resets(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reads_are_paced_by_previous_length() {
        let transport = MockTransport::new();
        transport.push_read(Outcome::Words(vec![0; 75]));
        transport.push_read(Outcome::Words(vec![0; 2]));
        let options = ConnectionOptions {
            delay_ms: 1000,
            ..quick_options()
        };
        let mut session = ModbusSession::new(transport, options);

        let started = tokio::time::Instant::now();
        session.read_holding_registers(1, 32000, 75).await.unwrap();
        let first = started.elapsed();
        assert!(first >= Duration::from_millis(400) && first < Duration::from_millis(500));

        let started = tokio::time::Instant::now();
        session.read_holding_registers(1, 32080, 2).await.unwrap();
        let second = started.elapsed();
        assert!(second >= Duration::from_millis(1000) && second < Duration::from_millis(1100));
        assert_eq!(session.info().stats.last_transaction_length, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_are_accounted_like_reads() {
        let transport = MockTransport::new();
        let mut session = ModbusSession::new(transport, quick_options());

        session.write_registers(1, 47086, &[5, 1, 500]).await.unwrap();

        assert_eq!(session.transport().written(), vec![(1, 47086, vec![5, 1, 500])]);
        assert_eq!(session.info().stats.last_transaction_length, 3);
        assert_eq!(session.info().stats.success_lifetime, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_result_is_handed_out_once() {
        let transport = MockTransport::new();
        let mut session =
            ModbusSession::new(transport, ConnectionOptions::default().calibrating());

        for _ in 0..50 {
            session.read_holding_registers(1, 32080, 2).await.unwrap();
        }

        let calibration = session.take_calibration().expect("calibration finished");
        assert_eq!(calibration.delay_ms, 0);
        assert!(session.take_calibration().is_none());
        assert!(!session.info().options.auto_adjust);
    }
}
