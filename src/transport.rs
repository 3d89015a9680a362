use crate::error::Result;
use std::future::Future;

/// Raw link to a Modbus device.
///
/// Implementations own exactly one physical connection and do no pacing,
/// retrying or timeout handling of their own; `ModbusSession` layers those
/// on top.
pub trait Transport {
    fn is_open(&self) -> bool;

    /// Open the connection. Called only while the link is closed.
    fn connect(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Close the connection, keeping the transport reusable.
    fn close(&mut self) -> impl Future<Output = ()> + Send;

    /// Throw away the underlying handle so the next `connect` starts from a
    /// fresh socket. A handle that saw a socket error is never reused.
    fn reset(&mut self);

    /// Read `count` holding registers (function 0x03) from `unit`.
    fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>>> + Send;

    /// Write holding registers (function 0x10) on `unit`.
    fn write_multiple_registers(
        &mut self,
        unit: u8,
        address: u16,
        words: &[u16],
    ) -> impl Future<Output = Result<()>> + Send;
}
