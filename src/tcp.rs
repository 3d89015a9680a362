//! Modbus-TCP transport.
//!
//! This module provides a TCP transport that implements the `Transport` trait,
//! using `tokio-modbus` for the underlying Modbus-TCP communication.

use crate::error::{ModbusExceptionCode, Result, Sun2000Error};
use crate::transport::Transport;
use std::net::SocketAddr;
use tokio_modbus::client::{Client, Context, Reader, Writer};
use tokio_modbus::slave::{Slave, SlaveContext};

/// Default Modbus-TCP port of the SUN2000 SDongle / internal WLAN.
pub const DEFAULT_PORT: u16 = 502;

/// TCP transport for Modbus-TCP communication.
///
/// Wraps a `tokio-modbus` client context. The context is created by
/// `connect` and dropped by `close`/`reset`, so a failed socket never
/// carries over into the next connection.
pub struct TcpTransport {
    addr: SocketAddr,
    ctx: Option<Context>,
    unit: Option<u8>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("addr", &self.addr)
            .field("open", &self.ctx.is_some())
            .finish_non_exhaustive()
    }
}

impl TcpTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            ctx: None,
            unit: None,
        }
    }

    /// Resolve `host:port` and create a transport for the first address found.
    pub async fn resolve(host: &str, port: u16) -> Result<Self> {
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| Sun2000Error::Config(format!("cannot resolve {host}:{port}")))?;
        Ok(Self::new(addr))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn context(&mut self, unit: u8) -> Result<&mut Context> {
        let ctx = self.ctx.as_mut().ok_or_else(|| {
            Sun2000Error::Io(std::io::Error::from(std::io::ErrorKind::NotConnected))
        })?;
        if self.unit != Some(unit) {
            ctx.set_slave(Slave(unit));
            self.unit = Some(unit);
        }
        Ok(ctx)
    }
}

impl Transport for TcpTransport {
    fn is_open(&self) -> bool {
        self.ctx.is_some()
    }

    async fn connect(&mut self) -> Result<()> {
        let ctx = tokio_modbus::client::tcp::connect(self.addr).await?;
        self.ctx = Some(ctx);
        self.unit = None;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            if let Err(e) = ctx.disconnect().await {
                tracing::debug!("Disconnect from {} failed: {}", self.addr, e);
            }
        }
    }

    fn reset(&mut self) {
        self.ctx = None;
        self.unit = None;
    }

    async fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let ctx = self.context(unit)?;
        let words = from_modbus(ctx.read_holding_registers(address, count).await)?;
        if words.len() != count as usize {
            return Err(Sun2000Error::InvalidResponse(format!(
                "expected {} registers from {}, got {}",
                count,
                address,
                words.len()
            )));
        }
        Ok(words)
    }

    async fn write_multiple_registers(
        &mut self,
        unit: u8,
        address: u16,
        words: &[u16],
    ) -> Result<()> {
        let ctx = self.context(unit)?;
        from_modbus(ctx.write_multiple_registers(address, words).await)
    }
}

fn from_modbus<T>(result: tokio_modbus::Result<T>) -> Result<T> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(exception)) => Err(Sun2000Error::ModbusException(
            ModbusExceptionCode::from_u8(u8::from(exception)),
        )),
        Err(tokio_modbus::Error::Transport(e)) => Err(Sun2000Error::Io(e)),
        Err(e) => Err(Sun2000Error::InvalidResponse(e.to_string())),
    }
}
