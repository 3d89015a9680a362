pub mod aggregate;
pub mod cache;
pub mod collector;
pub mod device;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod integrator;
pub mod pacing;
pub mod registers;
pub mod session;
pub mod store;
pub mod table;
pub mod tcp;
pub mod transport;

#[cfg(test)]
mod mock;

pub use cache::ValueCache;
pub use collector::{Collector, Settings, Verdict, Watchdog};
pub use device::{Device, DeviceInfo};
pub use engine::{HealthReport, RegisterEngine};
pub use error::{ModbusExceptionCode, Result, Sun2000Error};
pub use pacing::{Calibration, ConnectionOptions};
pub use registers::{Field, Meta, RefreshTier, RegisterBlock, Value};
pub use session::{ConnectionInfo, ModbusSession};
pub use store::{FileStore, MemoryStore, Store};
pub use tcp::TcpTransport;
pub use transport::Transport;
