//! Scripted transport used by unit tests to emulate an inverter.

use crate::error::{ModbusExceptionCode, Result, Sun2000Error};
use crate::transport::Transport;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

/// Scripted result of a single transaction.
#[derive(Debug, Clone)]
pub enum Outcome {
    Words(Vec<u16>),
    Exception(u8),
    Io(io::ErrorKind),
    /// Never answer; lets the caller's timeout fire.
    Stall,
}

impl Outcome {
    fn error(&self) -> Option<Sun2000Error> {
        match self {
            Outcome::Exception(code) => Some(Sun2000Error::ModbusException(
                ModbusExceptionCode::from_u8(*code),
            )),
            Outcome::Io(kind) => Some(Sun2000Error::Io(io::Error::from(*kind))),
            Outcome::Words(_) | Outcome::Stall => None,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    open: bool,
    connects: usize,
    resets: usize,
    connect_script: VecDeque<Outcome>,
    read_script: VecDeque<Outcome>,
    memory: HashMap<(u8, u16), u16>,
    offline: HashSet<u8>,
    reads: Vec<(u8, u16, u16)>,
    written: Vec<(u8, u16, Vec<u16>)>,
}

/// Transport backed by an in-memory register map.
///
/// Clones share their state, so a test can keep a handle after moving the
/// transport into a session. Scripted read outcomes take precedence over the
/// register map; unscripted reads of unknown registers return zeros.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_connects(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.state().connect_script.extend(outcomes);
    }

    pub fn push_read(&self, outcome: Outcome) {
        self.state().read_script.push_back(outcome);
    }

    pub fn set_registers(&self, unit: u8, address: u16, words: &[u16]) {
        let mut state = self.state();
        for (offset, word) in words.iter().enumerate() {
            state.memory.insert((unit, address + offset as u16), *word);
        }
    }

    pub fn set_u32(&self, unit: u8, address: u16, value: u32) {
        self.set_registers(unit, address, &[(value >> 16) as u16, value as u16]);
    }

    pub fn set_i32(&self, unit: u8, address: u16, value: i32) {
        self.set_u32(unit, address, value as u32);
    }

    /// Every read addressed to `unit` fails with a gateway exception.
    pub fn set_offline(&self, unit: u8) {
        self.state().offline.insert(unit);
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn resets(&self) -> usize {
        self.state().resets
    }

    pub fn reads(&self) -> usize {
        self.state().reads.len()
    }

    pub fn read_log(&self) -> Vec<(u8, u16, u16)> {
        self.state().reads.clone()
    }

    pub fn written(&self) -> Vec<(u8, u16, Vec<u16>)> {
        self.state().written.clone()
    }
}

impl Transport for MockTransport {
    fn is_open(&self) -> bool {
        self.state().open
    }

    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state();
        state.connects += 1;
        if let Some(err) = state.connect_script.pop_front().and_then(|o| o.error()) {
            return Err(err);
        }
        state.open = true;
        Ok(())
    }

    async fn close(&mut self) {
        self.state().open = false;
    }

    fn reset(&mut self) {
        let mut state = self.state();
        state.open = false;
        state.resets += 1;
    }

    async fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let outcome = {
            let mut state = self.state();
            state.reads.push((unit, address, count));
            if state.offline.contains(&unit) {
                Some(Outcome::Exception(0x0B))
            } else {
                state.read_script.pop_front()
            }
        };

        match outcome {
            Some(Outcome::Words(words)) => Ok(words),
            Some(Outcome::Stall) => std::future::pending().await,
            Some(other) => Err(other.error().unwrap_or_else(|| {
                Sun2000Error::InvalidResponse("unscripted outcome".to_string())
            })),
            None => {
                let state = self.state();
                Ok((0..count)
                    .map(|i| {
                        state
                            .memory
                            .get(&(unit, address + i))
                            .copied()
                            .unwrap_or(0)
                    })
                    .collect())
            }
        }
    }

    async fn write_multiple_registers(
        &mut self,
        unit: u8,
        address: u16,
        words: &[u16],
    ) -> Result<()> {
        let mut state = self.state();
        state.written.push((unit, address, words.to_vec()));
        for (offset, word) in words.iter().enumerate() {
            state.memory.insert((unit, address + offset as u16), *word);
        }
        Ok(())
    }
}
