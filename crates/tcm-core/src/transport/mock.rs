//! Scripted bus for unit testing the transport and framer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::traits::{BusType, TcmBus, TransportError};

/// Mock bus: each read pops the next scripted chunk, each write is captured.
pub struct MockBus {
    /// Chunks (or errors) returned by successive reads.
    read_queue: Arc<Mutex<VecDeque<Result<Vec<u8>, String>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    reads_served: Arc<Mutex<usize>>,
    bus_type: BusType,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            read_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            reads_served: Arc::new(Mutex::new(0)),
            bus_type: BusType::Spi,
        }
    }

    pub fn with_bus_type(mut self, bus_type: BusType) -> Self {
        self.bus_type = bus_type;
        self
    }

    /// Queue bytes returned by the next read. Short entries are zero-filled.
    pub fn queue_read(&self, bytes: &[u8]) {
        self.lock_queue().push_back(Ok(bytes.to_vec()));
    }

    /// Queue a complete framed message: header, payload, padding.
    pub fn queue_message(&self, code: u8, payload: &[u8]) {
        let mut msg = vec![
            crate::protocol::MESSAGE_MARKER,
            code,
            payload.len() as u8,
            (payload.len() >> 8) as u8,
        ];
        msg.extend_from_slice(payload);
        msg.push(crate::protocol::MESSAGE_PADDING);
        self.queue_read(&msg);
    }

    /// Queue a framed message as a `head_len` byte first read followed by one
    /// continued-read chunk carrying the rest.
    pub fn queue_continued_message(&self, code: u8, payload: &[u8], head_len: usize) {
        let mut msg = vec![
            crate::protocol::MESSAGE_MARKER,
            code,
            payload.len() as u8,
            (payload.len() >> 8) as u8,
        ];
        msg.extend_from_slice(payload);
        msg.push(crate::protocol::MESSAGE_PADDING);
        if msg.len() <= head_len + 1 {
            self.queue_read(&msg);
            return;
        }
        self.queue_read(&msg[..head_len]);
        let mut rest = vec![
            crate::protocol::MESSAGE_MARKER,
            crate::protocol::STATUS_CONTINUED_READ,
        ];
        rest.extend_from_slice(&msg[head_len..]);
        self.queue_read(&rest);
    }

    /// Make the next read fail.
    pub fn queue_read_error(&self, message: &str) {
        self.lock_queue().push_back(Err(message.to_string()));
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Number of reads answered from the script.
    pub fn reads_served(&self) -> usize {
        *self.reads_served.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pending_reads(&self) -> usize {
        self.lock_queue().len()
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<Vec<u8>, String>>> {
        self.read_queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl TcmBus for MockBus {
    fn read(&self, buf: &mut [u8]) -> Result<(), TransportError> {
        let next = self
            .lock_queue()
            .pop_front()
            .ok_or(TransportError::Timeout { timeout_ms: 0 })?;
        *self.reads_served.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        let bytes = next.map_err(TransportError::ReadFailed)?;
        buf.fill(0);
        let len = bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&bytes[..len]);
        Ok(())
    }

    fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        self.write_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(data.to_vec());
        Ok(())
    }

    fn bus_type(&self) -> BusType {
        self.bus_type
    }
}
