//! Chunked bus transfers.
//!
//! Every transfer runs inside a `BusSession`, which holds the per-device
//! read/write lock. The `in`, `out` and `temp` buffers live behind that same
//! lock, so a session owns them for its whole lifetime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use tracing::{instrument, trace};

use super::buffer::TransportBuffer;
use super::traits::{BusType, TcmBus};
use crate::backoff;
use crate::error::{Result, TcmError};
use crate::protocol::constants::*;

/// Buffers guarded by the read/write lock.
#[derive(Debug)]
pub(crate) struct BusBuffers {
    pub(crate) in_buf: TransportBuffer,
    out: TransportBuffer,
    temp: TransportBuffer,
    /// Bytes requested by the first read of the next message.
    pub(crate) read_length: usize,
}

pub struct ChunkedTransport {
    bus: Arc<dyn TcmBus>,
    rd_chunk: AtomicUsize,
    wr_chunk: AtomicUsize,
    write_delay_us: (u64, u64),
    buffers: Mutex<BusBuffers>,
}

impl ChunkedTransport {
    pub fn new(bus: Arc<dyn TcmBus>, rd_chunk: usize, wr_chunk: usize) -> Self {
        Self {
            bus,
            rd_chunk: AtomicUsize::new(rd_chunk),
            wr_chunk: AtomicUsize::new(wr_chunk),
            write_delay_us: (0, 0),
            buffers: Mutex::new(BusBuffers {
                in_buf: TransportBuffer::new(),
                out: TransportBuffer::new(),
                temp: TransportBuffer::new(),
                read_length: MIN_READ_LENGTH,
            }),
        }
    }

    /// Pause between consecutive write chunks.
    pub fn with_write_delay(mut self, min_us: u64, max_us: u64) -> Self {
        self.write_delay_us = (min_us, max_us);
        self
    }

    /// Take the read/write lock.
    pub fn lock(&self) -> BusSession<'_> {
        let buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        BusSession {
            transport: self,
            buffers,
        }
    }

    /// Take the read/write lock only if nobody holds it.
    pub fn try_lock(&self) -> Option<BusSession<'_>> {
        let buffers = match self.buffers.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(BusSession {
            transport: self,
            buffers,
        })
    }

    pub fn rd_chunk_size(&self) -> usize {
        self.rd_chunk.load(Ordering::SeqCst)
    }

    pub fn wr_chunk_size(&self) -> usize {
        self.wr_chunk.load(Ordering::SeqCst)
    }

    pub fn set_rd_chunk_size(&self, size: usize) {
        self.rd_chunk.store(size, Ordering::SeqCst);
    }

    pub fn set_wr_chunk_size(&self, size: usize) {
        self.wr_chunk.store(size, Ordering::SeqCst);
    }

    pub fn bus_type(&self) -> BusType {
        self.bus.bus_type()
    }
}

/// Payload bytes per read chunk after the marker and code bytes.
fn read_chunk_space(rd_chunk: usize, remaining: usize) -> Result<usize> {
    match rd_chunk {
        0 => Ok(remaining),
        n if n <= READ_CHUNK_OVERHEAD => Err(TcmError::InvalidLength(format!(
            "read chunk size {n} leaves no payload space"
        ))),
        n => Ok(n - READ_CHUNK_OVERHEAD),
    }
}

/// Payload bytes per write chunk after the command byte.
fn write_chunk_space(wr_chunk: usize, remaining: usize) -> Result<usize> {
    match wr_chunk {
        0 => Ok(remaining),
        n if n <= WRITE_CHUNK_OVERHEAD => Err(TcmError::InvalidLength(format!(
            "write chunk size {n} leaves no payload space"
        ))),
        n => Ok(n - WRITE_CHUNK_OVERHEAD),
    }
}

/// Exclusive access to the bus and its transfer buffers.
pub struct BusSession<'a> {
    transport: &'a ChunkedTransport,
    buffers: MutexGuard<'a, BusBuffers>,
}

impl BusSession<'_> {
    pub(crate) fn buffers_mut(&mut self) -> &mut BusBuffers {
        &mut self.buffers
    }

    pub fn rd_chunk_size(&self) -> usize {
        self.transport.rd_chunk_size()
    }

    /// Current inbound buffer contents (header + payload + padding).
    pub fn in_buf(&self) -> &TransportBuffer {
        &self.buffers.in_buf
    }

    pub fn read_length(&self) -> usize {
        self.buffers.read_length
    }

    pub fn set_read_length(&mut self, len: usize) {
        self.buffers.read_length = len;
    }

    /// Single transaction of `len` bytes into the start of the in buffer.
    pub fn read_head(&mut self, len: usize) -> Result<()> {
        let in_buf = &mut self.buffers.in_buf;
        in_buf.alloc(len);
        self.transport.bus.read(&mut in_buf.as_mut_slice()[..len])?;
        in_buf.set_data_length(len);
        Ok(())
    }

    /// One-byte probe; the controller answers with the message marker when alive.
    pub fn read_marker(&mut self) -> Result<u8> {
        let mut marker = [0u8; 1];
        self.transport.bus.read(&mut marker)?;
        Ok(marker[0])
    }

    /// Fetch the rest of a message into the in buffer, starting at `offset`.
    ///
    /// Every chunk must lead with the marker and the continued-read code.
    #[instrument(level = "trace", skip(self))]
    pub fn continued_read(&mut self, offset: usize, total_length: usize) -> Result<()> {
        let rd_chunk = self.transport.rd_chunk_size();
        let BusBuffers { in_buf, temp, .. } = &mut *self.buffers;

        in_buf.realloc(total_length + 1);

        let mut remaining = total_length.saturating_sub(offset);
        let chunk_space = read_chunk_space(rd_chunk, remaining)?;
        let mut offset = offset;

        while remaining > 0 {
            let xfer = remaining.min(chunk_space);

            // A one-byte chunk is the trailing padding; the wire never carries it.
            if xfer == 1 {
                in_buf.as_mut_slice()[offset] = MESSAGE_PADDING;
                offset += 1;
                remaining -= 1;
                continue;
            }

            temp.alloc(xfer + READ_CHUNK_OVERHEAD);
            self.transport
                .bus
                .read(&mut temp.as_mut_slice()[..xfer + READ_CHUNK_OVERHEAD])?;

            let head = temp.as_slice();
            if head[0] != MESSAGE_MARKER || head[1] != STATUS_CONTINUED_READ {
                return Err(TcmError::ContinuedRead {
                    marker: head[0],
                    code: head[1],
                });
            }

            in_buf.copy_in(offset, &head[READ_CHUNK_OVERHEAD..], xfer)?;
            trace!(offset, xfer, "Continued read chunk");
            offset += xfer;
            remaining -= xfer;
        }

        in_buf.set_data_length(total_length);
        Ok(())
    }

    /// Read exactly `dest.len()` bytes without message framing.
    ///
    /// The first chunk is copied with its marker and code bytes; later chunks
    /// must carry the continued-read code and contribute payload only.
    pub fn raw_read(&mut self, dest: &mut [u8]) -> Result<()> {
        let length = dest.len();
        if length < READ_CHUNK_OVERHEAD {
            return Err(TcmError::InvalidLength(format!(
                "raw read of {length} bytes"
            )));
        }

        let rd_chunk = self.transport.rd_chunk_size();
        let temp = &mut self.buffers.temp;

        let mut remaining = length - READ_CHUNK_OVERHEAD;
        let chunk_space = read_chunk_space(rd_chunk, remaining)?;
        let mut offset = 0;
        let mut first = true;

        loop {
            let xfer = remaining.min(chunk_space);

            if !first && xfer == 1 {
                dest[offset] = MESSAGE_PADDING;
                offset += 1;
                remaining -= 1;
            } else {
                temp.alloc(xfer + READ_CHUNK_OVERHEAD);
                let chunk = &mut temp.as_mut_slice()[..xfer + READ_CHUNK_OVERHEAD];
                self.transport.bus.read(chunk)?;

                if first {
                    dest[..chunk.len()].copy_from_slice(chunk);
                    offset += chunk.len();
                } else {
                    if chunk[0] != MESSAGE_MARKER || chunk[1] != STATUS_CONTINUED_READ {
                        return Err(TcmError::ContinuedRead {
                            marker: chunk[0],
                            code: chunk[1],
                        });
                    }
                    dest[offset..offset + xfer].copy_from_slice(&chunk[READ_CHUNK_OVERHEAD..]);
                    offset += xfer;
                }
                remaining -= xfer;
            }

            first = false;
            if remaining == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Send `command` followed by `data` with no length prefix.
    #[instrument(level = "trace", skip_all, fields(command = %format!("0x{:02X}", command), len = data.len()))]
    pub fn raw_write(&mut self, command: u8, data: &[u8]) -> Result<usize> {
        let chunk_space = write_chunk_space(self.transport.wr_chunk_size(), data.len())?;
        self.write_chunks(command, &[], data, chunk_space)
    }

    /// Send `[command][len_lo][len_hi][payload]`, split into write chunks.
    ///
    /// ROM-boot download payloads are cut on `ROMBOOT_DOWNLOAD_UNIT` boundaries.
    /// Returns the number of bus transactions issued.
    #[instrument(level = "trace", skip_all, fields(command = %format!("0x{:02X}", command), len = payload.len()))]
    pub fn write_command(&mut self, command: u8, payload: &[u8]) -> Result<usize> {
        let length = u16::try_from(payload.len()).map_err(|_| {
            TcmError::InvalidLength(format!("payload of {} bytes", payload.len()))
        })?;
        let prefix = length.to_le_bytes();
        let remaining = payload.len() + prefix.len();
        let wr_chunk = self.transport.wr_chunk_size();

        let chunk_space = if command == CMD_ROMBOOT_DOWNLOAD && wr_chunk != 0 {
            let space = write_chunk_space(wr_chunk, remaining)?;
            let aligned = space - space % ROMBOOT_DOWNLOAD_UNIT;
            if aligned == 0 {
                return Err(TcmError::InvalidLength(format!(
                    "write chunk size {wr_chunk} below ROM-boot download unit"
                )));
            }
            aligned
        } else {
            write_chunk_space(wr_chunk, remaining)?
        };

        self.write_chunks(command, &prefix, payload, chunk_space)
    }

    /// Emit `prefix ++ data` behind `command`, continuation chunks behind
    /// `CMD_CONTINUE_WRITE`.
    fn write_chunks(
        &mut self,
        command: u8,
        prefix: &[u8],
        data: &[u8],
        chunk_space: usize,
    ) -> Result<usize> {
        let out = &mut self.buffers.out;
        let mut remaining = prefix.len() + data.len();
        let mut offset = 0;
        let mut chunks = 0;

        loop {
            let xfer = remaining.min(chunk_space);
            out.alloc(xfer + WRITE_CHUNK_OVERHEAD);
            let chunk = &mut out.as_mut_slice()[..xfer + WRITE_CHUNK_OVERHEAD];
            chunk[0] = if chunks == 0 { command } else { CMD_CONTINUE_WRITE };
            for (i, slot) in chunk[WRITE_CHUNK_OVERHEAD..].iter_mut().enumerate() {
                let pos = offset + i;
                *slot = match prefix.get(pos) {
                    Some(&b) => b,
                    None => data[pos - prefix.len()],
                };
            }

            self.transport.bus.write(chunk)?;
            chunks += 1;
            offset += xfer;
            remaining -= xfer;

            if remaining == 0 {
                break;
            }
            let (min, max) = self.transport.write_delay_us;
            backoff::sleep_range_us(min, max);
        }

        trace!(chunks, "Write complete");
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockBus;

    fn transport(mock: &Arc<MockBus>, rd: usize, wr: usize) -> ChunkedTransport {
        ChunkedTransport::new(mock.clone(), rd, wr)
    }

    /// Strip chunk headers and glue the command stream back together.
    fn reassemble(writes: &[Vec<u8>]) -> Vec<u8> {
        writes.iter().flat_map(|w| w[1..].to_vec()).collect()
    }

    #[test]
    fn test_write_command_single_chunk() {
        let mock = Arc::new(MockBus::new());
        let t = transport(&mock, 0, 0);
        let chunks = t.lock().write_command(CMD_SET_DYNAMIC_CONFIG, &[7, 1, 0]).unwrap();
        assert_eq!(chunks, 1);
        assert_eq!(mock.get_writes(), vec![vec![0x24, 3, 0, 7, 1, 0]]);
    }

    #[test]
    fn test_write_command_splits_into_chunks() {
        let mock = Arc::new(MockBus::new());
        let t = transport(&mock, 0, 5);
        let payload: Vec<u8> = (0..10).collect();

        let chunks = t.lock().write_command(0x30, &payload).unwrap();

        // 12 bytes of stream, 4 per chunk.
        assert_eq!(chunks, 3);
        let writes = mock.get_writes();
        assert_eq!(writes[0], vec![0x30, 10, 0, 0, 1]);
        assert_eq!(writes[1][0], CMD_CONTINUE_WRITE);
        assert_eq!(writes[2][0], CMD_CONTINUE_WRITE);
        assert!(writes.iter().all(|w| w.len() <= 5));

        let stream = reassemble(&writes);
        assert_eq!(&stream[..2], &[10, 0]);
        assert_eq!(&stream[2..], payload.as_slice());
    }

    #[test]
    fn test_chunk_count_matches_ceiling() {
        for (len, wr) in [(0usize, 4usize), (1, 4), (7, 8), (30, 8), (61, 16)] {
            let mock = Arc::new(MockBus::new());
            let t = transport(&mock, 0, wr);
            let payload = vec![0xEE; len];
            let chunks = t.lock().write_command(0x22, &payload).unwrap();
            let space = wr - 1;
            assert_eq!(chunks, (len + 2).div_ceil(space), "len={len} wr={wr}");
            assert_eq!(reassemble(&mock.get_writes())[2..], payload[..]);
        }
    }

    #[test]
    fn test_romboot_download_alignment() {
        let mock = Arc::new(MockBus::new());
        let t = transport(&mock, 0, 40);
        let payload = vec![0x11; 60];
        t.lock().write_command(CMD_ROMBOOT_DOWNLOAD, &payload).unwrap();

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].len(), 33);
        assert_eq!(writes[1].len(), 31);
    }

    #[test]
    fn test_raw_write_has_no_length_prefix() {
        let mock = Arc::new(MockBus::new());
        let t = transport(&mock, 0, 3);
        t.lock().raw_write(0x41, &[1, 2, 3]).unwrap();
        assert_eq!(
            mock.get_writes(),
            vec![vec![0x41, 1, 2], vec![CMD_CONTINUE_WRITE, 3]]
        );
    }

    #[test]
    fn test_write_rejects_zero_chunk_space() {
        let mock = Arc::new(MockBus::new());
        let t = transport(&mock, 0, 1);
        assert!(matches!(
            t.lock().write_command(CMD_IDENTIFY, &[]),
            Err(TcmError::InvalidLength(_))
        ));
        assert!(mock.get_writes().is_empty());
    }

    #[test]
    fn test_continued_read_assembles_message() {
        let mock = Arc::new(MockBus::new());
        let t = transport(&mock, 6, 0);
        // Message: header(4) + payload [1..=6] + padding = 11 bytes, 5 already read.
        mock.queue_read(&[MESSAGE_MARKER, STATUS_CONTINUED_READ, 2, 3, 4, 5]);
        mock.queue_read(&[MESSAGE_MARKER, STATUS_CONTINUED_READ, 6, MESSAGE_PADDING]);

        let mut session = t.lock();
        session.buffers_mut().in_buf.alloc(5);
        session.buffers_mut().in_buf.as_mut_slice()[..5]
            .copy_from_slice(&[MESSAGE_MARKER, STATUS_OK, 6, 0, 1]);
        session.continued_read(5, 11).unwrap();

        assert_eq!(
            &session.in_buf().as_slice()[..11],
            &[0xA5, 0x01, 6, 0, 1, 2, 3, 4, 5, 6, MESSAGE_PADDING]
        );
    }

    #[test]
    fn test_continued_read_skips_single_padding_byte() {
        let mock = Arc::new(MockBus::new());
        let t = transport(&mock, 6, 0);
        mock.queue_read(&[MESSAGE_MARKER, STATUS_CONTINUED_READ, 2, 3, 4, 5]);

        let mut session = t.lock();
        session.buffers_mut().in_buf.alloc(5);
        session.continued_read(5, 10).unwrap();

        assert_eq!(session.in_buf().as_slice()[9], MESSAGE_PADDING);
        // Only one bus transaction.
        assert_eq!(mock.reads_served(), 1);
    }

    #[test]
    fn test_continued_read_rejects_bad_chunk() {
        let mock = Arc::new(MockBus::new());
        let t = transport(&mock, 0, 0);
        mock.queue_read(&[MESSAGE_MARKER, STATUS_OK, 0, 0, 0]);

        let mut session = t.lock();
        session.buffers_mut().in_buf.alloc(9);
        assert!(matches!(
            session.continued_read(9, 12),
            Err(TcmError::ContinuedRead {
                marker: 0xA5,
                code: 0x01
            })
        ));
    }

    #[test]
    fn test_raw_read_chunks() {
        let mock = Arc::new(MockBus::new());
        let t = transport(&mock, 6, 0);
        mock.queue_read(&[0xA5, 0x01, 10, 11, 12, 13]);
        mock.queue_read(&[0xA5, STATUS_CONTINUED_READ, 14, 15, 16, 17]);

        let mut dest = [0u8; 10];
        t.lock().raw_read(&mut dest).unwrap();
        assert_eq!(dest, [0xA5, 0x01, 10, 11, 12, 13, 14, 15, 16, 17]);
    }

    #[test]
    fn test_raw_read_too_short() {
        let mock = Arc::new(MockBus::new());
        let t = transport(&mock, 0, 0);
        let mut dest = [0u8; 1];
        assert!(matches!(
            t.lock().raw_read(&mut dest),
            Err(TcmError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_try_lock_while_held() {
        let mock = Arc::new(MockBus::new());
        let t = transport(&mock, 0, 0);
        let session = t.lock();
        assert!(t.try_lock().is_none());
        drop(session);
        assert!(t.try_lock().is_some());
    }
}
