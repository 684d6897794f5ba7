//! Message framing on top of the chunked transport.
//!
//! A read fetches `read_length` bytes, validates the header marker, then pulls
//! any remainder of the announced payload through continued reads. With
//! predictive reading the next `read_length` is sized from the message just
//! received, so typical reports arrive in a single transaction.

use std::cell::Cell;

use tracing::{debug, instrument, warn};

use crate::backoff;
use crate::config::DriverConfig;
use crate::error::{Result, TcmError};
use crate::protocol::constants::*;
use crate::protocol::{MessageHeader, StatusCode};
use crate::transport::BusSession;

thread_local! {
    static IN_DISPATCH: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as reading and dispatching a message.
///
/// Blocking command submission checks this to refuse reentry.
pub(crate) struct DispatchScope {
    previous: bool,
}

impl DispatchScope {
    pub(crate) fn enter() -> Self {
        let previous = IN_DISPATCH.with(|flag| flag.replace(true));
        Self { previous }
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        IN_DISPATCH.with(|flag| flag.set(self.previous));
    }
}

/// Whether the calling thread is inside message dispatch.
pub fn in_dispatch() -> bool {
    IN_DISPATCH.with(|flag| flag.get())
}

/// A complete message sitting in the in buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub code: StatusCode,
    /// Payload bytes, starting at `MESSAGE_HEADER_SIZE` in the in buffer.
    pub length: usize,
}

impl Frame {
    pub fn total_length(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.length + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A payload-bearing message that should be dispatched.
    Message(Frame),
    /// Idle, busy or desync status; nothing to dispatch.
    Control(StatusCode),
}

#[derive(Debug, Clone)]
pub struct MessageFramer {
    predictive: bool,
    retry_us: (u64, u64),
    framing_retries: u32,
}

impl MessageFramer {
    pub fn new(predictive: bool, retry_us: (u64, u64), framing_retries: u32) -> Self {
        Self {
            predictive,
            retry_us,
            framing_retries,
        }
    }

    pub fn from_config(config: &DriverConfig) -> Self {
        Self::new(
            config.predictive_reading,
            (config.read_retry_us_min, config.read_retry_us_max),
            config.framing_retries,
        )
    }

    pub fn predictive(&self) -> bool {
        self.predictive
    }

    fn backoff(&self) {
        backoff::sleep_range_us(self.retry_us.0, self.retry_us.1);
    }

    /// Read one message into the session's in buffer.
    ///
    /// A bus error is retried once and a bad marker up to `framing_retries`
    /// times, each after a random backoff.
    #[instrument(level = "trace", skip_all)]
    pub fn read_message(&self, session: &mut BusSession<'_>) -> Result<ReadOutcome> {
        let mut bus_retried = false;
        let mut framing_attempts = 0;
        let mut invalid_retried = false;

        let header = loop {
            let head_len = if self.predictive {
                session.read_length()
            } else {
                MESSAGE_HEADER_SIZE
            };

            if let Err(e) = session.read_head(head_len) {
                if bus_retried {
                    return Err(e);
                }
                bus_retried = true;
                debug!(error = %e, "Bus read failed, retrying");
                self.backoff();
                continue;
            }

            let header = MessageHeader::from_bytes(session.in_buf().as_slice())?;
            if header.validate_marker().is_err() {
                if framing_attempts >= self.framing_retries {
                    session.set_read_length(MIN_READ_LENGTH);
                    return Err(TcmError::Framing {
                        marker: header.marker,
                    });
                }
                framing_attempts += 1;
                debug!(marker = %format!("0x{:02X}", header.marker), "Incorrect header marker, retrying");
                self.backoff();
                continue;
            }

            let code = header.code;
            if code.is_payloadless() {
                if code.value() == STATUS_CONTINUED_READ {
                    warn!("Out-of-sync continued read");
                }
                return Ok(ReadOutcome::Control(code));
            }
            if code.value() == STATUS_INVALID {
                if invalid_retried {
                    warn!("Invalid status persisted after retry");
                    // Handed on payloadless so a pending command sees the status.
                    let in_buf = &mut session.buffers_mut().in_buf;
                    in_buf.realloc(MESSAGE_HEADER_SIZE + 1);
                    in_buf.as_mut_slice()[MESSAGE_HEADER_SIZE] = MESSAGE_PADDING;
                    in_buf.set_data_length(MESSAGE_HEADER_SIZE + 1);
                    session.set_read_length(MIN_READ_LENGTH);
                    return Ok(ReadOutcome::Message(Frame { code, length: 0 }));
                }
                invalid_retried = true;
                self.backoff();
                continue;
            }
            break header;
        };

        let length = header.length as usize;
        let total = header.total_length();

        if self.predictive {
            let read_length = session.read_length();
            if total <= read_length {
                // Whole message already in the buffer.
            } else if total - 1 == read_length {
                let in_buf = &mut session.buffers_mut().in_buf;
                in_buf.realloc(total);
                in_buf.as_mut_slice()[total - 1] = MESSAGE_PADDING;
            } else {
                session.continued_read(read_length, total)?;
            }
        } else if length == 0 {
            let in_buf = &mut session.buffers_mut().in_buf;
            in_buf.realloc(total);
            in_buf.as_mut_slice()[total - 1] = MESSAGE_PADDING;
        } else {
            session.continued_read(MESSAGE_HEADER_SIZE, total)?;
        }

        let padding = session.in_buf().as_slice()[total - 1];
        if padding != MESSAGE_PADDING {
            session.set_read_length(MIN_READ_LENGTH);
            return Err(TcmError::Padding(padding));
        }
        session.buffers_mut().in_buf.set_data_length(total);

        if self.predictive {
            let rd_chunk = session.rd_chunk_size();
            let next = total.max(MIN_READ_LENGTH);
            let next = if rd_chunk == 0 { next } else { next.min(rd_chunk) };
            session.set_read_length(next);
        }

        debug!(
            code = %header.code,
            length,
            "Message received"
        );
        Ok(ReadOutcome::Message(Frame {
            code: header.code,
            length,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChunkedTransport, MockBus};
    use std::sync::Arc;

    fn setup(rd_chunk: usize) -> (Arc<MockBus>, ChunkedTransport, MessageFramer) {
        let mock = Arc::new(MockBus::new());
        let transport = ChunkedTransport::new(mock.clone(), rd_chunk, 0);
        (mock, transport, MessageFramer::new(true, (0, 10), 1))
    }

    #[test]
    fn test_single_transaction_message() {
        let (mock, t, framer) = setup(0);
        mock.queue_message(STATUS_OK, &[0x34, 0x12]);

        let mut session = t.lock();
        let outcome = framer.read_message(&mut session).unwrap();
        assert_eq!(
            outcome,
            ReadOutcome::Message(Frame {
                code: StatusCode(STATUS_OK),
                length: 2
            })
        );
        assert_eq!(&session.in_buf().data()[4..6], &[0x34, 0x12]);
        assert_eq!(mock.reads_served(), 1);
        assert_eq!(session.read_length(), MIN_READ_LENGTH);
    }

    #[test]
    fn test_report_with_empty_payload() {
        let (mock, t, framer) = setup(0);
        mock.queue_read(&[MESSAGE_MARKER, REPORT_IDENTIFY, 0x00, 0x00, MESSAGE_PADDING]);

        let outcome = framer.read_message(&mut t.lock()).unwrap();
        match outcome {
            ReadOutcome::Message(frame) => {
                assert!(frame.code.is_report());
                assert_eq!(frame.length, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_continued_read_for_long_message() {
        let (mock, t, framer) = setup(0);
        let payload: Vec<u8> = (1..=12).collect();
        // First read returns 9 bytes: header + 5 payload bytes.
        let mut head = vec![MESSAGE_MARKER, REPORT_TOUCH, 12, 0];
        head.extend_from_slice(&payload[..5]);
        mock.queue_read(&head);
        let mut rest = vec![MESSAGE_MARKER, STATUS_CONTINUED_READ];
        rest.extend_from_slice(&payload[5..]);
        rest.push(MESSAGE_PADDING);
        mock.queue_read(&rest);

        let mut session = t.lock();
        let outcome = framer.read_message(&mut session).unwrap();
        assert!(matches!(outcome, ReadOutcome::Message(Frame { length: 12, .. })));
        assert_eq!(&session.in_buf().data()[4..16], payload.as_slice());
        assert_eq!(session.in_buf().data().len(), 17);
        // Next read sized to this message.
        assert_eq!(session.read_length(), 17);
    }

    #[test]
    fn test_read_length_clipped_to_chunk() {
        let (mock, t, framer) = setup(12);
        let mut head = vec![MESSAGE_MARKER, REPORT_TOUCH, 12, 0, 1, 2, 3, 4, 5];
        mock.queue_read(&head);
        head = vec![MESSAGE_MARKER, STATUS_CONTINUED_READ];
        head.extend_from_slice(&[6, 7, 8, 9, 10, 11, 12, MESSAGE_PADDING]);
        mock.queue_read(&head);

        let mut session = t.lock();
        framer.read_message(&mut session).unwrap();
        assert_eq!(session.read_length(), 12);
    }

    #[test]
    fn test_padding_byte_just_past_read() {
        let (mock, t, framer) = setup(0);
        // total = 10, one more than the 9-byte read; padding is implied.
        mock.queue_read(&[MESSAGE_MARKER, REPORT_TOUCH, 5, 0, 1, 2, 3, 4, 5]);

        let mut session = t.lock();
        let outcome = framer.read_message(&mut session).unwrap();
        assert!(matches!(outcome, ReadOutcome::Message(Frame { length: 5, .. })));
        assert_eq!(session.in_buf().data()[9], MESSAGE_PADDING);
        assert_eq!(mock.reads_served(), 1);
    }

    #[test]
    fn test_bad_marker_retried_once() {
        let (mock, t, framer) = setup(0);
        mock.queue_read(&[0x00; 9]);
        mock.queue_message(STATUS_OK, &[]);

        let outcome = framer.read_message(&mut t.lock()).unwrap();
        assert!(matches!(outcome, ReadOutcome::Message(_)));
        assert_eq!(mock.reads_served(), 2);
    }

    #[test]
    fn test_bad_marker_surfaces_framing_error() {
        let (mock, t, framer) = setup(0);
        mock.queue_read(&[0x00; 9]);
        mock.queue_read(&[0xFF; 9]);
        mock.queue_message(STATUS_OK, &[]);

        let err = framer.read_message(&mut t.lock()).unwrap_err();
        assert!(matches!(err, TcmError::Framing { marker: 0xFF }));
        assert_eq!(mock.reads_served(), 2);
    }

    #[test]
    fn test_empty_report_with_padding() {
        let (mock, t, framer) = setup(0);
        mock.queue_read(&[MESSAGE_MARKER, REPORT_IDENTIFY, 0x00, 0x00, 0xFF]);

        let outcome = framer.read_message(&mut t.lock()).unwrap();
        assert_eq!(
            outcome,
            ReadOutcome::Message(Frame {
                code: StatusCode(REPORT_IDENTIFY),
                length: 0
            })
        );
    }

    #[test]
    fn test_bad_padding() {
        let (mock, t, framer) = setup(0);
        mock.queue_read(&[MESSAGE_MARKER, REPORT_IDENTIFY, 0x00, 0x00, 0x5A]);

        let err = framer.read_message(&mut t.lock()).unwrap_err();
        assert!(matches!(err, TcmError::Padding(0x5A)));
    }

    #[test]
    fn test_bus_error_retried_once() {
        let (mock, t, framer) = setup(0);
        mock.queue_read_error("nack");
        mock.queue_message(STATUS_OK, &[]);
        assert!(framer.read_message(&mut t.lock()).is_ok());

        mock.queue_read_error("nack");
        mock.queue_read_error("nack");
        assert!(matches!(
            framer.read_message(&mut t.lock()),
            Err(TcmError::Bus(_))
        ));
    }

    #[test]
    fn test_control_statuses() {
        let (mock, t, framer) = setup(0);
        mock.queue_read(&[MESSAGE_MARKER, STATUS_IDLE, 0, 0]);
        mock.queue_read(&[MESSAGE_MARKER, STATUS_CONTINUED_READ, 5, 0]);
        let mut session = t.lock();
        assert_eq!(
            framer.read_message(&mut session).unwrap(),
            ReadOutcome::Control(StatusCode(STATUS_IDLE))
        );
        assert_eq!(
            framer.read_message(&mut session).unwrap(),
            ReadOutcome::Control(StatusCode(STATUS_CONTINUED_READ))
        );
    }

    #[test]
    fn test_invalid_status_retried_then_passed_on() {
        let (mock, t, framer) = setup(0);
        mock.queue_read(&[MESSAGE_MARKER, STATUS_INVALID, 3, 0]);
        mock.queue_read(&[MESSAGE_MARKER, STATUS_INVALID, 3, 0]);
        let mut session = t.lock();
        assert_eq!(
            framer.read_message(&mut session).unwrap(),
            ReadOutcome::Message(Frame {
                code: StatusCode(STATUS_INVALID),
                length: 0
            })
        );
        assert_eq!(session.in_buf().data().len(), MESSAGE_HEADER_SIZE + 1);
        drop(session);
        assert_eq!(mock.reads_served(), 2);
    }

    #[test]
    fn test_non_predictive_reads_header_first() {
        let mock = Arc::new(MockBus::new());
        let t = ChunkedTransport::new(mock.clone(), 0, 0);
        let framer = MessageFramer::new(false, (0, 0), 1);
        mock.queue_read(&[MESSAGE_MARKER, STATUS_OK, 2, 0]);
        mock.queue_read(&[MESSAGE_MARKER, STATUS_CONTINUED_READ, 9, 8, MESSAGE_PADDING]);

        let mut session = t.lock();
        framer.read_message(&mut session).unwrap();
        assert_eq!(&session.in_buf().data()[4..7], &[9, 8, MESSAGE_PADDING]);
    }

    #[test]
    fn test_dispatch_scope_nesting() {
        assert!(!in_dispatch());
        {
            let _outer = DispatchScope::enter();
            assert!(in_dispatch());
            {
                let _inner = DispatchScope::enter();
            }
            assert!(in_dispatch());
        }
        assert!(!in_dispatch());
    }
}
