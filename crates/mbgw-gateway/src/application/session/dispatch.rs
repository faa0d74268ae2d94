//! The per-device worker loop.
//!
//! For each queued request the worker:
//!
//! 1. takes the next transaction id and encodes the request,
//! 2. writes the whole frame,
//! 3. reads exactly 7 header bytes, then exactly `length − 1` body bytes,
//! 4. hands the raw reply back to the caller.
//!
//! Reading by declared length (instead of a single `read`) keeps frame
//! boundaries intact when TCP splits or coalesces segments.
//!
//! While the queue is empty the worker also watches the socket, so a device
//! that hangs up between requests is unregistered right away.  Bytes that
//! arrive while nothing is in flight answer no request and are dropped.
//! Requests whose caller has already given up are skipped.

use std::sync::{Arc, Weak};

use mbgw_core::protocol::{hex_dump, MBAP_HEADER_SIZE};
use mbgw_core::{decode_body, decode_header, encode_request, RegisterRequest, TransactionCounter};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{PendingRequest, SessionStats, TransactionIdPolicy};
use crate::application::device_registry::DeviceRegistry;
use crate::{DeviceId, GatewayError};

/// How a single exchange went wrong.
enum Failure {
    /// Only this request fails; the session keeps serving.
    Request(GatewayError),
    /// The connection is unusable; the session ends.
    Fatal(GatewayError),
}

/// What woke an idle worker.
enum Idle {
    Request(Option<PendingRequest>),
    Readable(std::io::Result<usize>),
}

pub(super) struct Dispatcher<S> {
    pub device_id: DeviceId,
    pub session_id: Uuid,
    pub stream: BufReader<S>,
    pub rx: mpsc::Receiver<PendingRequest>,
    pub stats: Arc<SessionStats>,
    pub transactions: Arc<TransactionCounter>,
    pub policy: TransactionIdPolicy,
    pub registry: Weak<DeviceRegistry>,
}

impl<S> Dispatcher<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(super) async fn run(mut self) {
        loop {
            let event = tokio::select! {
                biased;
                pending = self.rx.recv() => Idle::Request(pending),
                filled = self.stream.fill_buf() => Idle::Readable(filled.map(<[u8]>::len)),
            };

            let pending = match event {
                Idle::Request(Some(pending)) => pending,
                Idle::Request(None) => break,
                Idle::Readable(Ok(0)) => {
                    warn!(device_id = self.device_id, "device closed the connection");
                    break;
                }
                Idle::Readable(Ok(n)) => {
                    warn!(
                        device_id = self.device_id,
                        "discarding {n} unsolicited bytes: {}",
                        hex_dump(self.stream.buffer())
                    );
                    self.stats.record_rx(n);
                    self.stream.consume(n);
                    continue;
                }
                Idle::Readable(Err(e)) => {
                    warn!(device_id = self.device_id, "terminating session: {e}");
                    break;
                }
            };

            if pending.reply.is_closed() {
                debug!(device_id = self.device_id, "caller gone; request skipped");
                continue;
            }

            match self.exchange(&pending.request).await {
                Ok(reply) => pending.deliver(self.device_id, Ok(reply)),
                Err(Failure::Request(err)) => {
                    warn!(device_id = self.device_id, "request failed: {err}");
                    pending.deliver(self.device_id, Err(err));
                }
                Err(Failure::Fatal(err)) => {
                    warn!(device_id = self.device_id, "terminating session: {err}");
                    // Unregister first: a caller holding the error must
                    // already see the device as disconnected.
                    self.detach();
                    pending.deliver(self.device_id, Err(err));
                    break;
                }
            }
        }
        self.terminate();
    }

    async fn exchange(&mut self, request: &RegisterRequest) -> Result<Vec<u8>, Failure> {
        let device_id = self.device_id;
        let io_failure = |source| Failure::Fatal(GatewayError::Io { device_id, source });

        // Transaction ids count transmitted frames only.
        request.validate().map_err(|e| Failure::Request(e.into()))?;
        let txid = self.transactions.next();
        let frame = encode_request(device_id, txid, request)
            .map_err(|e| Failure::Request(e.into()))?;

        debug!(device_id, txid, "TX {}", hex_dump(&frame));
        self.stream.write_all(&frame).await.map_err(io_failure)?;
        self.stream.flush().await.map_err(io_failure)?;
        self.stats.record_tx(frame.len());

        let mut header_bytes = [0u8; MBAP_HEADER_SIZE];
        self.stream
            .read_exact(&mut header_bytes)
            .await
            .map_err(io_failure)?;
        let header = match decode_header(&header_bytes) {
            Ok(header) => header,
            Err(e) => {
                self.stats.record_rx(MBAP_HEADER_SIZE);
                return Err(Failure::Request(e.into()));
            }
        };

        let mut body = vec![0u8; header.pdu_len()];
        self.stream.read_exact(&mut body).await.map_err(io_failure)?;
        let reply = decode_body(&header, &body).map_err(|e| Failure::Request(e.into()))?;
        self.stats.record_rx(reply.len());
        debug!(device_id, txid, "RX {}", hex_dump(&reply));

        if header.transaction_id != txid {
            match self.policy {
                TransactionIdPolicy::Ignore => {}
                TransactionIdPolicy::Warn => warn!(
                    device_id,
                    expected = txid,
                    received = header.transaction_id,
                    "reply transaction id does not match request"
                ),
                TransactionIdPolicy::Reject => {
                    return Err(Failure::Request(GatewayError::TransactionMismatch {
                        expected: txid,
                        received: header.transaction_id,
                    }))
                }
            }
        }

        Ok(reply)
    }

    fn detach(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_session(self.device_id, self.session_id);
        }
    }

    /// Removes this session from the registry and fails whatever is still
    /// queued.  The socket is closed when `self` drops.
    fn terminate(mut self) {
        self.detach();

        self.rx.close();
        let mut drained = 0usize;
        while let Ok(pending) = self.rx.try_recv() {
            pending.deliver(self.device_id, Err(GatewayError::ConnectionClosed(self.device_id)));
            drained += 1;
        }

        info!(
            device_id = self.device_id,
            session_id = %self.session_id,
            drained,
            "device session ended"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::session::{DeviceSession, SessionConfig};
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio_test::io::Builder;

    fn read_req() -> RegisterRequest {
        RegisterRequest::read_holding_registers(0, 1)
    }

    /// Enqueues `request` on `session` and returns the caller's receiver.
    fn enqueue(
        session: &DeviceSession,
        request: RegisterRequest,
    ) -> oneshot::Receiver<Result<Vec<u8>, GatewayError>> {
        let (tx, rx) = oneshot::channel();
        session
            .try_enqueue(PendingRequest { request, reply: tx })
            .unwrap();
        rx
    }

    fn spawn_with(
        stream: tokio_test::io::Mock,
        policy: TransactionIdPolicy,
    ) -> Arc<DeviceSession> {
        let config = SessionConfig {
            transaction_id_policy: policy,
            ..SessionConfig::default()
        };
        DeviceSession::spawn(1, "mock".into(), stream, &config, Weak::new())
    }

    #[tokio::test]
    async fn test_read_reply_is_returned_verbatim() {
        // Arrange
        let request_frame: [u8; 12] = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        let reply_frame: [u8; 11] = [0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x00];
        let mock = Builder::new().write(&request_frame).read(&reply_frame).build();
        let session = spawn_with(mock, TransactionIdPolicy::Warn);

        // Act
        let reply = enqueue(&session, read_req()).await.unwrap();

        // Assert
        assert_eq!(reply.unwrap(), reply_frame.to_vec());
        let stats = session.stats();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.bytes_tx, 12);
        assert_eq!(stats.bytes_rx, 11);
        assert_eq!(stats.last_transaction_id, 1);
    }

    #[tokio::test]
    async fn test_reply_split_across_reads_is_reassembled() {
        let reply: [u8; 11] = [0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x12, 0x34];
        let mock = Builder::new()
            .write(&encode_request(1, 1, &read_req()).unwrap())
            .read(&reply[..3])
            .read(&reply[3..9])
            .read(&reply[9..])
            .build();
        let session = spawn_with(mock, TransactionIdPolicy::Warn);

        let result = enqueue(&session, read_req()).await.unwrap();

        assert_eq!(result.unwrap(), reply.to_vec());
    }

    #[tokio::test]
    async fn test_consecutive_requests_use_increasing_transaction_ids() {
        let reply = |txid: u8| [0x00, txid, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, txid];
        let mock = Builder::new()
            .write(&encode_request(1, 1, &read_req()).unwrap())
            .read(&reply(1))
            .write(&encode_request(1, 2, &read_req()).unwrap())
            .read(&reply(2))
            .build();
        let session = spawn_with(mock, TransactionIdPolicy::Reject);

        let first = enqueue(&session, read_req());
        let second = enqueue(&session, read_req());

        assert_eq!(first.await.unwrap().unwrap(), reply(1).to_vec());
        assert_eq!(second.await.unwrap().unwrap(), reply(2).to_vec());
    }

    #[tokio::test]
    async fn test_exception_reply_is_a_successful_exchange() {
        let exception: [u8; 9] = [0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02];
        let mock = Builder::new()
            .write(&encode_request(1, 1, &read_req()).unwrap())
            .read(&exception)
            .build();
        let session = spawn_with(mock, TransactionIdPolicy::Warn);

        let result = enqueue(&session, read_req()).await.unwrap();

        assert_eq!(result.unwrap(), exception.to_vec());
    }

    #[tokio::test]
    async fn test_mismatched_transaction_id_is_delivered_under_warn() {
        let reply: [u8; 11] = [0x00, 0x09, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x07];
        let mock = Builder::new()
            .write(&encode_request(1, 1, &read_req()).unwrap())
            .read(&reply)
            .build();
        let session = spawn_with(mock, TransactionIdPolicy::Warn);

        let result = enqueue(&session, read_req()).await.unwrap();

        assert_eq!(result.unwrap(), reply.to_vec());
    }

    #[tokio::test]
    async fn test_mismatched_transaction_id_fails_request_under_reject() {
        // Arrange: the first reply carries the wrong id, the second is fine.
        let bad: [u8; 11] = [0x00, 0x09, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x07];
        let good: [u8; 11] = [0x00, 0x02, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x08];
        let mock = Builder::new()
            .write(&encode_request(1, 1, &read_req()).unwrap())
            .read(&bad)
            .write(&encode_request(1, 2, &read_req()).unwrap())
            .read(&good)
            .build();
        let session = spawn_with(mock, TransactionIdPolicy::Reject);

        // Act
        let first = enqueue(&session, read_req()).await.unwrap();
        let second = enqueue(&session, read_req()).await.unwrap();

        // Assert: the session survived the mismatch.
        assert!(matches!(
            first,
            Err(GatewayError::TransactionMismatch {
                expected: 1,
                received: 9
            })
        ));
        assert_eq!(second.unwrap(), good.to_vec());
    }

    #[tokio::test]
    async fn test_malformed_header_fails_request_but_keeps_session() {
        // Declared length 1 cannot hold unit id plus function code.
        let malformed: [u8; 7] = [0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01];
        let good: [u8; 11] = [0x00, 0x02, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x01];
        let mock = Builder::new()
            .write(&encode_request(1, 1, &read_req()).unwrap())
            .read(&malformed)
            .write(&encode_request(1, 2, &read_req()).unwrap())
            .read(&good)
            .build();
        let session = spawn_with(mock, TransactionIdPolicy::Warn);

        let first = enqueue(&session, read_req()).await.unwrap();
        let second = enqueue(&session, read_req()).await.unwrap();

        assert!(matches!(first, Err(GatewayError::MalformedFrame(_))));
        assert_eq!(second.unwrap(), good.to_vec());
    }

    #[tokio::test]
    async fn test_invalid_write_fails_without_touching_the_socket() {
        // An empty script: any write would panic the mock.
        let mock = Builder::new().build();
        let session = spawn_with(mock, TransactionIdPolicy::Warn);
        let mut bad_write = RegisterRequest::write_multiple_registers(0, vec![1, 2]);
        bad_write.quantity = 3;

        let result = enqueue(&session, bad_write).await.unwrap();

        assert!(matches!(result, Err(GatewayError::InvalidRequest(_))));
        assert_eq!(session.stats().requests, 0);
        assert_eq!(session.stats().last_transaction_id, 0);
    }

    #[tokio::test]
    async fn test_abandoned_request_is_not_sent() {
        // Arrange: only the second request may reach the wire, with id 1.
        let reply: [u8; 11] = [0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x05];
        let mock = Builder::new()
            .write(&encode_request(1, 1, &RegisterRequest::read_holding_registers(5, 1)).unwrap())
            .read(&reply)
            .build();
        let session = spawn_with(mock, TransactionIdPolicy::Reject);

        // Act
        drop(enqueue(&session, read_req()));
        let kept = enqueue(&session, RegisterRequest::read_holding_registers(5, 1));

        // Assert
        assert_eq!(kept.await.unwrap().unwrap(), reply.to_vec());
        assert_eq!(session.stats().requests, 1);
    }

    #[tokio::test]
    async fn test_unsolicited_bytes_while_idle_are_discarded() {
        // Arrange
        let reply: [u8; 11] = [0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x00];
        let mock = Builder::new()
            .read(&[0xAA, 0xBB])
            .write(&encode_request(1, 1, &read_req()).unwrap())
            .read(&reply)
            .build();
        let session = spawn_with(mock, TransactionIdPolicy::Reject);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Act
        let result = enqueue(&session, read_req()).await.unwrap();

        // Assert: the stray bytes did not shift the reply frame.
        assert_eq!(result.unwrap(), reply.to_vec());
        assert_eq!(session.stats().bytes_rx, 13);
    }

    #[tokio::test]
    async fn test_peer_close_while_idle_ends_session() {
        // Arrange: the device end goes away before any request.
        let registry = Arc::new(DeviceRegistry::new());
        let (gw, dev) = tokio::io::duplex(64);
        let session = registry
            .register(6, gw, "p", &SessionConfig::default())
            .unwrap();

        // Act
        drop(dev);
        for _ in 0..100 {
            if session.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Assert
        assert!(session.is_finished());
        assert!(!registry.contains(6));
        assert!(matches!(
            registry.lookup(6),
            Err(GatewayError::DeviceNotConnected(6))
        ));
    }

    #[tokio::test]
    async fn test_io_error_ends_session_and_fails_queued_requests() {
        // Arrange: the device hangs up mid-reply.
        let mock = Builder::new()
            .write(&encode_request(1, 1, &read_req()).unwrap())
            .read(&[0x00, 0x01, 0x00])
            .read_error(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset by peer",
            ))
            .build();
        let session = spawn_with(mock, TransactionIdPolicy::Warn);

        // Act
        let in_flight = enqueue(&session, read_req());
        let queued = enqueue(&session, read_req());

        // Assert
        assert!(matches!(
            in_flight.await.unwrap(),
            Err(GatewayError::Io { device_id: 1, .. })
        ));
        match queued.await {
            Ok(result) => assert!(matches!(result, Err(GatewayError::ConnectionClosed(1)))),
            Err(_) => panic!("queued caller must receive ConnectionClosed"),
        }
    }
}
