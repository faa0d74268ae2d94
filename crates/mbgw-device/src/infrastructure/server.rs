//! DeviceSimulator: TCP front of the simulated device.
//!
//! Each accepted connection gets a reader task that splits the byte stream
//! into frames (7-byte header, then `length − 1` bytes).  Frames from every
//! connection are funnelled into one worker task that owns the
//! [`RegisterBank`], so requests are applied strictly one at a time, like
//! a real single-threaded device.
//!
//! ```text
//! conn 1 ─┐
//! conn 2 ─┼─► mpsc ─► worker (RegisterBank) ─► oneshot reply ─► conn
//! conn N ─┘
//! ```

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use mbgw_core::protocol::messages::{MAX_ADU_SIZE, MBAP_HEADER_SIZE};
use mbgw_core::protocol::hex_dump;
use mbgw_core::{decode_header, UnitId};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::application::process_request;
use crate::domain::register_bank::{RegisterBank, DEFAULT_REGISTER_COUNT};

/// Port a Modbus-TCP device simulator listens on by default.
pub const DEFAULT_PORT: u16 = 5021;

/// Capacity of the shared request queue feeding the worker.
const WORKER_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Unit id this device answers as.  Used for logging only; requests for
    /// other unit ids are answered too.
    pub unit_id: UnitId,
    pub bind_addr: SocketAddr,
    pub register_count: usize,
    /// Stop the simulator once a connected peer goes away.
    pub exit_on_disconnect: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            unit_id: 1,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            register_count: DEFAULT_REGISTER_COUNT,
            exit_on_disconnect: false,
        }
    }
}

/// A frame handed to the worker together with where to send the answer.
struct Job {
    adu: Vec<u8>,
    reply: oneshot::Sender<Option<Vec<u8>>>,
}

pub struct DeviceSimulator {
    listener: TcpListener,
    config: SimulatorConfig,
}

impl DeviceSimulator {
    /// Binds the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`SimulatorError::Bind`] if the address is unavailable.
    pub async fn bind(config: SimulatorConfig) -> Result<Self, SimulatorError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| SimulatorError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        Ok(Self { listener, config })
    }

    /// The bound address (useful when binding to port 0).
    ///
    /// # Errors
    ///
    /// Returns the OS error if the socket address cannot be queried.
    pub fn local_addr(&self) -> Result<SocketAddr, SimulatorError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections and answers requests until `running` is cleared.
    ///
    /// # Errors
    ///
    /// Returns [`SimulatorError::Io`] if the listener address cannot be read.
    pub async fn run(self, running: Arc<AtomicBool>) -> Result<(), SimulatorError> {
        let unit_id = self.config.unit_id;
        info!(unit_id, "device simulator listening on {}", self.local_addr()?);

        let (jobs, rx) = mpsc::channel(WORKER_QUEUE_CAPACITY);
        let worker = tokio::spawn(run_worker(RegisterBank::new(self.config.register_count), rx));

        loop {
            if !running.load(Ordering::Relaxed) {
                info!(unit_id, "shutdown flag set; stopping accept loop");
                break;
            }

            // Short timeout so the loop notices the flag without a new peer.
            match timeout(Duration::from_millis(200), self.listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    info!(unit_id, %peer, "gateway connected");
                    let _ = stream.set_nodelay(true);
                    let jobs = jobs.clone();
                    let running = Arc::clone(&running);
                    let exit_on_disconnect = self.config.exit_on_disconnect;
                    tokio::spawn(async move {
                        serve_connection(stream, jobs).await;
                        info!(unit_id, %peer, "gateway disconnected");
                        if exit_on_disconnect {
                            running.store(false, Ordering::Relaxed);
                        }
                    });
                }
                Ok(Err(e)) => error!("accept error: {e}"),
                Err(_) => {}
            }
        }

        drop(jobs);
        worker.abort();
        Ok(())
    }
}

/// Applies jobs to the bank one at a time.
async fn run_worker(mut bank: RegisterBank, mut rx: mpsc::Receiver<Job>) {
    while let Some(job) = rx.recv().await {
        let reply = process_request(&mut bank, &job.adu);
        // The connection may have closed while the job was queued.
        let _ = job.reply.send(reply);
    }
}

/// Reads frames from `stream` until EOF or an error, forwarding each to
/// the worker and writing back its reply.
async fn serve_connection<S>(mut stream: S, jobs: mpsc::Sender<Job>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let adu = match read_frame(&mut stream).await {
            Ok(Some(adu)) => adu,
            Ok(None) => return,
            Err(e) => {
                warn!("closing connection: {e}");
                return;
            }
        };
        debug!("RX {}", hex_dump(&adu));

        let (tx, rx) = oneshot::channel();
        if jobs.send(Job { adu, reply: tx }).await.is_err() {
            return;
        }
        let Ok(Some(reply)) = rx.await else {
            continue;
        };

        debug!("TX {}", hex_dump(&reply));
        if let Err(e) = stream.write_all(&reply).await {
            warn!("write failed: {e}");
            return;
        }
    }
}

/// Reads one frame.  `Ok(None)` means the peer closed the connection
/// cleanly between frames.
async fn read_frame<S>(stream: &mut S) -> std::io::Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; MBAP_HEADER_SIZE];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    // An unreadable header still has a declared length; use it so the
    // stream stays aligned.
    let body_len = match decode_header(&header) {
        Ok(h) => h.pdu_len(),
        Err(_) => usize::from(u16::from_be_bytes([header[4], header[5]])).saturating_sub(1),
    };
    if MBAP_HEADER_SIZE + body_len > MAX_ADU_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("declared frame length {body_len} exceeds the Modbus-TCP maximum"),
        ));
    }

    let mut adu = Vec::with_capacity(MBAP_HEADER_SIZE + body_len);
    adu.extend_from_slice(&header);
    adu.resize(MBAP_HEADER_SIZE + body_len, 0);
    stream.read_exact(&mut adu[MBAP_HEADER_SIZE..]).await?;
    Ok(Some(adu))
}
