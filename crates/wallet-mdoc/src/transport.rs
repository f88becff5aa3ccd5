use crate::error::{MdocError, MdocResult};
use crate::framing::{fragment, Reassembler};
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Idle,
    Connected,
    Terminated,
}

/// Proximity link to a reader (BLE central client on the holder device).
///
/// Units passed to `send` and returned by `receive` are already framed with
/// the continuation flag.
#[async_trait]
pub trait ProximityTransport: Send + Sync {
    async fn is_available(&self) -> bool;

    /// Connect to the reader advertising `service_uuid`. `false` if no link came up.
    async fn create_client(&self, service_uuid: Uuid) -> MdocResult<bool>;

    async fn receive(&self) -> MdocResult<Vec<u8>>;

    async fn send(&self, unit: &[u8]) -> MdocResult<()>;

    async fn terminate(&self) -> MdocResult<()>;

    fn status(&self) -> TransportStatus;

    /// Largest payload per unit the link measured, flag byte excluded.
    fn max_unit_payload(&self) -> Option<usize> {
        None
    }
}

// ---------------------------------------------------------------------------
// LoopbackTransport: in-process link for tests and demos
// ---------------------------------------------------------------------------

pub struct LoopbackTransport {
    available: bool,
    max_unit_payload: Option<usize>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    status: Mutex<TransportStatus>,
    service_uuid: Mutex<Option<Uuid>>,
}

/// The reader end of a loopback link.
pub struct ReaderLink {
    to_device: mpsc::UnboundedSender<Vec<u8>>,
    from_device: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl LoopbackTransport {
    pub fn pair() -> (LoopbackTransport, ReaderLink) {
        let (to_device, inbound) = mpsc::unbounded_channel();
        let (outbound, from_device) = mpsc::unbounded_channel();
        (
            LoopbackTransport {
                available: true,
                max_unit_payload: None,
                inbound: tokio::sync::Mutex::new(inbound),
                outbound,
                status: Mutex::new(TransportStatus::Idle),
                service_uuid: Mutex::new(None),
            },
            ReaderLink {
                to_device,
                from_device,
            },
        )
    }

    /// A platform without proximity support.
    pub fn unavailable() -> LoopbackTransport {
        let mut transport = Self::pair().0;
        transport.available = false;
        transport
    }

    pub fn with_max_unit_payload(mut self, max: usize) -> Self {
        self.max_unit_payload = Some(max);
        self
    }

    pub fn service_uuid(&self) -> Option<Uuid> {
        self.service_uuid.lock().ok().and_then(|g| *g)
    }

    fn set_status(&self, status: TransportStatus) -> MdocResult<()> {
        *self
            .status
            .lock()
            .map_err(|e| MdocError::Transport(format!("lock poisoned: {}", e)))? = status;
        Ok(())
    }

    fn require_connected(&self) -> MdocResult<()> {
        match self.status() {
            TransportStatus::Connected => Ok(()),
            other => Err(MdocError::Transport(format!("link is {:?}", other))),
        }
    }
}

#[async_trait]
impl ProximityTransport for LoopbackTransport {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn create_client(&self, service_uuid: Uuid) -> MdocResult<bool> {
        if !self.available {
            return Ok(false);
        }
        if let Ok(mut uuid) = self.service_uuid.lock() {
            *uuid = Some(service_uuid);
        }
        self.set_status(TransportStatus::Connected)?;
        Ok(true)
    }

    async fn receive(&self) -> MdocResult<Vec<u8>> {
        self.require_connected()?;
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| MdocError::Transport("reader closed the link".into()))
    }

    async fn send(&self, unit: &[u8]) -> MdocResult<()> {
        self.require_connected()?;
        self.outbound
            .send(unit.to_vec())
            .map_err(|_| MdocError::Transport("reader closed the link".into()))
    }

    async fn terminate(&self) -> MdocResult<()> {
        self.set_status(TransportStatus::Terminated)
    }

    fn status(&self) -> TransportStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(TransportStatus::Terminated)
    }

    fn max_unit_payload(&self) -> Option<usize> {
        self.max_unit_payload
    }
}

impl ReaderLink {
    pub fn send_unit(&self, unit: Vec<u8>) -> MdocResult<()> {
        self.to_device
            .send(unit)
            .map_err(|_| MdocError::Transport("device closed the link".into()))
    }

    /// Frame and send a whole message.
    pub fn send_message(&self, message: &[u8], chunk_size: usize) -> MdocResult<()> {
        for unit in fragment(message, chunk_size)? {
            self.send_unit(unit)?;
        }
        Ok(())
    }

    pub async fn recv_unit(&mut self) -> Option<Vec<u8>> {
        self.from_device.recv().await
    }

    /// Receive and reassemble one message.
    pub async fn recv_message(&mut self) -> MdocResult<Vec<u8>> {
        let mut reassembler = Reassembler::new();
        loop {
            let unit = self
                .recv_unit()
                .await
                .ok_or_else(|| MdocError::Transport("device closed the link".into()))?;
            if let Some(message) = reassembler.push(&unit)? {
                return Ok(message);
            }
        }
    }
}
