//! Device manager
//!
//! Every device runs on its own worker task and is only touched by that
//! task. Callers talk to it through a bounded request queue and get replies
//! on oneshot channels, so a device stuck in a network call never holds up
//! another. Tree snapshots are read straight from the shared handle without
//! going through the queue.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{CommandReport, DeviceProtocol, ProtocolKind};
use super::updates::UpdateHub;
use crate::core::iec61850::control::{CommandOptions, ControlPath};
use crate::core::iec61850::discovery::DiscoveryReport;
use crate::core::iec61850::reference::split_device_address;
use crate::core::iec61850::sbo::CommandOutcome;
use crate::core::model::node::Node;
use crate::core::model::signal::{Signal, SignalValue};
use crate::error::{Result, ScoutSrvError};

const REQUEST_QUEUE_DEPTH: usize = 32;

enum DeviceRequest {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
    Discover(oneshot::Sender<Result<DiscoveryReport>>),
    Read {
        addresses: Vec<String>,
        reply: oneshot::Sender<Result<Vec<Signal>>>,
    },
    Command {
        address: String,
        value: SignalValue,
        options: CommandOptions,
        reply: oneshot::Sender<Result<CommandReport>>,
    },
    Select {
        address: String,
        value: SignalValue,
        options: CommandOptions,
        reply: oneshot::Sender<Result<ControlPath>>,
    },
    Operate {
        address: String,
        value: SignalValue,
        options: CommandOptions,
        reply: oneshot::Sender<Result<CommandOutcome>>,
    },
    Cancel {
        address: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

struct DeviceHandle {
    protocol: ProtocolKind,
    requests: mpsc::Sender<DeviceRequest>,
    tree: Arc<RwLock<Arc<Node>>>,
    worker: JoinHandle<()>,
}

/// Registry of running devices
pub struct DeviceManager {
    devices: DashMap<String, DeviceHandle>,
    hub: Arc<UpdateHub>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("devices", &self.devices.len())
            .finish()
    }
}

async fn run_worker(
    mut device: DeviceProtocol,
    mut requests: mpsc::Receiver<DeviceRequest>,
    shutdown: CancellationToken,
) {
    let name = device.name().to_string();
    debug!(device = %name, "Device worker started");
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = requests.recv() => match request {
                Some(r) => r,
                None => break,
            },
        };
        handle(&mut device, request).await;
    }
    if device.is_connected() {
        device.disconnect().await;
    }
    debug!(device = %name, "Device worker stopped");
}

/// Replies are dropped silently when the caller went away
async fn handle(device: &mut DeviceProtocol, request: DeviceRequest) {
    match request {
        DeviceRequest::Connect(reply) => {
            let _ = reply.send(device.connect().await);
        },
        DeviceRequest::Disconnect(reply) => {
            device.disconnect().await;
            let _ = reply.send(());
        },
        DeviceRequest::Discover(reply) => {
            let _ = reply.send(device.discover().await);
        },
        DeviceRequest::Read { addresses, reply } => {
            let _ = reply.send(device.read_signals(&addresses).await);
        },
        DeviceRequest::Command {
            address,
            value,
            options,
            reply,
        } => {
            let _ = reply.send(device.send_command(&address, &value, &options).await);
        },
        DeviceRequest::Select {
            address,
            value,
            options,
            reply,
        } => {
            let _ = reply.send(device.select(&address, &value, &options).await);
        },
        DeviceRequest::Operate {
            address,
            value,
            options,
            reply,
        } => {
            let _ = reply.send(device.operate(&address, &value, &options).await);
        },
        DeviceRequest::Cancel { address, reply } => {
            let _ = reply.send(device.cancel(&address).await);
        },
    }
}

/// Split `Device::path`, rejecting bare paths
fn split(address: &str) -> Result<(&str, &str)> {
    split_device_address(address).ok_or_else(|| {
        ScoutSrvError::validation(format!("address '{address}' lacks a 'Device::' prefix"))
    })
}

impl DeviceManager {
    pub fn new(hub: Arc<UpdateHub>) -> Arc<Self> {
        Arc::new(Self {
            devices: DashMap::new(),
            hub,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn hub(&self) -> &Arc<UpdateHub> {
        &self.hub
    }

    /// Register a device and start its worker
    ///
    /// The hub is installed as the device's update consumer here, once.
    pub fn add_device(&self, device: DeviceProtocol) -> Result<()> {
        let name = device.name().to_string();
        if self.devices.contains_key(&name) {
            return Err(ScoutSrvError::device(format!("Device already registered: {name}")));
        }

        device.updates().install(self.hub.callback());
        let protocol = device.kind();
        let tree = device.tree_handle();
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let worker = tokio::spawn(run_worker(device, rx, self.shutdown.child_token()));

        self.devices.insert(
            name.clone(),
            DeviceHandle {
                protocol,
                requests: tx,
                tree,
                worker,
            },
        );
        info!(device = %name, protocol = %protocol, "Device registered");
        Ok(())
    }

    /// Stop a device's worker; the device disconnects on the way out
    pub async fn remove_device(&self, name: &str) -> Result<()> {
        let (_, handle) = self
            .devices
            .remove(name)
            .ok_or_else(|| ScoutSrvError::device_not_found(name))?;
        drop(handle.requests);
        if let Err(e) = handle.worker.await {
            error!(device = %name, "Device worker panicked: {}", e);
        }
        self.hub.mark_device_stale(name);
        info!(device = %name, "Device removed");
        Ok(())
    }

    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn protocol(&self, name: &str) -> Result<ProtocolKind> {
        self.devices
            .get(name)
            .map(|h| h.protocol)
            .ok_or_else(|| ScoutSrvError::device_not_found(name))
    }

    /// Current tree snapshot, without queueing behind device work
    pub fn tree(&self, name: &str) -> Result<Arc<Node>> {
        self.devices
            .get(name)
            .map(|h| h.tree.read().clone())
            .ok_or_else(|| ScoutSrvError::device_not_found(name))
    }

    async fn request<T>(
        &self,
        name: &str,
        build: impl FnOnce(oneshot::Sender<T>) -> DeviceRequest,
    ) -> Result<T> {
        let sender = self
            .devices
            .get(name)
            .map(|h| h.requests.clone())
            .ok_or_else(|| ScoutSrvError::device_not_found(name))?;
        let (tx, rx) = oneshot::channel();
        sender
            .send(build(tx))
            .await
            .map_err(|_| ScoutSrvError::device(format!("{name}: worker stopped")))?;
        rx.await
            .map_err(|_| ScoutSrvError::device(format!("{name}: worker dropped the request")))
    }

    pub async fn connect(&self, name: &str) -> Result<()> {
        self.request(name, DeviceRequest::Connect).await?
    }

    pub async fn disconnect(&self, name: &str) -> Result<()> {
        self.request(name, DeviceRequest::Disconnect).await?;
        self.hub.mark_device_stale(name);
        Ok(())
    }

    pub async fn discover(&self, name: &str) -> Result<DiscoveryReport> {
        self.request(name, DeviceRequest::Discover).await?
    }

    /// Read one `Device::path` signal
    pub async fn read(&self, address: &str) -> Result<Signal> {
        let (device, path) = split(address)?;
        let path = path.to_string();
        let signals = self
            .request(device, |reply| DeviceRequest::Read {
                addresses: vec![path.clone()],
                reply,
            })
            .await??;
        signals
            .into_iter()
            .next()
            .ok_or_else(|| ScoutSrvError::signal_not_found(address))
    }

    /// Read several device-local paths on one device in one queued request
    pub async fn read_many(&self, device: &str, paths: Vec<String>) -> Result<Vec<Signal>> {
        self.request(device, |reply| DeviceRequest::Read {
            addresses: paths,
            reply,
        })
        .await?
    }

    pub async fn send_command(
        &self,
        address: &str,
        value: SignalValue,
        options: CommandOptions,
    ) -> Result<CommandReport> {
        let (device, path) = split(address)?;
        let address = path.to_string();
        let result = self
            .request(device, |reply| DeviceRequest::Command {
                address,
                value,
                options,
                reply,
            })
            .await?;
        if let Err(e) = &result {
            warn!(device = %device, address = %path, "Command failed: {}", e);
        }
        result
    }

    pub async fn select(
        &self,
        address: &str,
        value: SignalValue,
        options: CommandOptions,
    ) -> Result<ControlPath> {
        let (device, path) = split(address)?;
        let address = path.to_string();
        self.request(device, |reply| DeviceRequest::Select {
            address,
            value,
            options,
            reply,
        })
        .await?
    }

    pub async fn operate(
        &self,
        address: &str,
        value: SignalValue,
        options: CommandOptions,
    ) -> Result<CommandOutcome> {
        let (device, path) = split(address)?;
        let address = path.to_string();
        self.request(device, |reply| DeviceRequest::Operate {
            address,
            value,
            options,
            reply,
        })
        .await?
    }

    pub async fn cancel(&self, address: &str) -> Result<()> {
        let (device, path) = split(address)?;
        let address = path.to_string();
        self.request(device, |reply| DeviceRequest::Cancel { address, reply })
            .await?
    }

    /// Stop every worker and wait for them to disconnect
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let names = self.device_names();
        for name in names {
            if let Some((_, handle)) = self.devices.remove(&name) {
                if let Err(e) = handle.worker.await {
                    error!(device = %name, "Device worker panicked: {}", e);
                }
                self.hub.mark_device_stale(&name);
            }
        }
        info!("Device manager stopped");
    }
}
