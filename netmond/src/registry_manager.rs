use std::collections::HashMap;
use std::thread;
use tokio::sync::{mpsc, oneshot, watch};
use anyhow::Result;
use shared::types::Device;
use crate::registry::{hash, Registry};

/// Commands sent to the registry thread
pub enum RegistryCommand {
    LoadAll(oneshot::Sender<Result<HashMap<String, Device>>>),
    Get(String, oneshot::Sender<Result<Option<Device>>>),
    Upsert(Device, oneshot::Sender<Result<bool>>),
    ReplaceKnown(Vec<Device>, oneshot::Sender<Result<()>>),
    Promote(String, oneshot::Sender<Result<bool>>),
    Shutdown,
}

/// Handle to the thread that owns the registry backend.
///
/// Commands are applied one at a time in arrival order. A polling cycle's
/// load and its writes are separate commands, so an API promote can land
/// between them. The cycle's upserts carry the `known` flag it loaded, and
/// upsert never clears `known`, so such a promote is not lost.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Spawn a new registry thread with the given backend
    pub fn spawn(mut registry: Box<dyn Registry>, hash_tx: watch::Sender<String>) -> Self {
        let (tx, mut rx) = mpsc::channel::<RegistryCommand>(256);

        // Recompute the fingerprint only after mutations
        let recompute_hash = |registry: &dyn Registry, hash_tx: &watch::Sender<String>| {
            if let Ok(devices) = registry.load_all() {
                let _ = hash_tx.send(hash::compute_hash(devices.values()));
            }
        };

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    RegistryCommand::LoadAll(reply) => {
                        let _ = reply.send(registry.load_all());
                    }
                    RegistryCommand::Get(hardware_address, reply) => {
                        let _ = reply.send(registry.get(&hardware_address));
                    }
                    RegistryCommand::Upsert(device, reply) => {
                        let result = registry.upsert(&device);
                        if matches!(&result, Ok(true)) {
                            recompute_hash(registry.as_ref(), &hash_tx);
                        }
                        let _ = reply.send(result);
                    }
                    RegistryCommand::ReplaceKnown(devices, reply) => {
                        let result = registry.replace_known(&devices);
                        if result.is_ok() {
                            recompute_hash(registry.as_ref(), &hash_tx);
                        }
                        let _ = reply.send(result);
                    }
                    RegistryCommand::Promote(hardware_address, reply) => {
                        let result = registry.promote(&hardware_address);
                        if matches!(&result, Ok(true)) {
                            recompute_hash(registry.as_ref(), &hash_tx);
                        }
                        let _ = reply.send(result);
                    }
                    RegistryCommand::Shutdown => {
                        tracing::info!("Registry thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Load every stored device
    pub async fn load_all(&self) -> Result<HashMap<String, Device>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::LoadAll(reply)).await?;
        rx.await?
    }

    /// Get a single device by hardware address
    pub async fn get(&self, hardware_address: String) -> Result<Option<Device>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Get(hardware_address, reply)).await?;
        rx.await?
    }

    /// Insert or update a device. Returns true if data changed.
    pub async fn upsert(&self, device: Device) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Upsert(device, reply)).await?;
        rx.await?
    }

    /// Replace the known set wholesale
    pub async fn replace_known(&self, devices: Vec<Device>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::ReplaceKnown(devices, reply)).await?;
        rx.await?
    }

    /// Mark a device as known. Returns false if it does not exist.
    pub async fn promote(&self, hardware_address: String) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Promote(hardware_address, reply)).await?;
        rx.await?
    }

    /// Shutdown the registry thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(RegistryCommand::Shutdown).await?;
        Ok(())
    }
}
