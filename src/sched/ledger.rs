//! Logical VRAM accounting.
//!
//! The ledger tracks what the scheduler has promised to runners on each
//! device. Physical VRAM belongs to the runner processes; the scheduler
//! never calls into GPU APIs after discovery, it only reconciles the
//! driver's free figure from the latest snapshot against its own
//! reservations so it never overcommits on its own bookkeeping.

use std::collections::HashMap;

use crate::discover::{DeviceDescriptor, DeviceId, GpuSnapshot};

#[derive(Debug, Default)]
struct LedgerEntry {
    total: u64,
    os_overhead: u64,
    reserved: u64,
}

#[derive(Debug, Default)]
pub struct DeviceLedger {
    entries: HashMap<DeviceId, LedgerEntry>,
}

impl DeviceLedger {
    pub fn from_snapshot(snapshot: &GpuSnapshot) -> Self {
        let mut ledger = Self::default();
        ledger.sync(snapshot);
        ledger
    }

    /// Fold a fresh snapshot in: totals and overheads update, reservations
    /// survive. Devices that disappeared keep their entry until the last
    /// runner on them unloads.
    pub fn sync(&mut self, snapshot: &GpuSnapshot) {
        for dev in snapshot.gpus() {
            let entry = self.entries.entry(dev.id.clone()).or_default();
            entry.total = dev.total_vram;
            entry.os_overhead = dev.os_overhead;
        }
    }

    pub fn reserve(&mut self, id: &DeviceId, bytes: u64) {
        let entry = self.entries.entry(id.clone()).or_default();
        entry.reserved += bytes;
        tracing::debug!("Reserved {} bytes on {} (now {})", bytes, id, entry.reserved);
    }

    pub fn release(&mut self, id: &DeviceId, bytes: u64) {
        if let Some(entry) = self.entries.get_mut(id) {
            if bytes > entry.reserved {
                tracing::warn!(
                    "Releasing {} bytes on {} but only {} reserved",
                    bytes,
                    id,
                    entry.reserved
                );
            }
            entry.reserved = entry.reserved.saturating_sub(bytes);
        }
    }

    pub fn reserved(&self, id: &DeviceId) -> u64 {
        self.entries.get(id).map(|e| e.reserved).unwrap_or(0)
    }

    /// VRAM we may still schedule on a device: the lower of what the driver
    /// says is free and what the totals imply, minus our reservations and
    /// the configured per-GPU reserve.
    pub fn budget(&self, dev: &DeviceDescriptor, gpu_overhead: u64) -> u64 {
        let entry = match self.entries.get(&dev.id) {
            Some(entry) => entry,
            None => return 0,
        };
        let headroom = dev
            .free_vram
            .min(entry.total.saturating_sub(entry.os_overhead));
        headroom
            .saturating_sub(entry.reserved)
            .saturating_sub(gpu_overhead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discover::LibraryTag;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn device(id: &str, total: u64, free: u64, os_overhead: u64) -> DeviceDescriptor {
        DeviceDescriptor {
            id: DeviceId::new(id),
            library: LibraryTag::Cuda,
            name: "test gpu".into(),
            total_vram: total,
            free_vram: free,
            os_overhead,
            compute_capability: Some((8, 0)),
            dependency_paths: Vec::new(),
        }
    }

    fn snapshot(devices: Vec<DeviceDescriptor>) -> GpuSnapshot {
        GpuSnapshot::from_devices(devices, None)
    }

    #[test]
    fn test_reserve_release() {
        let snap = snapshot(vec![device("cuda:0", 24 * GIB, 23 * GIB, 0)]);
        let mut ledger = DeviceLedger::from_snapshot(&snap);
        let id = DeviceId::new("cuda:0");

        ledger.reserve(&id, 10 * GIB);
        assert_eq!(ledger.reserved(&id), 10 * GIB);
        ledger.reserve(&id, 5 * GIB);
        assert_eq!(ledger.reserved(&id), 15 * GIB);
        ledger.release(&id, 10 * GIB);
        assert_eq!(ledger.reserved(&id), 5 * GIB);
    }

    #[test]
    fn test_release_saturates() {
        let snap = snapshot(vec![device("cuda:0", 24 * GIB, 23 * GIB, 0)]);
        let mut ledger = DeviceLedger::from_snapshot(&snap);
        let id = DeviceId::new("cuda:0");
        ledger.reserve(&id, GIB);
        ledger.release(&id, 2 * GIB);
        assert_eq!(ledger.reserved(&id), 0);
    }

    #[test]
    fn test_budget_subtracts_everything() {
        let snap = snapshot(vec![device("cuda:0", 24 * GIB, 20 * GIB, GIB)]);
        let mut ledger = DeviceLedger::from_snapshot(&snap);
        let dev = snap.gpus().next().unwrap();

        // free (20) is below total - os_overhead (23), so it wins
        assert_eq!(ledger.budget(dev, 0), 20 * GIB);
        ledger.reserve(&dev.id, 8 * GIB);
        assert_eq!(ledger.budget(dev, 0), 12 * GIB);
        assert_eq!(ledger.budget(dev, GIB), 11 * GIB);
    }

    #[test]
    fn test_budget_caps_at_total_minus_overhead() {
        // driver claims more free than total - os_overhead allows
        let snap = snapshot(vec![device("cuda:0", 24 * GIB, 24 * GIB, 2 * GIB)]);
        let ledger = DeviceLedger::from_snapshot(&snap);
        let dev = snap.gpus().next().unwrap();
        assert_eq!(ledger.budget(dev, 0), 22 * GIB);
    }

    #[test]
    fn test_budget_unknown_device() {
        let ledger = DeviceLedger::default();
        let dev = device("cuda:9", 24 * GIB, 24 * GIB, 0);
        assert_eq!(ledger.budget(&dev, 0), 0);
    }

    #[test]
    fn test_sync_keeps_reservations() {
        let snap = snapshot(vec![device("cuda:0", 24 * GIB, 23 * GIB, 0)]);
        let mut ledger = DeviceLedger::from_snapshot(&snap);
        let id = DeviceId::new("cuda:0");
        ledger.reserve(&id, 4 * GIB);

        let refreshed = snapshot(vec![device("cuda:0", 24 * GIB, 18 * GIB, 0)]);
        ledger.sync(&refreshed);
        assert_eq!(ledger.reserved(&id), 4 * GIB);
    }
}
