//! Virtual display device.
//!
//! [`DisplayDevice`] is the callback surface a protocol server drives;
//! [`ReplayDevice`] implements it on top of the replay queue. Its callbacks
//! run on the server's worker thread and never block.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, info, trace, warn};

use crate::command::{CommandId, QueueItem, ReplayCommand};
use crate::filler;
use crate::server::DeviceWorker;
use crate::session::Shared;

/// Memory slot group every replayed command lives in.
pub const MEM_SLOT_GROUP_ID: u32 = 0;

/// A guest memory region registered with the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemSlot {
    pub slot_group_id: u32,
    pub slot_id: u32,
    pub generation: u32,
    pub virt_start: u64,
    pub virt_end: u64,
    pub addr_delta: u64,
    pub qxl_ram_size: u32,
}

impl MemSlot {
    /// The single slot covering the whole address space.
    pub const fn whole_address_space() -> Self {
        Self {
            slot_group_id: MEM_SLOT_GROUP_ID,
            slot_id: 0,
            generation: 0,
            virt_start: 0,
            virt_end: u64::MAX,
            addr_delta: 0,
            qxl_ram_size: u32::MAX,
        }
    }
}

/// Static capacity parameters reported to the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceInitInfo {
    pub num_memslots_groups: u32,
    pub num_memslots: u32,
    pub memslot_gen_bits: u8,
    pub memslot_id_bits: u8,
    pub n_surfaces: u32,
}

/// Handed back by the server once it is done with a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub id: CommandId,
    pub group_id: u32,
}

impl ReleaseInfo {
    pub fn for_command(command: &ReplayCommand) -> Self {
        Self {
            id: command.id,
            group_id: command.group_id,
        }
    }
}

/// Callbacks a protocol server invokes on a virtual display device.
pub trait DisplayDevice: Send + Sync {
    /// The server is ready to drive the device.
    fn attach(&self, worker: Arc<dyn DeviceWorker>);

    fn set_compression_level(&self, level: i32);

    fn set_mm_time(&self, mm_time: u32);

    fn init_info(&self) -> DeviceInitInfo;

    /// Next display command, or `None` if nothing is ready right now.
    fn get_command(&self) -> Option<ReplayCommand>;

    /// Whether the server should wait for a wakeup before polling again.
    fn req_cmd_notification(&self) -> bool;

    /// The server no longer needs a delivered command.
    fn release_resource(&self, release: ReleaseInfo);

    fn get_cursor_command(&self) -> Option<ReplayCommand>;

    fn req_cursor_notification(&self) -> bool;

    fn notify_update(&self, update_id: u32);

    fn flush_resources(&self) -> bool;
}

/// Display device fed from a replay session.
pub struct ReplayDevice {
    shared: Arc<Shared>,
    /// Delivered commands not yet released by the server.
    outstanding: Mutex<FxHashSet<CommandId>>,
}

impl ReplayDevice {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            outstanding: Mutex::new(FxHashSet::default()),
        }
    }

    /// Number of delivered commands awaiting release.
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }

    pub fn is_attached(&self) -> bool {
        self.shared.worker.get().is_some()
    }
}

impl DisplayDevice for ReplayDevice {
    fn attach(&self, worker: Arc<dyn DeviceWorker>) {
        if self.shared.worker.set(worker).is_err() {
            warn!("attach ignored, device already attached");
            return;
        }
        debug!("device attached");

        if let Some(worker) = self.shared.worker.get() {
            worker.add_memslot(MemSlot::whole_address_space());
            worker.start_vm();
        }
    }

    fn set_compression_level(&self, level: i32) {
        debug!(level, "set_compression_level");
    }

    fn set_mm_time(&self, _mm_time: u32) {}

    fn init_info(&self) -> DeviceInitInfo {
        DeviceInitInfo {
            num_memslots_groups: 1,
            num_memslots: 1,
            memslot_gen_bits: 1,
            memslot_id_bits: 1,
            n_surfaces: self.shared.max_surfaces,
        }
    }

    fn get_command(&self) -> Option<ReplayCommand> {
        let Some(item) = self.shared.queue.try_pop() else {
            filler::request_fill(&self.shared);
            return None;
        };

        match item {
            QueueItem::EndOfStream => {
                info!("recording exhausted");
                self.shared.end_replay();
                None
            }
            QueueItem::Command(command) => {
                self.outstanding.lock().insert(command.id);
                self.shared.stats.record_delivered();
                trace!(id = %command.id, kind = %command.kind, "delivered command");
                Some(command)
            }
        }
    }

    fn req_cmd_notification(&self) -> bool {
        true
    }

    fn release_resource(&self, release: ReleaseInfo) {
        if !self.outstanding.lock().remove(&release.id) {
            warn!(id = %release.id, "duplicate release ignored");
            return;
        }
        self.shared.release_command(release.id);
    }

    fn get_cursor_command(&self) -> Option<ReplayCommand> {
        None
    }

    fn req_cursor_notification(&self) -> bool {
        true
    }

    fn notify_update(&self, _update_id: u32) {}

    fn flush_resources(&self) -> bool {
        true
    }
}
