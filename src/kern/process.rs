//! Processes
//!
//! A process is the unit of ownership here: it holds the handle table that
//! names its objects, the resource limit its objects are charged against, the
//! capabilities its threads are held to, and weak references to its threads.
//! Address spaces are out of scope.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use log::debug;

use super::auto_object::{AutoObject, ObjectKind};
use super::capabilities::Capabilities;
use super::kernel::Kernel;
use super::lock::SpinLock;
use super::resource_limit::ResourceLimit;
use super::thread::KThread;
use crate::ipc::handle_table::HandleTable;
use crate::types::{ObjectId, ProcessId, ThreadId};

pub struct KProcess {
    header: AutoObject,
    id: ProcessId,
    kernel: Arc<Kernel>,
    handle_table: HandleTable,
    resource_limit: Option<Arc<ResourceLimit>>,
    capabilities: Capabilities,
    threads: SpinLock<BTreeMap<ThreadId, Weak<KThread>>>,
}

impl KProcess {
    /// Process with every core and priority granted
    pub fn new(kernel: &Arc<Kernel>, resource_limit: Option<Arc<ResourceLimit>>) -> Arc<Self> {
        Self::with_capabilities(kernel, resource_limit, Capabilities::unrestricted(kernel.config()))
    }

    pub fn with_capabilities(
        kernel: &Arc<Kernel>,
        resource_limit: Option<Arc<ResourceLimit>>,
        capabilities: Capabilities,
    ) -> Arc<Self> {
        let process = Arc::new(Self {
            header: AutoObject::new(ObjectKind::Process),
            id: ProcessId::new(),
            kernel: kernel.clone(),
            handle_table: HandleTable::new(kernel, capabilities.handle_table_size()),
            resource_limit,
            capabilities,
            threads: SpinLock::new(BTreeMap::new()),
        });
        debug!(
            "created process {:?} cores {:?} handles {}",
            process.id,
            capabilities.core_mask(),
            capabilities.handle_table_size()
        );
        process
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn object_id(&self) -> ObjectId {
        self.header.id()
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn handle_table(&self) -> &HandleTable {
        &self.handle_table
    }

    pub fn resource_limit(&self) -> Option<&Arc<ResourceLimit>> {
        self.resource_limit.as_ref()
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub(crate) fn add_thread(&self, thread: &Arc<KThread>) {
        self.threads.lock().insert(thread.id(), Arc::downgrade(thread));
    }

    pub(crate) fn remove_thread(&self, id: ThreadId) {
        self.threads.lock().remove(&id);
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Live threads of the process
    pub fn threads(&self) -> Vec<Arc<KThread>> {
        self.threads.lock().values().filter_map(Weak::upgrade).collect()
    }

    /// Ask every thread of the process to terminate
    pub fn request_termination(&self) {
        for thread in self.threads() {
            thread.request_termination();
        }
    }
}

impl Drop for KProcess {
    fn drop(&mut self) {
        self.handle_table.finalize();
        debug!("destroyed process {:?}", self.id);
    }
}
