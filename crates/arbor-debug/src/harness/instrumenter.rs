use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::host::{
    BindingId, EventContext, EventFilter, ExecutionEventListener, Instrumenter, SourceListener,
};
use crate::source::LoadedSource;

struct ExecutionBinding {
    id: BindingId,
    filter: EventFilter,
    listener: Arc<dyn ExecutionEventListener>,
}

struct SourceBinding {
    id: BindingId,
    listener: Arc<dyn SourceListener>,
}

/// Instrumenter dispatching to listeners in attach order.
#[derive(Default)]
pub struct MemoryInstrumenter {
    execution: RwLock<Vec<ExecutionBinding>>,
    sources: RwLock<Vec<SourceBinding>>,
    loaded: Mutex<Vec<LoadedSource>>,
    next_binding: AtomicU64,
}

impl MemoryInstrumenter {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_id(&self) -> BindingId {
        BindingId(self.next_binding.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Register a source and notify the load listeners.
    pub fn load_source(&self, source: LoadedSource) {
        self.loaded.lock().push(source.clone());
        let listeners: Vec<Arc<dyn SourceListener>> = self
            .sources
            .read()
            .iter()
            .map(|binding| binding.listener.clone())
            .collect();
        trace!(uri = %source.uri, listeners = listeners.len(), "source loaded");
        for listener in listeners {
            listener.on_source_loaded(&source);
        }
    }

    /// Listeners attached at `context`, in dispatch order.
    #[must_use]
    pub fn listeners_at(
        &self,
        context: &dyn EventContext,
    ) -> Vec<(BindingId, Arc<dyn ExecutionEventListener>)> {
        self.execution
            .read()
            .iter()
            .filter(|binding| binding.filter.includes(context))
            .map(|binding| (binding.id, binding.listener.clone()))
            .collect()
    }

    /// Number of attached execution listeners.
    #[must_use]
    pub fn execution_binding_count(&self) -> usize {
        self.execution.read().len()
    }

    #[must_use]
    pub fn source_binding_count(&self) -> usize {
        self.sources.read().len()
    }
}

impl Instrumenter for MemoryInstrumenter {
    fn attach_execution_listener(
        &self,
        filter: EventFilter,
        listener: Arc<dyn ExecutionEventListener>,
    ) -> BindingId {
        let id = self.next_id();
        trace!(binding = id.0, tags = ?filter.tags, section = ?filter.section, "execution listener attached");
        self.execution.write().push(ExecutionBinding {
            id,
            filter,
            listener,
        });
        id
    }

    fn attach_source_listener(
        &self,
        listener: Arc<dyn SourceListener>,
        notify_loaded: bool,
    ) -> BindingId {
        let id = self.next_id();
        self.sources.write().push(SourceBinding {
            id,
            listener: listener.clone(),
        });
        if notify_loaded {
            let loaded = self.loaded.lock().clone();
            for source in &loaded {
                listener.on_source_loaded(source);
            }
        }
        id
    }

    fn detach(&self, binding: BindingId) {
        self.execution.write().retain(|attached| attached.id != binding);
        self.sources.write().retain(|attached| attached.id != binding);
        trace!(binding = binding.0, "binding detached");
    }

    fn lookup(&self, context: &dyn EventContext, candidates: &[BindingId]) -> Vec<BindingId> {
        self.execution
            .read()
            .iter()
            .filter(|binding| candidates.contains(&binding.id) && binding.filter.includes(context))
            .map(|binding| binding.id)
            .collect()
    }
}
