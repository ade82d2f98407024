// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-object command tables and the node's object registry.
//!
//! Each attached object instance builds a [`CommandTable`] when it is
//! created, mapping the packet types it understands to handler closures.
//! The command task looks up the target instance in the [`ObjectRegistry`]
//! and runs the matching handler. Handlers always run on the command task,
//! one at a time.

use crate::command::Command;
use crate::error::{ReplicationError, Result};
use crate::packet::CommandType;
use crate::version::{InstanceId, ObjectId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::trace;

/// Handler invoked with one packet.
pub type Handler = Box<dyn Fn(Command) -> Result<()> + Send + Sync>;

/// Packet-type to handler map for one object instance.
#[derive(Default)]
pub struct CommandTable {
    handlers: HashMap<CommandType, Handler>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler, replacing any previous one for `command`.
    pub fn with(mut self, command: CommandType, handler: impl Fn(Command) -> Result<()> + Send + Sync + 'static) -> Self {
        self.handlers.insert(command, Box::new(handler));
        self
    }

    pub fn handles(&self, command: CommandType) -> bool {
        self.handlers.contains_key(&command)
    }

    pub fn dispatch(&self, command: Command) -> Result<()> {
        match self.handlers.get(&command.command()) {
            Some(handler) => handler(command),
            None => Err(ReplicationError::Internal(format!(
                "no handler for {:?}",
                command.command()
            ))),
        }
    }
}

impl std::fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandTable")
            .field("commands", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Attached object instances of one node.
#[derive(Default)]
pub struct ObjectRegistry {
    objects: RwLock<HashMap<ObjectId, BTreeMap<InstanceId, Arc<CommandTable>>>>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, object_id: ObjectId, instance_id: InstanceId, table: CommandTable) {
        self.objects
            .write()
            .entry(object_id)
            .or_default()
            .insert(instance_id, Arc::new(table));
        trace!(object_id = %object_id, instance_id = %instance_id, "Attached object instance");
    }

    pub fn remove(&self, object_id: ObjectId, instance_id: InstanceId) -> bool {
        let mut objects = self.objects.write();
        let Some(instances) = objects.get_mut(&object_id) else {
            return false;
        };
        let removed = instances.remove(&instance_id).is_some();
        if instances.is_empty() {
            objects.remove(&object_id);
        }
        if removed {
            trace!(object_id = %object_id, instance_id = %instance_id, "Detached object instance");
        }
        removed
    }

    pub fn contains(&self, object_id: ObjectId, instance_id: InstanceId) -> bool {
        self.objects
            .read()
            .get(&object_id)
            .is_some_and(|instances| instances.contains_key(&instance_id))
    }

    pub fn instance_count(&self) -> usize {
        self.objects.read().values().map(BTreeMap::len).sum()
    }

    /// Route a packet to its instance, or for [`InstanceId::ALL`] to every
    /// instance of the object that handles its type. Returns the number of
    /// handlers run.
    ///
    /// Every handler runs even if an earlier one fails; the first error is
    /// returned.
    pub fn dispatch(&self, command: Command) -> Result<usize> {
        let header = command.header();
        let object_id = header.object_id;
        let instance_id = header.instance_id;
        let command_type = header.command;

        let tables: Vec<Arc<CommandTable>> = {
            let objects = self.objects.read();
            let instances = objects
                .get(&object_id)
                .ok_or_else(|| ReplicationError::UnknownObject(object_id.to_string()))?;
            if instance_id.is_all() {
                instances
                    .values()
                    .filter(|table| table.handles(command_type))
                    .cloned()
                    .collect()
            } else {
                let table = instances.get(&instance_id).ok_or_else(|| {
                    ReplicationError::UnknownObject(format!("{} instance {}", object_id, instance_id))
                })?;
                vec![Arc::clone(table)]
            }
        };

        let mut first_error = None;
        for table in &tables {
            if let Err(e) = table.dispatch(command.retain()) {
                first_error.get_or_insert(e);
            }
        }
        command.release();
        match first_error {
            Some(e) => Err(e),
            None => Ok(tables.len()),
        }
    }
}

impl std::fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("instances", &self.instance_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketHeader;
    use crate::version::{NodeId, Version};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const OBJ: ObjectId = ObjectId::from_u128(21);

    fn command(instance: InstanceId, command: CommandType) -> Command {
        Command::local(
            PacketHeader::control(NodeId::new("n"), OBJ, instance, command, Version(1)),
            Vec::new(),
        )
    }

    fn counting_table(counter: Arc<AtomicUsize>, command: CommandType) -> CommandTable {
        CommandTable::new().with(command, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_dispatch_to_instance() {
        let registry = ObjectRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.insert(OBJ, InstanceId(1), counting_table(hits.clone(), CommandType::ObjectInstance));
        registry.insert(OBJ, InstanceId(2), counting_table(hits.clone(), CommandType::ObjectInstance));

        assert_eq!(registry.dispatch(command(InstanceId(2), CommandType::ObjectInstance)).unwrap(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_broadcast_skips_instances_without_handler() {
        let registry = ObjectRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.insert(OBJ, InstanceId(1), counting_table(hits.clone(), CommandType::ObjectSubscribe));
        registry.insert(OBJ, InstanceId(2), counting_table(hits.clone(), CommandType::ObjectInstance));
        registry.insert(OBJ, InstanceId(3), counting_table(hits.clone(), CommandType::ObjectInstance));

        assert_eq!(registry.dispatch(command(InstanceId::ALL, CommandType::ObjectInstance)).unwrap(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unknown_object_and_instance() {
        let registry = ObjectRegistry::new();
        assert!(matches!(
            registry.dispatch(command(InstanceId(1), CommandType::ObjectInstance)),
            Err(ReplicationError::UnknownObject(_))
        ));
        registry.insert(OBJ, InstanceId(1), CommandTable::new());
        assert!(matches!(
            registry.dispatch(command(InstanceId(5), CommandType::ObjectInstance)),
            Err(ReplicationError::UnknownObject(_))
        ));
    }

    #[test]
    fn test_missing_handler_for_addressed_packet() {
        let registry = ObjectRegistry::new();
        registry.insert(OBJ, InstanceId(1), CommandTable::new());
        assert!(matches!(
            registry.dispatch(command(InstanceId(1), CommandType::ObjectCommit)),
            Err(ReplicationError::Internal(_))
        ));
    }

    #[test]
    fn test_remove() {
        let registry = ObjectRegistry::new();
        registry.insert(OBJ, InstanceId(1), CommandTable::new());
        assert!(registry.contains(OBJ, InstanceId(1)));
        assert!(registry.remove(OBJ, InstanceId(1)));
        assert!(!registry.remove(OBJ, InstanceId(1)));
        assert_eq!(registry.instance_count(), 0);
    }

    #[test]
    fn test_handler_sees_shared_packet() {
        let registry = ObjectRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));
        for instance in 1..=2 {
            let seen = seen.clone();
            registry.insert(
                OBJ,
                InstanceId(instance),
                CommandTable::new().with(CommandType::ObjectDelta, move |cmd| {
                    // Dispatcher holds one handle, the handler another.
                    assert!(cmd.ref_count() >= 2);
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }
        registry.dispatch(command(InstanceId::ALL, CommandType::ObjectDelta)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
