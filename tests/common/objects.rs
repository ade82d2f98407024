//! Replicated objects used across the integration tests.

use object_replication::{ChangeType, DataIStream, DataOStream, Distributable, Result};

/// A counter whose delta is the amount added since the last pack.
#[derive(Debug, Clone)]
pub struct Counter {
    pub value: u64,
    dirty: u64,
    change_type: ChangeType,
}

impl Counter {
    pub fn new(change_type: ChangeType) -> Self {
        Self {
            value: 0,
            dirty: 0,
            change_type,
        }
    }

    pub fn add(&mut self, by: u64) {
        self.value += by;
        self.dirty += by;
    }
}

impl Distributable for Counter {
    fn change_type(&self) -> ChangeType {
        self.change_type
    }

    fn get_instance_data(&self, os: &mut DataOStream) -> Result<()> {
        os.write_u64(self.value)
    }

    fn apply_instance_data(&mut self, is: &mut DataIStream) -> Result<()> {
        self.value = is.read_u64()?;
        Ok(())
    }

    fn pack(&mut self, os: &mut DataOStream) -> Result<()> {
        if self.dirty > 0 {
            os.write_u64(self.dirty)?;
            self.dirty = 0;
        }
        Ok(())
    }

    fn unpack(&mut self, is: &mut DataIStream) -> Result<()> {
        self.value += is.read_u64()?;
        Ok(())
    }
}

/// A named scene graph node list, large enough to span many chunks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scene {
    pub name: String,
    pub nodes: Vec<String>,
    pub payload: Vec<u8>,
    appended: Vec<String>,
}

impl Scene {
    pub fn new(name: &str, payload_len: usize) -> Self {
        Self {
            name: name.to_string(),
            nodes: Vec::new(),
            payload: (0..payload_len).map(|i| (i % 251) as u8).collect(),
            appended: Vec::new(),
        }
    }

    pub fn push(&mut self, node: &str) {
        self.nodes.push(node.to_string());
        self.appended.push(node.to_string());
    }
}

impl Distributable for Scene {
    fn change_type(&self) -> ChangeType {
        ChangeType::Delta
    }

    fn get_instance_data(&self, os: &mut DataOStream) -> Result<()> {
        os.write_str(&self.name)?;
        os.write_value(&self.nodes)?;
        os.write_blob(&self.payload)
    }

    fn apply_instance_data(&mut self, is: &mut DataIStream) -> Result<()> {
        self.name = is.read_string()?;
        self.nodes = is.read_value()?;
        self.payload = is.read_blob()?;
        Ok(())
    }

    fn pack(&mut self, os: &mut DataOStream) -> Result<()> {
        if self.appended.is_empty() {
            return Ok(());
        }
        os.write_value(&self.appended)?;
        self.appended.clear();
        Ok(())
    }

    fn unpack(&mut self, is: &mut DataIStream) -> Result<()> {
        let appended: Vec<String> = is.read_value()?;
        self.nodes.extend(appended);
        Ok(())
    }
}

/// Reads only the first field of what it writes.
#[derive(Debug, Default)]
pub struct Sloppy {
    pub first: u32,
    pub second: u32,
}

impl Distributable for Sloppy {
    fn change_type(&self) -> ChangeType {
        ChangeType::Instance
    }

    fn get_instance_data(&self, os: &mut DataOStream) -> Result<()> {
        os.write_u32(self.first)?;
        os.write_u32(self.second)
    }

    fn apply_instance_data(&mut self, is: &mut DataIStream) -> Result<()> {
        self.first = is.read_u32()?;
        Ok(())
    }
}
