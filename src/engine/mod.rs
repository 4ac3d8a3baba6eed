//! Per-interface address class tables and the request-time operations the
//! server's message handlers call into.

use std::{collections::HashMap, net::Ipv6Addr, sync::Arc};

use arc_swap::ArcSwap;
use compact_str::CompactString;
use dhcproto::v6::Message;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::{
    addrclass::{AddressClass, ClassId, ClassSnapshot},
    error::{ConfigError, PolicyError},
    extensions::PolicyMessageExtV6,
    lifetime::Lifetimes,
    selector::ClassSelector,
    Duid,
};


/// What the engine needs to know about a requesting client.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub duid: Duid,
    pub address: Option<Ipv6Addr>,
    pub message: Option<Message>,
}

impl ClientRequest {
    pub fn new(duid: Duid) -> Self {
        Self {
            duid,
            address: None,
            message: None,
        }
    }

    pub fn with_address(mut self, address: Ipv6Addr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.message = Some(message);
        self
    }

    /// Build a request from a client message. Messages without a Client
    /// Identifier cannot be classified.
    pub fn from_message(msg: &Message) -> Option<Self> {
        let duid = msg.client_duid()?;
        Some(Self {
            duid,
            address: msg.ia_na_address(),
            message: Some(msg.clone()),
        })
    }
}

/// The address classes configured on one interface, in configuration order.
#[derive(Debug)]
pub struct InterfaceClasses {
    pub name: CompactString,
    pub classes: Vec<Arc<AddressClass>>,
}

/// All interfaces' classes, replaced as a whole on reload.
#[derive(Debug, Default)]
pub struct ClassTable {
    interfaces: Vec<InterfaceClasses>,
    by_id: HashMap<ClassId, Arc<AddressClass>>,
}

impl ClassTable {
    pub fn new(interfaces: Vec<InterfaceClasses>) -> Result<Self, ConfigError> {
        let mut by_id = HashMap::new();
        for (i, iface) in interfaces.iter().enumerate() {
            if interfaces[..i].iter().any(|other| other.name == iface.name) {
                return Err(ConfigError::DuplicateInterface(iface.name.clone()));
            }
            for class in &iface.classes {
                by_id.insert(class.id(), Arc::clone(class));
            }
        }
        Ok(Self { interfaces, by_id })
    }

    pub fn interface(&self, name: &str) -> Option<&InterfaceClasses> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    pub fn interfaces(&self) -> &[InterfaceClasses] {
        &self.interfaces
    }

    pub fn class(&self, id: ClassId) -> Option<&Arc<AddressClass>> {
        self.by_id.get(&id)
    }

    /// Interface owning the class.
    pub fn interface_of(&self, id: ClassId) -> Option<&str> {
        self.interfaces
            .iter()
            .find(|i| i.classes.iter().any(|c| c.id() == id))
            .map(|i| i.name.as_str())
    }

    pub fn class_count(&self) -> usize {
        self.by_id.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceSnapshot {
    pub name: CompactString,
    pub classes: Vec<ClassSnapshot>,
}

pub struct PolicyEngine {
    table: ArcSwap<ClassTable>,
}

impl PolicyEngine {
    pub fn new(table: ClassTable) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
        }
    }

    /// Current table. In-flight requests keep the table they loaded even if
    /// a reload swaps in a new one meanwhile.
    pub fn table(&self) -> Arc<ClassTable> {
        self.table.load_full()
    }

    pub fn reload(&self, table: ClassTable) {
        let classes = table.class_count();
        let interfaces = table.interfaces().len();
        self.table.store(Arc::new(table));
        info!(interfaces, classes, "address class table replaced");
    }

    fn class(&self, id: ClassId) -> Result<Arc<AddressClass>, PolicyError> {
        self.table
            .load()
            .class(id)
            .cloned()
            .ok_or(PolicyError::UnknownClass(id))
    }

    pub fn select_class(&self, iface: &str, req: &ClientRequest) -> Result<ClassId, PolicyError> {
        self.select_class_with(iface, req, &mut rand::rng())
    }

    #[instrument(skip(self, req, rng), fields(duid = %req.duid))]
    pub fn select_class_with<R: Rng>(
        &self,
        iface: &str,
        req: &ClientRequest,
        rng: &mut R,
    ) -> Result<ClassId, PolicyError> {
        let table = self.table.load();
        let classes = table
            .interface(iface)
            .ok_or_else(|| PolicyError::UnknownInterface(iface.into()))?;
        ClassSelector::new(&classes.classes).select(req, rng)
    }

    pub fn negotiate(&self, id: ClassId, requested: &Lifetimes) -> Result<Lifetimes, PolicyError> {
        self.class(id)?.negotiate(requested)
    }

    pub fn allocate_address(&self, id: ClassId) -> Result<Ipv6Addr, PolicyError> {
        self.allocate_address_with(id, &mut rand::rng())
    }

    /// Draw a candidate address from the class's pool. The caller checks it
    /// against existing leases and draws again on collision.
    pub fn allocate_address_with<R: Rng>(
        &self,
        id: ClassId,
        rng: &mut R,
    ) -> Result<Ipv6Addr, PolicyError> {
        let addr = self.class(id)?.random_addr(rng);
        debug!(class = %id, %addr, "drew address");
        Ok(addr)
    }

    pub fn admit(&self, id: ClassId) -> Result<u64, PolicyError> {
        self.class(id)?.admit(1)
    }

    pub fn release(&self, id: ClassId) -> Result<u64, PolicyError> {
        Ok(self.class(id)?.release(1))
    }

    /// Class whose pool on `iface` contains `addr`, if any.
    pub fn class_for_address(&self, iface: &str, addr: &Ipv6Addr) -> Option<ClassId> {
        self.table
            .load()
            .interface(iface)?
            .classes
            .iter()
            .find(|c| c.addr_in_pool(addr))
            .map(|c| c.id())
    }

    pub fn snapshot(&self) -> Vec<InterfaceSnapshot> {
        self.table
            .load()
            .interfaces()
            .iter()
            .map(|iface| InterfaceSnapshot {
                name: iface.name.clone(),
                classes: iface.classes.iter().map(|c| c.snapshot()).collect(),
            })
            .collect()
    }
}
