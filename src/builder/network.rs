use super::{assert_not_none, Builder, BuilderError};

/// How the guest network device reaches the outside world
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkAttachment {
    /// Address translated through the host
    Nat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDevice {
    pub iface_id: String,
    /// Left to the engine when not set
    pub mac_address: Option<String>,
    pub attachment: NetworkAttachment,
}

#[derive(Debug)]
pub struct NetworkDeviceBuilder {
    iface_id: Option<String>,
    mac_address: Option<String>,
    attachment: Option<NetworkAttachment>,
}

impl Default for NetworkDeviceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkDeviceBuilder {
    pub fn new() -> NetworkDeviceBuilder {
        NetworkDeviceBuilder {
            iface_id: None,
            mac_address: None,
            attachment: None,
        }
    }

    pub fn with_iface_id(mut self, iface_id: String) -> NetworkDeviceBuilder {
        self.iface_id = Some(iface_id);
        self
    }

    pub fn with_mac_address(mut self, mac_address: String) -> NetworkDeviceBuilder {
        self.mac_address = Some(mac_address);
        self
    }

    pub fn with_nat(mut self) -> NetworkDeviceBuilder {
        self.attachment = Some(NetworkAttachment::Nat);
        self
    }
}

impl Builder<NetworkDevice> for NetworkDeviceBuilder {
    fn try_build(self) -> Result<NetworkDevice, BuilderError> {
        Ok(NetworkDevice {
            iface_id: assert_not_none(stringify!(self.iface_id), self.iface_id)?,
            mac_address: self.mac_address,
            attachment: assert_not_none(stringify!(self.attachment), self.attachment)?,
        })
    }
}
