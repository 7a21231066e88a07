use serde::{Deserialize, Serialize};

/// Network interface category, derived from the interface name prefix
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InterfaceCategory {
    Vpn,
    WiFi,
    Ethernet,
    Docker,
    Other,
}

impl InterfaceCategory {
    pub fn from_name(name: &str) -> Self {
        if name.starts_with("tailscale") || name.starts_with("tun") || name.starts_with("wg") {
            Self::Vpn
        } else if name.starts_with("wl") {
            Self::WiFi
        } else if name.starts_with("en") || name.starts_with("eth") {
            Self::Ethernet
        } else if name.starts_with("docker") || name.starts_with("br-") || name.starts_with("veth")
        {
            Self::Docker
        } else {
            Self::Other
        }
    }
}

/// Per-category visibility filters, part of Settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceFilters {
    pub show_vpn: bool,
    pub show_wifi: bool,
    pub show_ethernet: bool,
    pub show_docker: bool,
    pub show_other: bool,
}

impl Default for InterfaceFilters {
    fn default() -> Self {
        Self {
            show_vpn: true,
            show_wifi: true,
            show_ethernet: true,
            show_docker: false, // internal bridges, hidden by default
            show_other: true,
        }
    }
}

impl InterfaceFilters {
    pub fn should_show(&self, category: InterfaceCategory) -> bool {
        match category {
            InterfaceCategory::Vpn => self.show_vpn,
            InterfaceCategory::WiFi => self.show_wifi,
            InterfaceCategory::Ethernet => self.show_ethernet,
            InterfaceCategory::Docker => self.show_docker,
            InterfaceCategory::Other => self.show_other,
        }
    }
}

/// A local, non-loopback interface address exposed to consumers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub ip: String,
    pub category: InterfaceCategory,
}

/// Enumerate local interfaces, classify them, and apply visibility filters.
/// Loopback is always excluded.
pub fn get_interfaces(filters: &InterfaceFilters) -> Vec<NetworkInterface> {
    let Ok(addrs) = get_if_addrs::get_if_addrs() else {
        tracing::warn!("Failed to enumerate network interfaces");
        return Vec::new();
    };

    addrs
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| {
            let category = InterfaceCategory::from_name(&iface.name);
            filters.should_show(category).then(|| NetworkInterface {
                ip: iface.ip().to_string(),
                name: iface.name,
                category,
            })
        })
        .collect()
}
