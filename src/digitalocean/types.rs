//! Wire types for the DigitalOcean droplets API.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{Instance, InstanceId};

#[derive(Debug, Serialize)]
pub(crate) struct CreateDropletRequest<'a> {
    pub(crate) name: &'a str,
    pub(crate) region: &'a str,
    pub(crate) size: &'a str,
    pub(crate) image: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) ssh_keys: Vec<String>,
    pub(crate) tags: &'a [String],
    pub(crate) user_data: &'a str,
    pub(crate) ipv6: bool,
    pub(crate) monitoring: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct DropletAction<'a> {
    #[serde(rename = "type")]
    pub(crate) kind: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DropletEnvelope {
    pub(crate) droplet: Droplet,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DropletList {
    #[serde(default)]
    pub(crate) droplets: Vec<Droplet>,
    #[serde(default)]
    pub(crate) links: Links,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Links {
    #[serde(default)]
    pub(crate) pages: Pages,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Pages {
    pub(crate) next: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Droplet {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) status: String,
    pub(crate) created_at: DateTime<Utc>,
    #[serde(default)]
    pub(crate) networks: Networks,
    #[serde(default)]
    pub(crate) tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Networks {
    #[serde(default)]
    pub(crate) v4: Vec<NetworkV4>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NetworkV4 {
    pub(crate) ip_address: String,
    #[serde(rename = "type")]
    pub(crate) kind: String,
}

/// Error body returned with non-2xx responses.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) message: String,
}

impl Droplet {
    fn public_ipv4(&self) -> Option<Ipv4Addr> {
        self.networks
            .v4
            .iter()
            .filter(|network| network.kind == "public")
            .find_map(|network| network.ip_address.parse().ok())
    }
}

impl From<Droplet> for Instance {
    fn from(droplet: Droplet) -> Self {
        let public_ipv4 = droplet.public_ipv4();
        Self {
            id: InstanceId::new(droplet.id.to_string()),
            name: droplet.name,
            status: droplet.status,
            created_at: droplet.created_at,
            public_ipv4,
            tags: droplet.tags,
        }
    }
}
