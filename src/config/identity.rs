//! Provisioner identity
//!
//! The identity is written into every PV's provisioned-by annotation and
//! must be stable across process restarts so existing PVs remain
//! recognizable as owned by this node's instance.

use k8s_openapi::api::core::v1::Node;

/// Stable per-node provisioner identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionerIdentity(String);

impl ProvisionerIdentity {
    /// Compute the identity from the Node object. With `use_node_name_only`
    /// the node UID is left out, which keeps the identity stable across
    /// node object re-creation.
    pub fn from_node(node: &Node, use_node_name_only: bool) -> Self {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let uid = node.metadata.uid.as_deref().unwrap_or_default();
        if use_node_name_only || uid.is_empty() {
            Self(format!("local-volume-provisioner-{}", name))
        } else {
            Self(format!("local-volume-provisioner-{}-{}", name, uid))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProvisionerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
