use std::collections::HashSet;

use crate::{config::TunnelbarConfig, tunneling::tunnel::TunnelKey};

/// Tunnel identities that appear, disappear or stay between two configs.
///
/// Identities are `(host, local_port)`, so editing only the remote port of a
/// forward shows up in `unchanged`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ConfigDiff {
    pub added: HashSet<TunnelKey>,
    pub removed: HashSet<TunnelKey>,
    pub unchanged: HashSet<TunnelKey>,
}
impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub(crate) fn tunnel_keys(config: &TunnelbarConfig) -> HashSet<TunnelKey> {
    config.tunnel_specs().map(|spec| spec.key()).collect()
}

pub(crate) fn diff_configs(old: &TunnelbarConfig, new: &TunnelbarConfig) -> ConfigDiff {
    let old_keys = tunnel_keys(old);
    let new_keys = tunnel_keys(new);
    ConfigDiff {
        added: new_keys.difference(&old_keys).cloned().collect(),
        removed: old_keys.difference(&new_keys).cloned().collect(),
        unchanged: old_keys.intersection(&new_keys).cloned().collect(),
    }
}
