//! Logical names of the unseal material: one root token plus one entry per
//! unseal-key share, all sharing a common prefix.

/// Name of the unsealer container whose arguments carry `--key-prefix=`.
pub const UNSEALER_CONTAINER: &str = "vault-unsealer";

const KEY_PREFIX_FLAG: &str = "--key-prefix=";

/// `"<prefix>-root-token"`.
pub fn token_name(prefix: &str) -> String {
    format!("{prefix}-root-token")
}

/// `"<prefix>-unseal-key-<index>"`.
pub fn unseal_key_name(prefix: &str, index: u32) -> String {
    format!("{prefix}-unseal-key-{index}")
}

/// The ordered list of key names for one prefix: the root token first, then
/// every unseal-key share in index order.
///
/// Backup and restore index two key sets position by position, so the order
/// is part of the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySet {
    names: Vec<String>,
}

impl KeySet {
    pub fn build(prefix: &str, share_count: u32) -> Self {
        let mut names = Vec::with_capacity(share_count as usize + 1);
        names.push(token_name(prefix));
        names.extend((0..share_count).map(|i| unseal_key_name(prefix, i)));
        Self { names }
    }

    #[cfg(test)]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Pairs each name of `self` with the name at the same position in
    /// `other`.
    pub fn zip<'a>(&'a self, other: &'a KeySet) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.names
            .iter()
            .zip(other.names.iter())
            .map(|(a, b)| (a.as_str(), b.as_str()))
    }
}

/// Extract the value of the last `--key-prefix=` argument, if any.
pub fn parse_key_prefix<S: AsRef<str>>(args: &[S]) -> Option<String> {
    args.iter()
        .filter_map(|arg| arg.as_ref().strip_prefix(KEY_PREFIX_FLAG))
        .last()
        .map(str::to_owned)
}

/// Prefix the unsealer uses when it is not given one explicitly:
/// `k8s.<cluster>.<namespace>.<name>`, with `-` standing in for an unknown
/// cluster name.
pub fn default_key_prefix(cluster_name: Option<&str>, namespace: &str, name: &str) -> String {
    let cluster = cluster_name.filter(|c| !c.is_empty()).unwrap_or("-");
    format!("k8s.{cluster}.{namespace}.{name}")
}
