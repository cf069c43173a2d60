//! Rendezvous (highest-random-weight) rule ownership.
//!
//! Every node scores every (member, rule) pair identically, so nodes
//! agree on ownership without coordination, and a membership change
//! moves only the rules whose winning member left or the new member now
//! wins (about 1/M of them).

/// Score for one (node, rule) pair: the leading 8 bytes of the MD5 of
/// the concatenation, as a big-endian integer. MD5 is stable across
/// platforms and already in the dependency tree for rule IDs.
fn score(node_id: &str, name: &str) -> u64 {
    let digest = md5::compute(format!("{node_id}\x00{name}").as_bytes());
    u64::from_be_bytes(digest.0[..8].try_into().unwrap())
}

/// Pick the owner of `name` among `members`.
///
/// Returns `None` for an empty member set. Equal scores resolve to the
/// lexicographically greatest node ID, so the choice stays total.
pub fn rendezvous_owner<'a, I>(members: I, name: &str) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    members
        .into_iter()
        .max_by(|a, b| score(a, name).cmp(&score(b, name)).then(a.cmp(b)))
}
