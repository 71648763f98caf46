use std::collections::{HashMap, HashSet};

use relay_net::tcp::Token;
use relay_proto::generate_socks_id;

/// One active SOCKS link: a local TCP client paired with the `link_id`
/// (the wire protocol's "socks token") that identifies it to the remote
/// side.
#[derive(Clone, Copy, Debug)]
struct Link {
    link_id: u64,
    tcp_token: Token,
}

/// Bidirectional lookup between TCP clients and their pipe-side `link_id`,
/// plus the set of `link_id`s we've already told the remote side to close
/// (so a lagging `STATUS` reply doesn't get logged as unexpected).
///
/// Mirrors keeping `_socks_clients_by_socks`, `_socks_clients_by_tcp`, and
/// `_pending_socks_disconnect_uids` behind one lock.
#[derive(Default)]
pub struct LinkTable {
    by_link_id: HashMap<u64, Link>,
    by_tcp_token: HashMap<Token, Link>,
    pending_disconnect_uids: HashSet<u32>,
}

impl LinkTable {
    pub fn register(&mut self, tcp_token: Token) -> u64 {
        let link_id = self.generate_link_id();
        let link = Link { link_id, tcp_token };
        self.by_link_id.insert(link_id, link);
        self.by_tcp_token.insert(tcp_token, link);
        link_id
    }

    pub fn link_id_for_token(&self, tcp_token: Token) -> Option<u64> {
        self.by_tcp_token.get(&tcp_token).map(|l| l.link_id)
    }

    pub fn token_for_link_id(&self, link_id: u64) -> Option<Token> {
        self.by_link_id.get(&link_id).map(|l| l.tcp_token)
    }

    pub fn unregister_by_token(&mut self, tcp_token: Token) -> Option<u64> {
        let link = self.by_tcp_token.remove(&tcp_token)?;
        self.by_link_id.remove(&link.link_id);
        Some(link.link_id)
    }

    pub fn unregister_by_link_id(&mut self, link_id: u64) -> Option<Token> {
        let link = self.by_link_id.remove(&link_id)?;
        self.by_tcp_token.remove(&link.tcp_token);
        Some(link.tcp_token)
    }

    pub fn mark_disconnect_pending(&mut self, uid: u32) {
        self.pending_disconnect_uids.insert(uid);
    }

    /// Returns `true` if `uid` was a disconnect we initiated (and removes
    /// it), `false` if it's unexpected and worth logging.
    pub fn take_pending_disconnect(&mut self, uid: u32) -> bool {
        self.pending_disconnect_uids.remove(&uid)
    }

    fn generate_link_id(&self) -> u64 {
        loop {
            let link_id = generate_socks_id();
            if !self.by_link_id.contains_key(&link_id) {
                return link_id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_looks_up_both_directions() {
        let mut table = LinkTable::default();
        let token = Token(7);
        let link_id = table.register(token);

        assert_eq!(table.link_id_for_token(token), Some(link_id));
        assert_eq!(table.token_for_link_id(link_id), Some(token));
    }

    #[test]
    fn unregister_by_token_clears_both_maps() {
        let mut table = LinkTable::default();
        let token = Token(1);
        let link_id = table.register(token);

        assert_eq!(table.unregister_by_token(token), Some(link_id));
        assert_eq!(table.link_id_for_token(token), None);
        assert_eq!(table.token_for_link_id(link_id), None);
    }

    #[test]
    fn pending_disconnect_is_one_shot() {
        let mut table = LinkTable::default();
        table.mark_disconnect_pending(42);
        assert!(table.take_pending_disconnect(42));
        assert!(!table.take_pending_disconnect(42));
    }
}
