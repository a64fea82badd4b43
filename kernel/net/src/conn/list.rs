//! Per-protocol connection lists.
//!
//! Each list is a doubly linked list of *chains*; each chain is a doubly
//! linked list of connections sharing one local port:
//!
//! ```text
//! list head
//!    |
//!    v
//! [chain :80] <-> [chain :22] <-> [chain :5001]      (prev/next_chain)
//!    |               |
//!    v               v
//!  conn A          conn D                            (prev/next_conn)
//!    |
//!  conn B
//!    |
//!  conn C
//! ```
//!
//! Chain links and the chain access counter are only meaningful on the
//! first connection of a chain.  A chain that is hit more often than the
//! configured threshold moves to the front of its list, and a connection
//! that is hit more often than the threshold moves to the front of its
//! chain.

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use super::{ConnId, ConnTable};
use crate::addr::{ConnAddr, ConnProtoIx};
use crate::error::{NetError, NetResult};

/// How a search result matched the requested address pair.
///
/// Ordered from best to worst: a search prefers `Full` over
/// `FullWildcard` over `Half` over `HalfWildcard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnMatch {
    /// Local and remote addresses both match
    Full,
    /// Wildcard local IP, same port, and matching remote
    FullWildcard,
    /// Local address matches, no remote address set
    Half,
    /// Wildcard local IP, same port, no remote address set
    HalfWildcard,
}

/// Outcome of [`ConnTable::srch`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SrchResult {
    /// Best match, if any
    pub found: Option<(ConnId, ConnMatch)>,
    /// Records found with an invalidated local address.  They have been
    /// unlinked; the caller must close them.
    pub stale: Vec<ConnId>,
}

/// Position of an in-progress bulk traversal.
///
/// Holds the next connection of the current chain and the next chain to
/// visit.  Freeing or unlinking a record through [`ConnTable::free`] or
/// [`ConnTable::list_unlink`] with this cursor moves it past that record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListCursor {
    pub next_chain: Option<ConnId>,
    pub next_conn: Option<ConnId>,
}

impl ListCursor {
    fn skip(&mut self, id: ConnId, next_conn: Option<ConnId>, next_chain: Option<ConnId>, is_head: bool) {
        if self.next_conn == Some(id) {
            self.next_conn = next_conn;
        }
        if self.next_chain == Some(id) {
            // A surviving sibling takes over the chain's place in the list.
            self.next_chain = if is_head && next_conn.is_some() {
                next_conn
            } else {
                next_chain
            };
        }
    }
}

impl ConnTable {
    /// First chain of list `ix`.
    #[inline]
    pub fn list_head(&self, ix: ConnProtoIx) -> Option<ConnId> {
        self.lists[ix.index()]
    }

    fn set_list_head(&mut self, ix: ConnProtoIx, head: Option<ConnId>) {
        self.lists[ix.index()] = head;
    }

    /// Chain whose connections are bound to `port`.
    fn chain_for_port(&self, ix: ConnProtoIx, port: [u8; 2]) -> Option<ConnId> {
        let mut chain = self.list_head(ix);
        while let Some(head) = chain {
            let rec = self.rec(head);
            if rec.addr_local.port_bytes() == port {
                return Some(head);
            }
            chain = rec.next_chain;
        }
        None
    }

    /// Make `new_head` take `old_head`'s place in the list, inheriting its
    /// chain links and chain counter.
    fn replace_chain_head(&mut self, old_head: ConnId, new_head: ConnId) {
        let (ix, prev_chain, next_chain, ctr) = {
            let old = self.rec(old_head);
            let ix = old
                .conn_list
                .unwrap_or_else(|| panic!("{} chain head is not linked", old_head));
            (ix, old.prev_chain, old.next_chain, old.chain_accessed_ctr)
        };

        {
            let new = self.rec_mut(new_head);
            new.prev_chain = prev_chain;
            new.next_chain = next_chain;
            new.chain_accessed_ctr = ctr;
        }
        match prev_chain {
            Some(p) => self.rec_mut(p).next_chain = Some(new_head),
            None => self.set_list_head(ix, Some(new_head)),
        }
        if let Some(n) = next_chain {
            self.rec_mut(n).prev_chain = Some(new_head);
        }

        let old = self.rec_mut(old_head);
        old.prev_chain = None;
        old.next_chain = None;
        old.chain_accessed_ctr = 0;
    }

    // ========================================================================
    // Add / Unlink
    // ========================================================================

    /// Link a record into the list selected by its protocol index.
    ///
    /// A new port starts a new chain at the front of the list; a known port
    /// puts the record at the front of that chain.
    pub fn list_add(&mut self, id: ConnId) -> NetResult<()> {
        let rec = self.conn(id)?;
        if !rec.addr_local_valid {
            return Err(NetError::InvalidArg);
        }
        if rec.is_linked() {
            return Err(NetError::AlreadyExists);
        }
        let ix = rec.proto_ix;
        let port = rec.addr_local.port_bytes();

        match self.chain_for_port(ix, port) {
            Some(head) => {
                self.replace_chain_head(head, id);
                self.rec_mut(head).prev_conn = Some(id);
                let rec = self.rec_mut(id);
                rec.prev_conn = None;
                rec.next_conn = Some(head);
            }
            None => {
                let old_head = self.list_head(ix);
                if let Some(h) = old_head {
                    self.rec_mut(h).prev_chain = Some(id);
                }
                let rec = self.rec_mut(id);
                rec.prev_chain = None;
                rec.next_chain = old_head;
                rec.prev_conn = None;
                rec.next_conn = None;
                rec.chain_accessed_ctr = 0;
                self.set_list_head(ix, Some(id));
            }
        }

        let rec = self.rec_mut(id);
        rec.conn_list = Some(ix);
        rec.conn_accessed_ctr = 0;
        klog!(Trace, "{} linked on {:?} port {}", id, ix, u16::from_be_bytes(port));
        Ok(())
    }

    /// Remove a record from its list.  No-op if it is not linked.
    pub fn list_unlink(&mut self, id: ConnId, cursor: Option<&mut ListCursor>) {
        let (ix, prev_conn, next_conn, next_chain) = {
            let rec = self.rec(id);
            let Some(ix) = rec.conn_list else {
                return;
            };
            (ix, rec.prev_conn, rec.next_conn, rec.next_chain)
        };

        if let Some(cursor) = cursor {
            cursor.skip(id, next_conn, next_chain, prev_conn.is_none());
        }

        match prev_conn {
            Some(p) => {
                self.rec_mut(p).next_conn = next_conn;
                if let Some(n) = next_conn {
                    self.rec_mut(n).prev_conn = Some(p);
                }
            }
            None => match next_conn {
                Some(n) => {
                    self.replace_chain_head(id, n);
                    self.rec_mut(n).prev_conn = None;
                }
                None => {
                    let prev_chain = self.rec(id).prev_chain;
                    match prev_chain {
                        Some(p) => self.rec_mut(p).next_chain = next_chain,
                        None => self.set_list_head(ix, next_chain),
                    }
                    if let Some(n) = next_chain {
                        self.rec_mut(n).prev_chain = prev_chain;
                    }
                }
            },
        }

        let rec = self.rec_mut(id);
        rec.conn_list = None;
        rec.prev_chain = None;
        rec.next_chain = None;
        rec.prev_conn = None;
        rec.next_conn = None;
        rec.chain_accessed_ctr = 0;
        rec.conn_accessed_ctr = 0;
    }

    // ========================================================================
    // Promotion
    // ========================================================================

    fn chain_promote(&mut self, head: ConnId) {
        let (ix, prev_chain, next_chain) = {
            let rec = self.rec(head);
            let Some(ix) = rec.conn_list else {
                return;
            };
            (ix, rec.prev_chain, rec.next_chain)
        };
        let Some(p) = prev_chain else {
            return;
        };

        self.rec_mut(p).next_chain = next_chain;
        if let Some(n) = next_chain {
            self.rec_mut(n).prev_chain = Some(p);
        }

        let old_head = self.list_head(ix);
        if let Some(h) = old_head {
            self.rec_mut(h).prev_chain = Some(head);
        }
        let rec = self.rec_mut(head);
        rec.prev_chain = None;
        rec.next_chain = old_head;
        self.set_list_head(ix, Some(head));
        self.stats.chain_promotions.fetch_add(1, Ordering::Relaxed);
        klog!(Trace, "{} chain promoted on {:?}", head, ix);
    }

    fn chain_head_of(&self, id: ConnId) -> ConnId {
        let mut cur = id;
        while let Some(p) = self.rec(cur).prev_conn {
            cur = p;
        }
        cur
    }

    fn conn_promote(&mut self, id: ConnId) {
        let (prev_conn, next_conn) = {
            let rec = self.rec(id);
            (rec.prev_conn, rec.next_conn)
        };
        let Some(p) = prev_conn else {
            return;
        };
        let head = self.chain_head_of(p);

        self.rec_mut(p).next_conn = next_conn;
        if let Some(n) = next_conn {
            self.rec_mut(n).prev_conn = Some(p);
        }

        self.replace_chain_head(head, id);
        self.rec_mut(head).prev_conn = Some(id);
        let rec = self.rec_mut(id);
        rec.prev_conn = None;
        rec.next_conn = Some(head);
        self.stats.conn_promotions.fetch_add(1, Ordering::Relaxed);
        klog!(Trace, "{} promoted to chain head", id);
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Like `chain_for_port`, but unlinks every stale chain head passed on
    /// the way.  A stale head's sibling takes over its place and is
    /// examined next.
    fn srch_chain(&mut self, ix: ConnProtoIx, port: [u8; 2], stale: &mut Vec<ConnId>) -> Option<ConnId> {
        let mut chain = self.list_head(ix);
        while let Some(head) = chain {
            let rec = self.rec(head);
            if !rec.addr_local_valid {
                chain = rec.next_conn.or(rec.next_chain);
                self.unlink_stale(head, stale);
                continue;
            }
            if rec.addr_local.port_bytes() == port {
                return Some(head);
            }
            chain = rec.next_chain;
        }
        None
    }

    fn unlink_stale(&mut self, id: ConnId, stale: &mut Vec<ConnId>) {
        self.list_unlink(id, None);
        self.stats.stale_unlinked.fetch_add(1, Ordering::Relaxed);
        klog!(Debug, "{} stale, unlinked during search", id);
        stale.push(id);
    }

    /// Find the connection that should receive a datagram addressed to
    /// `local` from `remote`.
    ///
    /// An exact match ends the search immediately.  Otherwise the best
    /// wildcard or half match in the port's chain is returned.  Records
    /// with an invalidated local address are unlinked on the way and
    /// listed in [`SrchResult::stale`].
    pub fn srch(&mut self, ix: ConnProtoIx, local: &ConnAddr, remote: &ConnAddr) -> SrchResult {
        let mut result = SrchResult::default();
        let th = self.accessed_th.load(Ordering::Relaxed);
        let wildcard = local.wildcard();

        let Some(head) = self.srch_chain(ix, local.port_bytes(), &mut result.stale) else {
            self.stats.srch_misses.fetch_add(1, Ordering::Relaxed);
            return result;
        };

        let ctr = {
            let rec = self.rec_mut(head);
            rec.chain_accessed_ctr = rec.chain_accessed_ctr.saturating_add(1);
            rec.chain_accessed_ctr
        };
        if ctr > th {
            self.rec_mut(head).chain_accessed_ctr = 0;
            self.chain_promote(head);
        }

        let mut best: Option<(ConnId, ConnMatch)> = None;
        let mut cur = Some(head);
        while let Some(id) = cur {
            let rec = self.rec(id);
            cur = rec.next_conn;

            if !rec.addr_local_valid {
                self.unlink_stale(id, &mut result.stale);
                continue;
            }

            let kind = if rec.addr_remote_valid {
                if rec.addr_remote != *remote {
                    continue;
                }
                if rec.addr_local == *local {
                    ConnMatch::Full
                } else if rec.addr_local == wildcard {
                    ConnMatch::FullWildcard
                } else {
                    continue;
                }
            } else if rec.addr_local == *local {
                ConnMatch::Half
            } else if rec.addr_local == wildcard {
                ConnMatch::HalfWildcard
            } else {
                continue;
            };

            if best.map_or(true, |(_, b)| kind < b) {
                best = Some((id, kind));
            }
            if kind == ConnMatch::Full {
                break;
            }
        }

        match best {
            Some((id, _)) => {
                self.stats.srch_hits.fetch_add(1, Ordering::Relaxed);
                let ctr = {
                    let rec = self.rec_mut(id);
                    rec.conn_accessed_ctr = rec.conn_accessed_ctr.saturating_add(1);
                    rec.conn_accessed_ctr
                };
                if ctr > th {
                    self.rec_mut(id).conn_accessed_ctr = 0;
                    self.conn_promote(id);
                }
            }
            None => {
                self.stats.srch_misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        result.found = best;
        result
    }

    /// Records of list `ix` in traversal order (chains front to back, each
    /// chain head first).
    pub fn list_ids(&self, ix: ConnProtoIx) -> Vec<ConnId> {
        let mut out = Vec::new();
        let mut chain = self.list_head(ix);
        while let Some(head) = chain {
            let mut cur = Some(head);
            while let Some(id) = cur {
                out.push(id);
                cur = self.rec(id).next_conn;
            }
            chain = self.rec(head).next_chain;
        }
        out
    }

    /// Chain heads of list `ix`, front to back.
    pub fn chain_heads(&self, ix: ConnProtoIx) -> Vec<ConnId> {
        let mut out = Vec::new();
        let mut chain = self.list_head(ix);
        while let Some(head) = chain {
            out.push(head);
            chain = self.rec(head).next_chain;
        }
        out
    }
}
