use std::collections::{BTreeMap, HashMap, HashSet};

use crate::peer::PeerKey;
use crate::session::piece_manager::{BLOCK_MAX, BlockInfo, PieceStatus, block_count, block_len};
use crate::torrent::Metainfo;

#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockSlot {
    Open,
    /// requested from these peers; more than one only in endgame
    InFlight(Vec<PeerKey>),
    Received,
}

#[derive(Debug)]
struct PartialPiece {
    slots: Vec<BlockSlot>,
    received: usize,
    contributors: HashSet<PeerKey>,
}

impl PartialPiece {
    fn new(blocks: usize) -> Self {
        Self {
            slots: vec![BlockSlot::Open; blocks],
            received: 0,
            contributors: HashSet::new(),
        }
    }

    fn unreceived(&self) -> usize {
        self.slots.len() - self.received
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    /// First copy of the block. `cancel` lists the other peers it was requested from.
    Accepted {
        cancel: Vec<PeerKey>,
        piece_complete: bool,
    },
    /// The block is already there; the data is dropped.
    Duplicate,
    /// Nothing we asked for, or a block with the wrong shape.
    Unexpected,
}

/// Decides which blocks to request from which peer.
///
/// Pieces are picked rarest first with the lowest index breaking ties, started pieces are
/// finished before new ones are begun and blocks go out in increasing offset order.
#[derive(Debug)]
pub struct PieceSelector {
    piece_length: u32,
    total_length: u64,
    status: Vec<PieceStatus>,
    /// How many connected peers have each piece.
    availability: Vec<u32>,
    peers: HashMap<PeerKey, Vec<bool>>,
    partial: BTreeMap<u32, PartialPiece>,
    endgame_threshold: usize,
}

impl PieceSelector {
    pub fn new(info: &Metainfo, have: &[bool], endgame_threshold: usize) -> Self {
        let status = have
            .iter()
            .map(|&have| {
                if have {
                    PieceStatus::Verified
                } else {
                    PieceStatus::Missing
                }
            })
            .collect();
        Self {
            piece_length: info.piece_length,
            total_length: info.total_length(),
            status,
            availability: vec![0; have.len()],
            peers: HashMap::new(),
            partial: BTreeMap::new(),
            endgame_threshold,
        }
    }

    fn piece_size(&self, piece: u32) -> u32 {
        piece_size(self.piece_length, self.total_length, piece)
    }

    pub fn endgame_threshold(&self) -> usize {
        self.endgame_threshold
    }

    pub fn status(&self, piece: u32) -> PieceStatus {
        self.status[piece as usize]
    }

    pub fn availability(&self, piece: u32) -> u32 {
        self.availability[piece as usize]
    }

    pub fn add_peer(&mut self, key: PeerKey) {
        self.peers
            .entry(key)
            .or_insert_with(|| vec![false; self.status.len()]);
    }

    /// Merges a bitfield into what the peer is known to have. Pieces are never taken away.
    /// Returns whether the peer has something we need.
    pub fn peer_bitfield(&mut self, key: PeerKey, bitfield: &[bool]) -> bool {
        self.add_peer(key);
        if let Some(has) = self.peers.get_mut(&key) {
            for (piece, (has, &new)) in has.iter_mut().zip(bitfield).enumerate() {
                if new && !*has {
                    *has = true;
                    self.availability[piece] += 1;
                }
            }
        }
        self.is_interesting(key)
    }

    pub fn peer_have(&mut self, key: PeerKey, piece: u32) -> bool {
        self.add_peer(key);
        if let Some(has) = self.peers.get_mut(&key)
            && let Some(has) = has.get_mut(piece as usize)
            && !*has
        {
            *has = true;
            self.availability[piece as usize] += 1;
        }
        self.is_interesting(key)
    }

    /// Forgets the peer and gives its blocks back to the pool. Returns how many blocks were
    /// released.
    pub fn remove_peer(&mut self, key: PeerKey) -> usize {
        if let Some(has) = self.peers.remove(&key) {
            for (piece, _) in has.iter().enumerate().filter(|(_, has)| **has) {
                self.availability[piece] -= 1;
            }
        }
        self.release_peer(key)
    }

    /// Gives every block in flight from `key` back to the pool, as when it chokes us.
    pub fn release_peer(&mut self, key: PeerKey) -> usize {
        let mut released = 0;
        for partial in self.partial.values_mut() {
            for slot in &mut partial.slots {
                if let BlockSlot::InFlight(peers) = slot
                    && let Some(i) = peers.iter().position(|peer| *peer == key)
                {
                    peers.swap_remove(i);
                    released += 1;
                    if peers.is_empty() {
                        *slot = BlockSlot::Open;
                    }
                }
            }
        }
        released
    }

    /// Gives one block back, after a timeout or a reject.
    pub fn release(&mut self, key: PeerKey, block: BlockInfo) {
        let Some(partial) = self.partial.get_mut(&block.piece) else {
            return;
        };
        let slot = partial.slots.get_mut((block.offset / BLOCK_MAX) as usize);
        if let Some(slot) = slot
            && let BlockSlot::InFlight(peers) = slot
        {
            peers.retain(|peer| *peer != key);
            if peers.is_empty() {
                *slot = BlockSlot::Open;
            }
        }
    }

    pub fn is_interesting(&self, key: PeerKey) -> bool {
        self.peers.get(&key).is_some_and(|has| {
            has.iter()
                .zip(&self.status)
                .any(|(&has, status)| has && *status != PieceStatus::Verified)
        })
    }

    /// No piece is left untouched and few enough blocks are outstanding that asking
    /// several peers for them is cheaper than waiting for the slowest.
    pub fn in_endgame(&self) -> bool {
        if self.status.iter().any(|status| status.is_wanted()) {
            return false;
        }
        let unreceived: usize = self.partial.values().map(PartialPiece::unreceived).sum();
        unreceived > 0 && unreceived <= self.endgame_threshold
    }

    /// Picks up to `max` blocks to request from `key` and marks them in flight.
    pub fn next_requests(&mut self, key: PeerKey, max: usize) -> Vec<BlockInfo> {
        let mut picked = Vec::new();
        let Some(has) = self.peers.get(&key).cloned() else {
            return picked;
        };

        // started pieces first
        for (&piece, partial) in &mut self.partial {
            if picked.len() == max {
                break;
            }
            if !has[piece as usize] {
                continue;
            }
            let piece_size = piece_size(self.piece_length, self.total_length, piece);
            take_open(partial, key, piece, piece_size, max, &mut picked);
        }

        while picked.len() < max {
            let rarest = (0..self.status.len())
                .filter(|&piece| has[piece] && self.status[piece].is_wanted())
                .min_by_key(|&piece| (self.availability[piece], piece));
            let Some(piece) = rarest else {
                break;
            };
            let piece = piece as u32;
            let piece_size = self.piece_size(piece);
            let mut partial = PartialPiece::new(block_count(piece_size));
            take_open(&mut partial, key, piece, piece_size, max, &mut picked);
            self.status[piece as usize] = PieceStatus::Requested;
            self.partial.insert(piece, partial);
        }

        if picked.len() < max && self.in_endgame() {
            for (&piece, partial) in &mut self.partial {
                if !has[piece as usize] {
                    continue;
                }
                let piece_size = piece_size(self.piece_length, self.total_length, piece);
                for (block_i, slot) in partial.slots.iter_mut().enumerate() {
                    if picked.len() == max {
                        break;
                    }
                    if let BlockSlot::InFlight(peers) = slot
                        && !peers.contains(&key)
                    {
                        peers.push(key);
                        picked.push(block_at(piece, piece_size, block_i));
                    }
                }
            }
        }
        picked
    }

    /// Records a block `key` delivered.
    pub fn block_received(&mut self, key: PeerKey, block: BlockInfo) -> BlockOutcome {
        let piece_size = match self.status.get(block.piece as usize) {
            Some(PieceStatus::Verified) => return BlockOutcome::Duplicate,
            Some(_) => self.piece_size(block.piece),
            None => return BlockOutcome::Unexpected,
        };
        let Some(partial) = self.partial.get_mut(&block.piece) else {
            return BlockOutcome::Unexpected;
        };
        if block.offset % BLOCK_MAX != 0 || block.offset >= piece_size {
            return BlockOutcome::Unexpected;
        }
        if block.length != block_len(piece_size, block.offset) {
            return BlockOutcome::Unexpected;
        }
        let slot = &mut partial.slots[(block.offset / BLOCK_MAX) as usize];
        let cancel = match std::mem::replace(slot, BlockSlot::Received) {
            BlockSlot::Received => return BlockOutcome::Duplicate,
            BlockSlot::InFlight(peers) => peers.into_iter().filter(|peer| *peer != key).collect(),
            // released after a timeout but delivered anyway
            BlockSlot::Open => Vec::new(),
        };
        partial.received += 1;
        partial.contributors.insert(key);
        self.status[block.piece as usize] = PieceStatus::Downloading;
        BlockOutcome::Accepted {
            cancel,
            piece_complete: partial.received == partial.slots.len(),
        }
    }

    /// The piece passed its hash check. Returns the peers that delivered it.
    pub fn piece_verified(&mut self, piece: u32) -> Vec<PeerKey> {
        self.status[piece as usize] = PieceStatus::Verified;
        self.partial
            .remove(&piece)
            .map(|partial| partial.contributors.into_iter().collect())
            .unwrap_or_default()
    }

    /// The piece failed its hash check: every block is thrown away and the piece is
    /// wanted again. Returns the peers that delivered it.
    pub fn piece_failed(&mut self, piece: u32) -> Vec<PeerKey> {
        self.status[piece as usize] = PieceStatus::Failed;
        self.partial
            .remove(&piece)
            .map(|partial| partial.contributors.into_iter().collect())
            .unwrap_or_default()
    }
}

fn piece_size(piece_length: u32, total_length: u64, piece: u32) -> u32 {
    let start = piece as u64 * piece_length as u64;
    (total_length - start).min(piece_length as u64) as u32
}

fn block_at(piece: u32, piece_size: u32, block_i: usize) -> BlockInfo {
    let offset = block_i as u32 * BLOCK_MAX;
    BlockInfo {
        piece,
        offset,
        length: block_len(piece_size, offset),
    }
}

fn take_open(
    partial: &mut PartialPiece,
    key: PeerKey,
    piece: u32,
    piece_size: u32,
    max: usize,
    picked: &mut Vec<BlockInfo>,
) {
    for (block_i, slot) in partial.slots.iter_mut().enumerate() {
        if picked.len() == max {
            break;
        }
        if *slot == BlockSlot::Open {
            *slot = BlockSlot::InFlight(vec![key]);
            picked.push(block_at(piece, piece_size, block_i));
        }
    }
}

#[cfg(test)]
mod test_piece_selector {
    use super::*;
    use crate::torrent::{Hashes, Key};

    const A: PeerKey = PeerKey(1);
    const B: PeerKey = PeerKey(2);
    const C: PeerKey = PeerKey(3);

    /// `pieces` pieces of two blocks each.
    fn selector(pieces: usize, endgame_threshold: usize) -> PieceSelector {
        let info = Metainfo {
            name: "a".to_string(),
            piece_length: 2 * BLOCK_MAX,
            pieces: Hashes(vec![[0; 20]; pieces]),
            files: Key::SingleFile {
                length: pieces as u64 * 2 * BLOCK_MAX as u64,
            },
        };
        PieceSelector::new(&info, &vec![false; pieces], endgame_threshold)
    }

    fn block(piece: u32, block_i: u32) -> BlockInfo {
        BlockInfo {
            piece,
            offset: block_i * BLOCK_MAX,
            length: BLOCK_MAX,
        }
    }

    #[test]
    fn rarest_piece_first_lowest_index_on_ties() {
        let mut selector = selector(4, 0);
        selector.peer_bitfield(A, &[true, true, true, true]);
        selector.peer_bitfield(B, &[true, true, false, false]);
        selector.peer_bitfield(C, &[true, false, false, true]);
        // availability: 3, 2, 1, 2

        let picked = selector.next_requests(A, 2);
        assert_eq!(picked, vec![block(2, 0), block(2, 1)]);
        assert_eq!(selector.status(2), PieceStatus::Requested);

        let picked = selector.next_requests(A, 4);
        assert_eq!(
            picked,
            vec![block(1, 0), block(1, 1), block(3, 0), block(3, 1)]
        );
    }

    #[test]
    fn started_pieces_are_continued_first() {
        let mut selector = selector(3, 0);
        selector.peer_bitfield(A, &[true, true, true]);
        selector.peer_bitfield(B, &[false, true, true]);

        // A starts piece 0 but only gets one block
        assert_eq!(selector.next_requests(A, 1), vec![block(0, 0)]);
        // B can't help with piece 0, and pieces 1 and 2 are equally rare
        assert_eq!(selector.next_requests(B, 1), vec![block(1, 0)]);
        // A finishes what was started before touching piece 2
        assert_eq!(
            selector.next_requests(A, 3),
            vec![block(0, 1), block(1, 1), block(2, 0)]
        );
    }

    #[test]
    fn disconnect_returns_requests_to_the_pool() {
        let mut selector = selector(2, 0);
        selector.peer_bitfield(A, &[true, true]);
        selector.peer_bitfield(B, &[true, true]);

        assert_eq!(selector.next_requests(A, 3).len(), 3);
        assert_eq!(selector.remove_peer(A), 3);
        assert_eq!(selector.availability(0), 1);

        assert_eq!(
            selector.next_requests(B, 4),
            vec![block(0, 0), block(0, 1), block(1, 0), block(1, 1)]
        );
    }

    #[test]
    fn endgame_requests_duplicates_and_first_arrival_wins() {
        let mut selector = selector(1, 4);
        selector.peer_bitfield(A, &[true]);
        selector.peer_bitfield(B, &[true]);

        assert_eq!(selector.next_requests(A, 2).len(), 2);
        assert!(selector.in_endgame());
        assert_eq!(selector.next_requests(B, 2), vec![block(0, 0), block(0, 1)]);

        assert_eq!(
            selector.block_received(B, block(0, 0)),
            BlockOutcome::Accepted {
                cancel: vec![A],
                piece_complete: false
            }
        );
        assert_eq!(
            selector.block_received(A, block(0, 0)),
            BlockOutcome::Duplicate
        );
        assert_eq!(
            selector.block_received(A, block(0, 1)),
            BlockOutcome::Accepted {
                cancel: vec![B],
                piece_complete: true
            }
        );

        let mut contributors = selector.piece_verified(0);
        contributors.sort();
        assert_eq!(contributors, vec![A, B]);
        assert_eq!(
            selector.block_received(B, block(0, 1)),
            BlockOutcome::Duplicate
        );
    }

    #[test]
    fn no_endgame_while_pieces_are_untouched() {
        let mut selector = selector(2, 100);
        selector.peer_bitfield(A, &[true, true]);
        selector.next_requests(A, 2);
        assert!(!selector.in_endgame());
        assert!(selector.next_requests(B, 2).is_empty());
    }

    #[test]
    fn failed_piece_is_requested_again_from_scratch() {
        let mut selector = selector(1, 0);
        selector.peer_bitfield(A, &[true]);
        for block in selector.next_requests(A, 2) {
            selector.block_received(A, block);
        }
        assert_eq!(selector.status(0), PieceStatus::Downloading);
        assert_eq!(selector.piece_failed(0), vec![A]);
        assert_eq!(selector.status(0), PieceStatus::Failed);
        assert!(!selector.in_endgame());
        // no partial credit
        assert_eq!(selector.next_requests(A, 2), vec![block(0, 0), block(0, 1)]);
        assert_eq!(selector.status(0), PieceStatus::Requested);
    }

    #[test]
    fn unexpected_blocks_are_rejected() {
        let mut selector = selector(1, 0);
        selector.peer_bitfield(A, &[true]);
        assert_eq!(
            selector.block_received(A, block(0, 0)),
            BlockOutcome::Unexpected
        );
        selector.next_requests(A, 1);
        let misaligned = BlockInfo {
            piece: 0,
            offset: 1,
            length: BLOCK_MAX,
        };
        assert_eq!(
            selector.block_received(A, misaligned),
            BlockOutcome::Unexpected
        );
    }

    #[test]
    fn bitfields_only_grow() {
        let mut selector = selector(2, 0);
        assert!(selector.peer_bitfield(A, &[true, false]));
        selector.peer_bitfield(A, &[false, true]);
        assert_eq!(selector.availability(0), 1);
        assert_eq!(selector.availability(1), 1);
        selector.peer_have(A, 1);
        assert_eq!(selector.availability(1), 1);
    }
}
