//  _____       ______   ____
// |_   _|     |  ____|/ ____|  Institute of Embedded Systems
//   | |  _ __ | |__  | (___    Zurich University of Applied Sciences
//   | | | '_ \|  __|  \___ \   8401 Winterthur, Switzerland
//  _| |_| | | | |____ ____) |
// |_____|_| |_|______|_____/
//
// Copyright 2025 Institute of Embedded Systems at Zurich University of Applied Sciences.
// All rights reserved.
// SPDX-License-Identifier: MIT

use cricket_wire::Observation;

/// Bounded ring of timestamped Observations with write cursor `W` and read
/// cursor `R`.
///
/// `W`/`R` are kept as monotonically increasing counters rather than
/// indices mod `N`; the ring position is only taken at the point of array
/// access. This makes `commit`'s "advance `R` conservatively" rule
/// (`R := max(R, token)`) and `peek`'s windowing trivial comparisons
/// instead of modular-arithmetic bookkeeping.
pub struct ObservationStore<const N: usize> {
    buf: [Option<Observation>; N],
    write: usize,
    read: usize,
}

impl<const N: usize> Default for ObservationStore<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ObservationStore<N> {
    pub fn new() -> Self {
        Self {
            buf: [None; N],
            write: 0,
            read: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Number of live entries.
    pub fn size(&self) -> usize {
        self.write - self.read
    }

    /// Write at `W`, advance `W`; on collision with `R` advance `R` too
    /// (newest-wins eviction).
    pub fn append(&mut self, obs: Observation) {
        self.buf[self.write % N] = Some(obs);
        self.write += 1;
        if self.write - self.read > N {
            self.read = self.write - N;
        }
    }

    /// Capture `W` as a commit token.
    pub fn snapshot(&self) -> usize {
        self.write
    }

    /// Copy up to `dst.len()` entries starting `offset` past `R`, without
    /// disturbing cursors. Never reads past `token` (the snapshot taken
    /// when the batch being peeked at began) or past the live write
    /// cursor. Returns the number of entries copied.
    pub fn peek(&self, token: usize, offset: usize, dst: &mut [Observation]) -> usize {
        let start = self.read + offset;
        let end = token.min(self.write);
        let mut copied = 0;
        let mut i = start;
        while i < end && copied < dst.len() {
            match self.buf[i % N] {
                Some(obs) => {
                    dst[copied] = obs;
                    copied += 1;
                }
                None => break,
            }
            i += 1;
        }
        copied
    }

    /// Advance `R` to `token`, conservatively: a stale token (taken before
    /// a newest-wins eviction moved `R` further already) never moves `R`
    /// backwards.
    pub fn commit(&mut self, token: usize) {
        self.read = self.read.max(token).min(self.write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cricket_wire::Kind;

    fn obs(time: u32) -> Observation {
        Observation {
            time,
            kind: Kind::Other,
            payload: 0,
        }
    }

    #[test]
    fn snapshot_append_commit_frees_only_the_pre_snapshot_entries() {
        let mut store: ObservationStore<8> = ObservationStore::new();
        store.append(obs(1));
        store.append(obs(2));
        let token = store.snapshot();
        store.append(obs(3));
        store.append(obs(4));
        assert_eq!(store.size(), 4);
        store.commit(token);
        assert_eq!(store.size(), 2);
    }

    #[test]
    fn a_full_ring_evicts_the_oldest_entry_on_append() {
        let mut store: ObservationStore<4> = ObservationStore::new();
        for t in 0..4 {
            store.append(obs(t));
        }
        assert_eq!(store.size(), 4);
        store.append(obs(99));
        assert_eq!(store.size(), 4);
        let mut out = [obs(0); 4];
        let n = store.peek(store.snapshot(), 0, &mut out);
        assert_eq!(n, 4);
        assert_eq!(out[0].time, 1);
        assert_eq!(out[3].time, 99);
    }

    #[test]
    fn peek_does_not_move_the_cursors() {
        let mut store: ObservationStore<8> = ObservationStore::new();
        store.append(obs(1));
        store.append(obs(2));
        let token = store.snapshot();
        let mut out = [obs(0); 2];
        store.peek(token, 0, &mut out);
        assert_eq!(store.size(), 2);
        assert_eq!(out[0].time, 1);
        assert_eq!(out[1].time, 2);
    }

    #[test]
    fn commit_with_a_stale_token_never_moves_read_backwards() {
        let mut store: ObservationStore<4> = ObservationStore::new();
        for t in 0..6 {
            store.append(obs(t));
        }
        // read has already been pushed forward by eviction past `stale`
        let stale = 1;
        store.commit(stale);
        assert_eq!(store.size(), 4);
    }
}
