//! Destination-side chunk reassembly.
//!
//! A session is opened per platform by `BeginImport` (expected chunk count
//! and payload digest) before any chunk is accepted; chunks that arrive
//! without a session are rejected. Sessions that stop receiving chunks for
//! longer than the configured timeout expire, and late chunks for them are
//! answered with [`ReassemblyError::ChunkTimeout`] so the sender knows to
//! resend the whole set. That marker is itself dropped one timeout later.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::Chunk;
use crate::fixed::Ticks;
use crate::id::{TransferId, digest};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("reassembly session for '{0}' timed out")]
    ChunkTimeout(String),
    #[error("no reassembly session for '{0}'")]
    NoSession(String),
    #[error("chunk claims {found} total chunks, session expects {expected}")]
    TotalMismatch { expected: u32, found: u32 },
    #[error("chunk index {index} out of range for {total} chunks")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("payload digest mismatch: expected {expected:016x}, got {found:016x}")]
    DigestMismatch { expected: u64, found: u64 },
    #[error("only {received} of {total} chunks received")]
    Incomplete { received: u32, total: u32 },
}

#[derive(Debug, Clone)]
struct Session {
    transfer_id: TransferId,
    total: u32,
    digest: u64,
    received: BTreeMap<u32, Vec<u8>>,
    opened_at: Ticks,
    last_activity: Ticks,
}

/// Status line for one open session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub platform: String,
    pub transfer_id: TransferId,
    pub received: u32,
    pub total: u32,
    pub opened_at: Ticks,
}

#[derive(Debug)]
pub struct ReassemblyTable {
    timeout: Ticks,
    sessions: BTreeMap<String, Session>,
    /// Expired sessions: transfer and expiry tick.
    expired: BTreeMap<String, (TransferId, Ticks)>,
}

impl ReassemblyTable {
    pub fn new(timeout: Ticks) -> Self {
        Self {
            timeout,
            sessions: BTreeMap::new(),
            expired: BTreeMap::new(),
        }
    }

    pub fn set_timeout(&mut self, timeout: Ticks) {
        self.timeout = timeout;
    }

    /// Open (or restart) the session for `platform`.
    pub fn begin(
        &mut self,
        platform: &str,
        transfer_id: TransferId,
        total: u32,
        digest: u64,
        now: Ticks,
    ) {
        self.expired.remove(platform);
        let replaced = self
            .sessions
            .insert(
                platform.to_string(),
                Session {
                    transfer_id,
                    total: total.max(1),
                    digest,
                    received: BTreeMap::new(),
                    opened_at: now,
                    last_activity: now,
                },
            )
            .is_some();
        tracing::info!(platform, transfer = %transfer_id, total, replaced, "chunk_session_begin");
    }

    /// Store one chunk. Re-sending a chunk already held is harmless.
    /// Returns `(received, total)`.
    pub fn accept(
        &mut self,
        platform: &str,
        chunk: Chunk,
        now: Ticks,
    ) -> Result<(u32, u32), ReassemblyError> {
        self.expire_one(platform, now);
        let Some(session) = self.sessions.get_mut(platform) else {
            return Err(if self.expired.contains_key(platform) {
                ReassemblyError::ChunkTimeout(platform.to_string())
            } else {
                ReassemblyError::NoSession(platform.to_string())
            });
        };
        if chunk.total != session.total {
            return Err(ReassemblyError::TotalMismatch {
                expected: session.total,
                found: chunk.total,
            });
        }
        if chunk.index >= session.total {
            return Err(ReassemblyError::IndexOutOfRange {
                index: chunk.index,
                total: session.total,
            });
        }
        session.received.insert(chunk.index, chunk.payload);
        session.last_activity = now;
        Ok((session.received.len() as u32, session.total))
    }

    pub fn is_complete(&self, platform: &str) -> bool {
        self.sessions
            .get(platform)
            .is_some_and(|s| s.received.len() as u32 == s.total)
    }

    /// Close a complete session and return its verified payload.
    pub fn take_complete(
        &mut self,
        platform: &str,
    ) -> Result<(TransferId, Vec<u8>), ReassemblyError> {
        let session = self
            .sessions
            .get(platform)
            .ok_or_else(|| ReassemblyError::NoSession(platform.to_string()))?;
        let received = session.received.len() as u32;
        if received != session.total {
            return Err(ReassemblyError::Incomplete {
                received,
                total: session.total,
            });
        }
        let Some(session) = self.sessions.remove(platform) else {
            return Err(ReassemblyError::NoSession(platform.to_string()));
        };
        let bytes: Vec<u8> = session.received.into_values().flatten().collect();
        let found = digest(&bytes);
        if found != session.digest {
            tracing::warn!(platform, "chunk_session_digest_mismatch");
            return Err(ReassemblyError::DigestMismatch {
                expected: session.digest,
                found,
            });
        }
        tracing::info!(platform, bytes = bytes.len(), "chunk_session_complete");
        Ok((session.transfer_id, bytes))
    }

    fn expire_one(&mut self, platform: &str, now: Ticks) {
        let stale = self
            .sessions
            .get(platform)
            .is_some_and(|s| now.saturating_sub(s.last_activity) > self.timeout);
        if stale {
            if let Some(session) = self.sessions.remove(platform) {
                tracing::warn!(platform, transfer = %session.transfer_id, "chunk_session_expired");
                self.expired.insert(platform.to_string(), (session.transfer_id, now));
            }
        }
    }

    /// Expire every session idle for longer than the timeout and forget
    /// expiries older than another timeout. Returns the platforms that
    /// expired on this call.
    pub fn expire(&mut self, now: Ticks) -> Vec<(String, TransferId)> {
        let timeout = self.timeout;
        self.expired
            .retain(|_, entry| now.saturating_sub(entry.1) <= timeout);
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.saturating_sub(s.last_activity) > timeout)
            .map(|(name, _)| name.clone())
            .collect();
        let mut out = Vec::new();
        for name in stale {
            self.expire_one(&name, now);
            if let Some(&(id, _)) = self.expired.get(&name) {
                out.push((name, id));
            }
        }
        out
    }

    /// Number of expired sessions still answered with a timeout.
    pub fn expired_len(&self) -> usize {
        self.expired.len()
    }

    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.sessions
            .iter()
            .map(|(name, s)| SessionSummary {
                platform: name.clone(),
                transfer_id: s.transfer_id,
                received: s.received.len() as u32,
                total: s.total,
                opened_at: s.opened_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::chunk;

    fn payload() -> Vec<u8> {
        (0..500u32).map(|i| (i * 7 % 256) as u8).collect()
    }

    // -----------------------------------------------------------------------
    // Test 1: out-of-order chunks reassemble and verify
    // -----------------------------------------------------------------------
    #[test]
    fn out_of_order_reassembly() {
        let bytes = payload();
        let chunks = chunk(&bytes, 100);
        let mut table = ReassemblyTable::new(100);
        table.begin("alpha", TransferId(1), chunks.len() as u32, digest(&bytes), 0);
        for c in chunks.into_iter().rev() {
            table.accept("alpha", c, 1).unwrap();
        }
        assert!(table.is_complete("alpha"));
        let (id, out) = table.take_complete("alpha").unwrap();
        assert_eq!(id, TransferId(1));
        assert_eq!(out, bytes);
        assert!(table.sessions().is_empty());
    }

    // -----------------------------------------------------------------------
    // Test 2: chunks before a session are rejected
    // -----------------------------------------------------------------------
    #[test]
    fn chunk_without_session_rejected() {
        let mut table = ReassemblyTable::new(100);
        let c = chunk(&payload(), 100).remove(0);
        assert_eq!(
            table.accept("alpha", c, 0),
            Err(ReassemblyError::NoSession("alpha".into()))
        );
    }

    // -----------------------------------------------------------------------
    // Test 3: idle sessions expire and report ChunkTimeout
    // -----------------------------------------------------------------------
    #[test]
    fn idle_session_times_out() {
        let bytes = payload();
        let mut chunks = chunk(&bytes, 100);
        let mut table = ReassemblyTable::new(10);
        table.begin("alpha", TransferId(3), chunks.len() as u32, digest(&bytes), 0);
        table.accept("alpha", chunks.remove(0), 5).unwrap();

        let expired = table.expire(20);
        assert_eq!(expired, vec![("alpha".to_string(), TransferId(3))]);
        assert_eq!(
            table.accept("alpha", chunks.remove(0), 21),
            Err(ReassemblyError::ChunkTimeout("alpha".into()))
        );

        // A fresh session clears the timeout.
        table.begin("alpha", TransferId(3), 5, digest(&bytes), 30);
        assert!(table.accept("alpha", chunks.remove(0), 31).is_ok());
        assert_eq!(table.expired_len(), 0);
    }

    // -----------------------------------------------------------------------
    // Test 4: timeout markers are forgotten one timeout after expiry
    // -----------------------------------------------------------------------
    #[test]
    fn timeout_markers_are_pruned() {
        let bytes = payload();
        let mut chunks = chunk(&bytes, 100);
        let mut table = ReassemblyTable::new(10);
        for (i, name) in ["alpha", "beta", "gamma"].into_iter().enumerate() {
            table.begin(name, TransferId(i as u64), 5, digest(&bytes), 0);
        }
        assert_eq!(table.expire(11).len(), 3);
        assert_eq!(table.expired_len(), 3);

        // Still inside the marker window.
        assert!(table.expire(21).is_empty());
        assert_eq!(table.expired_len(), 3);

        assert!(table.expire(22).is_empty());
        assert_eq!(table.expired_len(), 0);
        assert_eq!(
            table.accept("alpha", chunks.remove(0), 23),
            Err(ReassemblyError::NoSession("alpha".into()))
        );
    }

    // -----------------------------------------------------------------------
    // Test 5: a late chunk on a stale session times out without expire()
    // -----------------------------------------------------------------------
    #[test]
    fn late_chunk_expires_session() {
        let bytes = payload();
        let mut chunks = chunk(&bytes, 100);
        let mut table = ReassemblyTable::new(10);
        table.begin("alpha", TransferId(1), 5, digest(&bytes), 0);
        assert_eq!(
            table.accept("alpha", chunks.remove(0), 50),
            Err(ReassemblyError::ChunkTimeout("alpha".into()))
        );
    }

    // -----------------------------------------------------------------------
    // Test 6: validation of totals, indices, digest, completeness
    // -----------------------------------------------------------------------
    #[test]
    fn malformed_chunks_rejected() {
        let bytes = payload();
        let chunks = chunk(&bytes, 100);
        let mut table = ReassemblyTable::new(100);
        table.begin("alpha", TransferId(1), 5, digest(&bytes) ^ 1, 0);

        let mut wrong_total = chunks[0].clone();
        wrong_total.total = 9;
        assert!(matches!(
            table.accept("alpha", wrong_total, 1),
            Err(ReassemblyError::TotalMismatch { .. })
        ));
        let mut wrong_index = chunks[0].clone();
        wrong_index.index = 7;
        assert!(matches!(
            table.accept("alpha", wrong_index, 1),
            Err(ReassemblyError::IndexOutOfRange { .. })
        ));

        table.accept("alpha", chunks[0].clone(), 1).unwrap();
        assert_eq!(
            table.take_complete("alpha"),
            Err(ReassemblyError::Incomplete { received: 1, total: 5 })
        );
        for c in chunks.iter().cloned() {
            table.accept("alpha", c, 2).unwrap();
        }
        assert!(matches!(
            table.take_complete("alpha"),
            Err(ReassemblyError::DigestMismatch { .. })
        ));
    }

    // -----------------------------------------------------------------------
    // Test 7: duplicate chunks are idempotent
    // -----------------------------------------------------------------------
    #[test]
    fn duplicates_are_idempotent() {
        let bytes = payload();
        let chunks = chunk(&bytes, 100);
        let mut table = ReassemblyTable::new(100);
        table.begin("alpha", TransferId(1), 5, digest(&bytes), 0);
        assert_eq!(table.accept("alpha", chunks[0].clone(), 1).unwrap(), (1, 5));
        assert_eq!(table.accept("alpha", chunks[0].clone(), 1).unwrap(), (1, 5));
    }
}
