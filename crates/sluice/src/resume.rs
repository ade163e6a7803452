//! Resume position scan and event skipping
//!
//! On startup with a checkpointed transaction id, the pump cannot simply
//! continue from the server's current position: it must rewind to a binlog
//! whose beginning lies at or before the checkpoint, then discard events up
//! to and including the checkpointed transaction. [`find_start_position`]
//! performs the rewind scan; [`SkipGate`] drives the discard phase.

use tracing::info;

use crate::decoder::BinlogEvent;
use crate::error::{Error, Result};
use crate::gtid::{render_gtid_list, Gtid};
use crate::source::ReplicaSource;

/// Locate the starting GTID list for a resume at `target`.
///
/// Walks the upstream's binary logs in order, reading the GTID set valid at
/// the start of each. The scan stops at the first log that already contains
/// ids past the target; the previous log's start set is the position to
/// connect with. When even the first log is too new the result is the empty
/// list (replication starts at the oldest available log), and when no log
/// is newer the last log's start set wins.
pub async fn find_start_position(source: &dyn ReplicaSource, target: &Gtid) -> Result<String> {
    let logs = source.binary_logs().await?;
    let mut start = Vec::new();

    for log in &logs {
        let gtids = source.gtid_position(log).await?;
        if target.any_newer(&gtids) {
            break;
        }
        start = gtids;
    }

    Ok(render_gtid_list(&start))
}

/// Discards replayed events until the checkpointed transaction has fully
/// passed by.
///
/// While engaged, no event reaches the dispatcher. Seeing the target GTID
/// switches to skipping that one transaction: to its XID for an ordinary
/// transaction, or just the single following statement for an
/// implicit-commit one. Seeing a GTID past the target means the upstream no
/// longer has the checkpointed transaction and a safe resume is impossible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipGate {
    Open,
    All(Gtid),
    NextTrx(Gtid),
    NextStmt(Gtid),
}

impl SkipGate {
    pub fn new() -> Self {
        SkipGate::Open
    }

    /// Start discarding events until `target` has passed.
    pub fn engage(&mut self, target: Gtid) {
        *self = SkipGate::All(target);
    }

    pub fn is_skipping(&self) -> bool {
        !matches!(self, SkipGate::Open)
    }

    /// Observe one event. `Ok(true)` admits the event to the dispatcher;
    /// `Ok(false)` discards it. The error is the unrecoverable
    /// past-the-checkpoint condition.
    pub fn admit(&mut self, event: &BinlogEvent) -> Result<bool> {
        match *self {
            SkipGate::Open => Ok(true),

            SkipGate::All(target) => {
                if let BinlogEvent::Gtid(gtid_event) = event {
                    if gtid_event.gtid == target {
                        info!("Reached GTID '{}', skipping next transaction", target);
                        *self = if gtid_event.is_standalone() {
                            SkipGate::NextStmt(target)
                        } else {
                            SkipGate::NextTrx(target)
                        };
                    } else if target.any_newer([&gtid_event.gtid]) {
                        return Err(Error::ResumeImpossible {
                            observed: gtid_event.gtid.to_string(),
                            target: target.to_string(),
                        });
                    }
                }
                Ok(false)
            }

            SkipGate::NextStmt(target) => {
                info!(
                    "Transaction for GTID '{}' skipped, ready to process events",
                    target
                );
                *self = SkipGate::Open;
                Ok(false)
            }

            SkipGate::NextTrx(target) => {
                if matches!(event, BinlogEvent::Xid(_)) {
                    info!(
                        "Transaction for GTID '{}' skipped, ready to process events",
                        target
                    );
                    *self = SkipGate::Open;
                }
                Ok(false)
            }
        }
    }
}

impl Default for SkipGate {
    fn default() -> Self {
        Self::new()
    }
}
