use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::engine::{Engine, Reclaim};
use crate::model::{Action, Ms};
use crate::observability;
use crate::scheduler::Tick;

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Overdue holds found at the start of the sweep.
    pub examined: usize,
    /// Holds flipped to `expired`.
    pub reclaimed: usize,
    /// Of those, books that went back to `available`.
    pub released: usize,
    /// Holds that were issued or reclaimed by someone else first.
    pub skipped: usize,
    /// Reclaims that errored; retried on the next sweep.
    pub failed: usize,
}

/// Background task that reclaims holds past their deadline.
pub struct Sweeper {
    engine: Arc<Engine>,
}

impl Sweeper {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(self.engine.now_ms()).await
    }

    /// Expire every active hold with `expires_at <= now`. Each hold is
    /// reclaimed in its own atomic unit; one failure does not stop the rest.
    pub async fn sweep_at(&self, now: Ms) -> SweepReport {
        let start = Instant::now();
        let overdue = self.engine.ledger().overdue_holds(now);
        let mut report = SweepReport {
            examined: overdue.len(),
            ..SweepReport::default()
        };

        for (hold_id, book_id) in overdue {
            match self.engine.expire_hold(hold_id, now).await {
                Ok(Reclaim::Released) => {
                    report.reclaimed += 1;
                    report.released += 1;
                    info!(%hold_id, %book_id, "reclaimed expired hold");
                }
                Ok(Reclaim::ExpiredOnly) => {
                    report.reclaimed += 1;
                    info!(%hold_id, %book_id, "expired hold; book no longer on hold, status left as is");
                }
                Ok(Reclaim::Skipped) => {
                    report.skipped += 1;
                    debug!(%hold_id, "sweep skip: hold already processed");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(%hold_id, %book_id, "sweep failed, will retry next tick: {e}");
                }
            }
        }

        metrics::counter!(observability::HOLDS_EXPIRED_TOTAL).increment(report.reclaimed as u64);
        metrics::counter!(observability::SWEEP_FAILURES_TOTAL).increment(report.failed as u64);
        metrics::histogram!(observability::SWEEP_DURATION_SECONDS).record(start.elapsed().as_secs_f64());
        metrics::gauge!(observability::ACTIVE_HOLDS)
            .set(self.engine.ledger().active_with_action(Action::Hold).len() as f64);
        report
    }
}

#[async_trait]
impl Tick for Sweeper {
    fn name(&self) -> &'static str {
        "hold_expiry"
    }

    async fn tick(&self) {
        let report = self.sweep().await;
        info!(
            reclaimed = report.reclaimed,
            released = report.released,
            skipped = report.skipped,
            failed = report.failed,
            "released {} expired holds",
            report.released
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use tokio_test::assert_ok;

    use crate::clock::{Clock, ManualClock};
    use crate::engine::EngineSettings;
    use crate::model::*;
    use crate::scheduler::{IntervalScheduler, Scheduler};

    const T0: Ms = 1_700_000_000_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("openshelf_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn setup(name: &str) -> (Arc<Engine>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let engine = Arc::new(
            Engine::open(test_wal_path(name), EngineSettings::default(), clock.clone()).unwrap(),
        );
        for (roll, name) in [("R001", "Asha"), ("R002", "Bilal")] {
            engine
                .register_borrower(Borrower::new(roll, name, "CSE"))
                .await
                .unwrap();
        }
        (engine, clock)
    }

    async fn book(engine: &Engine, title: &str) -> ulid::Ulid {
        engine
            .add_book(BookDetails::new(title, "Anon"))
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn sweep_reclaims_only_overdue_holds() {
        let (engine, clock) = setup("reclaims.wal").await;
        let stale = book(&engine, "Stale").await;
        let fresh = book(&engine, "Fresh").await;

        let stale_hold = engine.place_hold(stale, "R001").await.unwrap();
        clock.advance(12 * HOUR_MS);
        engine.place_hold(fresh, "R002").await.unwrap();
        clock.advance(13 * HOUR_MS); // stale is 25h old, fresh 13h

        let report = Sweeper::new(engine.clone()).sweep().await;
        assert_eq!(report.examined, 1);
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.released, 1);
        assert_eq!(report.failed, 0);

        let entry = engine.ledger().get(&stale_hold.entry.id).unwrap();
        assert_eq!(entry.status, EntryStatus::Expired);
        assert_eq!(engine.get_book(stale).await.unwrap().status, BookStatus::Available);
        assert_eq!(engine.get_book(fresh).await.unwrap().status, BookStatus::OnHold);
        assert!(engine.verify_invariants().await.is_empty());
    }

    #[tokio::test]
    async fn second_sweep_is_a_noop() {
        let (engine, clock) = setup("noop.wal").await;
        let id = book(&engine, "Dune").await;
        engine.place_hold(id, "R001").await.unwrap();
        clock.advance(DEFAULT_HOLD_TTL_MS);

        let sweeper = Sweeper::new(engine.clone());
        assert_eq!(sweeper.sweep().await.reclaimed, 1);
        assert_eq!(sweeper.sweep().await, SweepReport::default());
    }

    #[tokio::test]
    async fn issued_hold_is_not_swept() {
        let (engine, clock) = setup("issued.wal").await;
        let id = book(&engine, "Dune").await;
        let receipt = engine.place_hold(id, "R001").await.unwrap();
        clock.advance(DEFAULT_HOLD_TTL_MS + 1);
        // Past deadline but not yet swept: issue still wins
        assert_ok!(engine.issue_book(receipt.entry.id).await);

        let report = Sweeper::new(engine.clone()).sweep().await;
        assert_eq!(report, SweepReport::default());
        assert_eq!(engine.get_book(id).await.unwrap().status, BookStatus::Borrowed);
        assert_eq!(
            engine.ledger().get(&receipt.entry.id).unwrap().status,
            EntryStatus::Completed
        );
    }

    #[tokio::test]
    async fn hold_swept_before_issue_cannot_be_issued() {
        let (engine, clock) = setup("swept_first.wal").await;
        let id = book(&engine, "Dune").await;
        let receipt = engine.place_hold(id, "R001").await.unwrap();
        clock.advance(DEFAULT_HOLD_TTL_MS);
        Sweeper::new(engine.clone()).sweep().await;

        let err = engine.issue_book(receipt.entry.id).await.unwrap_err();
        assert_eq!(err.category(), "not_found");
        assert_eq!(engine.get_book(id).await.unwrap().status, BookStatus::Available);
    }

    #[tokio::test]
    async fn expire_hold_skips_stale_candidates() {
        let (engine, clock) = setup("stale_candidate.wal").await;
        let id = book(&engine, "Dune").await;
        let receipt = engine.place_hold(id, "R001").await.unwrap();

        // Not overdue at the given instant
        let outcome = engine.expire_hold(receipt.entry.id, clock.now_ms()).await.unwrap();
        assert_eq!(outcome, Reclaim::Skipped);
        // Unknown id
        let outcome = engine.expire_hold(ulid::Ulid::new(), clock.now_ms()).await.unwrap();
        assert_eq!(outcome, Reclaim::Skipped);
        assert_eq!(engine.get_book(id).await.unwrap().status, BookStatus::OnHold);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_sweeper_reclaims_on_tick() {
        let (engine, clock) = setup("scheduled.wal").await;
        let id = book(&engine, "Dune").await;
        engine.place_hold(id, "R001").await.unwrap();
        clock.advance(DEFAULT_HOLD_TTL_MS);

        let scheduler = IntervalScheduler::new();
        let handle = scheduler.on_tick(Arc::new(Sweeper::new(engine.clone())), Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_secs(1)).await;
        scheduler.shutdown();
        handle.await.unwrap();

        assert_eq!(engine.get_book(id).await.unwrap().status, BookStatus::Available);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sweep_racing_desk_issues_settles_every_hold_once() {
        let (engine, clock) = setup("sweep_vs_issue.wal").await;
        let mut holds = Vec::new();
        for i in 0..50 {
            let id = book(&engine, &format!("Book {i:02}")).await;
            let receipt = engine.place_hold(id, "R001").await.unwrap();
            holds.push((id, receipt.entry.id));
        }
        clock.advance(engine.settings().hold_ttl_ms);

        let sweeper = Sweeper::new(engine.clone());
        let desk = {
            let engine = engine.clone();
            let holds = holds.clone();
            tokio::spawn(async move {
                let mut issued = 0;
                for (_, hold_id) in holds {
                    if engine.issue_book(hold_id).await.is_ok() {
                        issued += 1;
                    }
                }
                issued
            })
        };
        let report = sweeper.sweep().await;
        let issued = desk.await.unwrap();

        assert_eq!(report.failed, 0);
        assert_eq!(report.reclaimed + issued, 50);
        for (id, _) in holds {
            let status = engine.get_book(id).await.unwrap().status;
            assert!(matches!(status, BookStatus::Available | BookStatus::Borrowed));
        }
        assert!(engine.verify_invariants().await.is_empty());
    }
}
