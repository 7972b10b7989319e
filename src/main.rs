//! Sportsbook ledger simulation.
//!
//! Runs the wagering engine through scripted scenarios against the in-memory
//! backend: placement, settlement of every bet type, manual override,
//! reconciliation anomalies, concurrent placement and the supervised worker.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use wager_core::*;

type SimResult = Result<(), Box<dyn Error>>;

fn main() -> SimResult {
    init_tracing();

    println!("Sportsbook Ledger Simulation");
    println!("In-memory ledger, integer cents, fixed-point odds\n");

    scenario_1_single_win()?;
    scenario_2_combination_void_leg()?;
    scenario_3_system_lost_leg()?;
    scenario_4_forced_settlement()?;
    scenario_5_reconciliation_anomalies()?;
    scenario_6_concurrent_placement()?;
    scenario_7_supervised_worker()?;

    println!("\nAll simulations completed successfully.");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Engine plus handles on the fakes so scenarios can drive them.
struct Sim {
    engine: Arc<Engine>,
    results: Arc<InMemoryResultFeed>,
    markets: Arc<InMemoryMarketBoard>,
    audit: Arc<InMemoryAuditLog>,
    clock: Arc<ManualClock>,
}

impl Sim {
    fn new(config: WagerConfig) -> Result<Self, EngineError> {
        let results = Arc::new(InMemoryResultFeed::new());
        let markets = Arc::new(InMemoryMarketBoard::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_700_000_000_000)));
        let engine = Engine::new(
            config,
            Collaborators {
                ledger: Arc::new(InMemoryLedger::new()),
                results: results.clone(),
                markets: markets.clone(),
                audit: audit.clone(),
                clock: clock.clone(),
            },
        )?;
        Ok(Self {
            engine: Arc::new(engine),
            results,
            markets,
            audit,
            clock,
        })
    }

    fn balance(&self, account_id: AccountId) -> Result<Cents, EngineError> {
        Ok(self
            .engine
            .account(account_id)?
            .map(|a| a.balance)
            .unwrap_or(Cents::ZERO))
    }
}

fn leg(fixture: &str, market: &str, outcome: &str, odds: &str) -> Result<SelectionSpec, OddsError> {
    Ok(SelectionSpec::new(fixture, market, outcome, Odds::parse(odds)?))
}

fn final_result(fixture: &str, outcomes: &[(&str, &str, SelectionStatus)]) -> FixtureResult {
    FixtureResult::new(
        fixture,
        Finality::Final,
        outcomes
            .iter()
            .map(|(m, o, s)| OutcomeResult::new(*m, *o, *s))
            .collect(),
    )
}

/// Single bet, stake 20.00 at 2.50, wins.
fn scenario_1_single_win() -> SimResult {
    println!("Scenario 1: Single Bet Wins\n");

    let sim = Sim::new(WagerConfig::default())?;
    let alice = sim.engine.open_account(Cents::new(10_000))?;

    let placed = sim.engine.place_bet(PlacementRequest::singles(
        alice.id,
        Cents::new(2_000),
        vec![leg("ars-che", "1x2", "home", "2.50")?],
    ))?;
    let bet_id = placed.bets[0].id();
    println!("  Alice stakes 20.00 on Arsenal @ 2.50");
    println!("  Potential winnings: {}", placed.quotes[0].potential_winnings);
    println!("  Balance after stake: {}", placed.new_balance);

    let key = ExposureKey::new("ars-che", "1x2", "home");
    println!("  Liability on ars-che/1x2/home: {}\n", sim.engine.exposure(&key));

    sim.results.publish(final_result("ars-che", &[("1x2", "home", SelectionStatus::Won)]));
    let report = sim.engine.reconcile_fixture(&FixtureId::new("ars-che"))?;
    let settled = report.settlement.map(|s| s.settled_count()).unwrap_or(0);
    println!("  Result published, bets settled: {}", settled);

    let again = sim.engine.settle_bet(bet_id)?;
    println!("  Settling again is a no-op: {:?}", again);
    println!("  Final balance: {}", sim.balance(alice.id)?);
    println!("  Liability after settlement: {}\n", sim.engine.exposure(&key));
    Ok(())
}

/// Combination 2.00 x 1.80 with the second leg voided.
fn scenario_2_combination_void_leg() -> SimResult {
    println!("Scenario 2: Combination With a Void Leg\n");

    let sim = Sim::new(WagerConfig::default())?;
    let bob = sim.engine.open_account(Cents::new(10_000))?;

    let placed = sim.engine.place_bet(PlacementRequest::combination(
        bob.id,
        Cents::new(1_500),
        vec![leg("liv-mci", "1x2", "home", "2.00")?, leg("tot-new", "1x2", "away", "1.80")?],
    ))?;
    let bet = &placed.bets[0].bet;
    println!("  Bob stakes 15.00 on a double, total odds {}", bet.total_odds);
    println!("  Potential winnings: {}", bet.potential_winnings);

    sim.engine
        .apply_fixture_result(&final_result("liv-mci", &[("1x2", "home", SelectionStatus::Won)]))?;
    let summary = sim
        .engine
        .apply_fixture_result(&final_result("tot-new", &[("1x2", "away", SelectionStatus::Void)]))?;

    for report in &summary.settled {
        if let SettleReport::Settled { status, actual_winnings, .. } = report {
            println!("  Settled {} paying {} (void leg counted at 1.00)", status, actual_winnings);
        }
    }
    println!("  Final balance: {}\n", sim.balance(bob.id)?);
    Ok(())
}

/// System 2/3, stake 9.00 at 2.00, 2.50, 3.00, with the third leg lost.
fn scenario_3_system_lost_leg() -> SimResult {
    println!("Scenario 3: System 2/3 With a Lost Leg\n");

    let sim = Sim::new(WagerConfig::default())?;
    let carol = sim.engine.open_account(Cents::new(10_000))?;

    let placed = sim.engine.place_bet(PlacementRequest::system(
        carol.id,
        Cents::new(900),
        2,
        vec![
            leg("f1", "1x2", "home", "2.00")?,
            leg("f2", "1x2", "home", "2.50")?,
            leg("f3", "1x2", "home", "3.00")?,
        ],
    ))?;
    println!("  Carol stakes 9.00 across {} combinations", placed.quotes[0].combinations);
    println!("  Potential winnings (all legs win): {}", placed.quotes[0].potential_winnings);

    for entry in sim.engine.exposure_entries() {
        println!("    liability {} = {}", entry.key, entry.liability);
    }

    sim.engine.apply_fixture_result(&final_result("f1", &[("1x2", "home", SelectionStatus::Won)]))?;
    sim.engine.apply_fixture_result(&final_result("f2", &[("1x2", "home", SelectionStatus::Won)]))?;
    let summary = sim
        .engine
        .apply_fixture_result(&final_result("f3", &[("1x2", "home", SelectionStatus::Lost)]))?;

    if let Some(SettleReport::Settled { status, actual_winnings, .. }) = summary.settled.first() {
        println!("  Settled {}: only the f1+f2 pair pays, {}", status, actual_winnings);
    }
    println!("  Final balance: {}\n", sim.balance(carol.id)?);
    Ok(())
}

/// Operator voids a bet by hand; the audit log records it.
fn scenario_4_forced_settlement() -> SimResult {
    println!("Scenario 4: Forced Settlement and Cashout\n");

    let sim = Sim::new(WagerConfig::default())?;
    let dave = sim.engine.open_account(Cents::new(10_000))?;
    let trader = ActorId::new("trader-7");

    let placed = sim.engine.place_bet(PlacementRequest::singles(
        dave.id,
        Cents::new(1_000),
        vec![leg("abandoned", "1x2", "draw", "3.40")?, leg("live", "1x2", "away", "4.00")?],
    ))?;
    println!("  Dave places two singles, balance {}", placed.new_balance);

    let voided = sim.engine.force_settle(
        placed.bets[0].id(),
        ForcedOutcome::Void,
        "match abandoned after 20 minutes",
        &trader,
    )?;
    println!("  Trader voids the first: {:?}", voided);

    let cashed = sim.engine.cash_out(placed.bets[1].id(), Cents::new(2_200), &trader)?;
    println!("  Dave cashes out the second for 22.00: {:?}", cashed);

    println!("  Audit entries: {}", sim.audit.len());
    println!("  Final balance: {}\n", sim.balance(dave.id)?);
    Ok(())
}

/// Missing, conflicting and changed results.
fn scenario_5_reconciliation_anomalies() -> SimResult {
    println!("Scenario 5: Reconciliation Anomalies\n");

    let sim = Sim::new(WagerConfig::development())?;
    let erin = sim.engine.open_account(Cents::new(10_000))?;
    let fixture = FixtureId::new("bha-eve");

    sim.engine.place_bet(PlacementRequest::singles(
        erin.id,
        Cents::new(1_000),
        vec![leg("bha-eve", "1x2", "home", "2.10")?, leg("bha-eve", "ou25", "over", "1.90")?],
    ))?;

    sim.engine.reconcile_all()?;
    sim.clock.advance(sim.engine.config().reconciliation.missing_result_after_ms + 1);
    let sweep = sim.engine.reconcile_all()?;
    println!("  No result past the threshold, issues raised: {}", sweep.issues_raised());

    sim.results.publish(final_result(
        "bha-eve",
        &[
            ("1x2", "home", SelectionStatus::Won),
            ("ou25", "over", SelectionStatus::Won),
            ("ou25", "over", SelectionStatus::Lost),
        ],
    ));
    let report = sim.engine.reconcile_fixture(&fixture)?;
    println!(
        "  Conflicting result: raised {}, resolved {}, settled {}",
        report.raised.len(),
        report.resolved.len(),
        report.settlement.as_ref().map(|s| s.settled_count()).unwrap_or(0)
    );

    sim.results.publish(final_result(
        "bha-eve",
        &[("1x2", "home", SelectionStatus::Won), ("ou25", "over", SelectionStatus::Lost)],
    ));
    let report = sim.engine.reconcile_fixture(&fixture)?;
    println!(
        "  Clean result: resolved {}, settled {}",
        report.resolved.len(),
        report.settlement.as_ref().map(|s| s.settled_count()).unwrap_or(0)
    );

    sim.results.publish(final_result(
        "bha-eve",
        &[("1x2", "home", SelectionStatus::Lost), ("ou25", "over", SelectionStatus::Lost)],
    ));
    let sweep = sim.engine.reconcile_all()?;
    println!("  Result changed after payout, issues raised: {}", sweep.issues_raised());

    for issue in sim.engine.open_issues() {
        println!(
            "    open {} [{}] on {}: {} bets, {}",
            issue.issue_type,
            issue.severity,
            issue.fixture_id,
            issue.affected_bet_ids.len(),
            issue.detail
        );
    }
    println!("  Final balance: {}\n", sim.balance(erin.id)?);
    Ok(())
}

/// Eight threads race for one account that can only afford five stakes.
fn scenario_6_concurrent_placement() -> SimResult {
    println!("Scenario 6: Concurrent Placement\n");

    let sim = Sim::new(WagerConfig::default())?;
    let frank = sim.engine.open_account(Cents::new(5_000))?;
    let selection = leg("che-ars", "1x2", "draw", "3.20")?;

    let accepted = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = &sim.engine;
                let selection = selection.clone();
                scope.spawn(move || {
                    engine
                        .place_bet(PlacementRequest::singles(frank.id, Cents::new(1_000), vec![selection]))
                        .is_ok()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or(false))
            .filter(|ok| *ok)
            .count()
    });
    println!("  Accepted {} of 8 placements", accepted);

    let account = sim.engine.account(frank.id)?.ok_or(LedgerError::AccountNotFound(frank.id))?;
    let log = sim.engine.transactions(frank.id)?;
    verify_replay(&account, &log)?;
    println!("  Balance {} replays exactly from {} transactions", account.balance, log.len());

    sim.engine.verify_exposure()?;
    let key = ExposureKey::new("che-ars", "1x2", "draw");
    println!("  Liability on che-ars/1x2/draw: {} (rebuild agrees)\n", sim.engine.exposure(&key));
    Ok(())
}

/// The reconciliation loop under supervision.
fn scenario_7_supervised_worker() -> SimResult {
    println!("Scenario 7: Supervised Worker\n");

    let sim = Sim::new(WagerConfig::development())?;
    let gina = sim.engine.open_account(Cents::new(10_000))?;
    sim.engine.place_bet(PlacementRequest::combination(
        gina.id,
        Cents::new(2_000),
        vec![leg("w1", "1x2", "home", "1.50")?, leg("w2", "btts", "yes", "1.75")?],
    ))?;
    // trading closes at kick-off; settlement does not depend on it
    sim.markets.close_fixture(&FixtureId::new("w1"));
    sim.results.publish(final_result("w1", &[("1x2", "home", SelectionStatus::Won)]));
    sim.results.publish(final_result("w2", &[("btts", "yes", SelectionStatus::Won)]));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_time()
        .build()?;
    let worker = ReconciliationWorker::new(Arc::clone(&sim.engine), Duration::from_millis(20));

    runtime.block_on(async {
        worker.start()?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let health = worker.health();
        println!("  Worker running: {}, passes: {}", health.running, health.runs);
        worker.stop().await
    })?;

    let health = worker.health();
    println!("  Worker stopped: running {}, last error {:?}", health.running, health.last_error);
    println!("  Final balance: {} (expected {})\n", sim.balance(gina.id)?, Cents::new(8_000 + 5_250));
    Ok(())
}
