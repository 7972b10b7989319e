//! Settlement flow tests
//!
//! End to end: place through the engine, publish results on the fake feed,
//! and check balances, bet states, exposure, events and the audit trail.

use std::sync::Arc;
use wager_core::*;

struct Harness {
    engine: Engine,
    results: Arc<InMemoryResultFeed>,
    markets: Arc<InMemoryMarketBoard>,
    audit: Arc<InMemoryAuditLog>,
    clock: Arc<ManualClock>,
}

fn harness(config: WagerConfig) -> Harness {
    let results = Arc::new(InMemoryResultFeed::new());
    let markets = Arc::new(InMemoryMarketBoard::new());
    let audit = Arc::new(InMemoryAuditLog::new());
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000_000)));
    let engine = Engine::new(
        config,
        Collaborators {
            ledger: Arc::new(InMemoryLedger::new()),
            results: results.clone(),
            markets: markets.clone(),
            audit: audit.clone(),
            clock: clock.clone(),
        },
    )
    .unwrap();
    Harness {
        engine,
        results,
        markets,
        audit,
        clock,
    }
}

fn leg(fixture: &str, market: &str, outcome: &str, odds: &str) -> SelectionSpec {
    SelectionSpec::new(fixture, market, outcome, Odds::parse(odds).unwrap())
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

fn balance(h: &Harness, account_id: AccountId) -> Cents {
    h.engine.account(account_id).unwrap().unwrap().balance
}

fn assert_replays(h: &Harness, account_id: AccountId) {
    let account = h.engine.account(account_id).unwrap().unwrap();
    let log = h.engine.transactions(account_id).unwrap();
    verify_replay(&account, &log).unwrap();
}

fn count_events(h: &Harness, name: &str) -> usize {
    h.engine
        .events()
        .iter()
        .filter(|e| e.payload.name() == name)
        .count()
}

/// The worked examples: one per bet type.
mod payout_scenarios {
    use super::*;

    #[test]
    fn single_win_pays_stake_times_odds() {
        let h = harness(WagerConfig::default());
        let account = h.engine.open_account(Cents::new(10_000)).unwrap();
        let placed = h
            .engine
            .place_bet(PlacementRequest::singles(
                account.id,
                Cents::new(2_000),
                vec![leg("f1", "1x2", "home", "2.50")],
            ))
            .unwrap();
        assert_eq!(placed.new_balance, Cents::new(8_000));
        assert_eq!(placed.quotes[0].potential_winnings, Cents::new(5_000));

        h.engine
            .apply_fixture_result(&final_result("f1", &[("1x2", "home", SelectionStatus::Won)]))
            .unwrap();

        let bet = h.engine.bet(placed.bets[0].id()).unwrap().unwrap();
        assert_eq!(bet.bet.status, BetStatus::Won);
        assert_eq!(bet.bet.actual_winnings, Cents::new(5_000));
        assert!(bet.bet.settled_at.is_some());
        assert_eq!(balance(&h, account.id), Cents::new(13_000));
        assert_replays(&h, account.id);
    }

    #[test]
    fn combination_with_void_leg_pays_remaining_odds() {
        let h = harness(WagerConfig::default());
        let account = h.engine.open_account(Cents::new(10_000)).unwrap();
        let placed = h
            .engine
            .place_bet(PlacementRequest::combination(
                account.id,
                Cents::new(1_500),
                vec![leg("f1", "1x2", "home", "2.00"), leg("f2", "1x2", "away", "1.80")],
            ))
            .unwrap();
        assert_eq!(placed.bets.len(), 1);

        let first = h
            .engine
            .apply_fixture_result(&final_result("f1", &[("1x2", "home", SelectionStatus::Won)]))
            .unwrap();
        assert_eq!(first.still_pending, vec![placed.bets[0].id()]);

        let second = h
            .engine
            .apply_fixture_result(&final_result("f2", &[("1x2", "away", SelectionStatus::Void)]))
            .unwrap();
        assert_eq!(second.settled_count(), 1);

        let bet = h.engine.bet(placed.bets[0].id()).unwrap().unwrap();
        assert_eq!(bet.bet.status, BetStatus::Won);
        assert_eq!(bet.bet.actual_winnings, Cents::new(3_000));
        assert_eq!(balance(&h, account.id), Cents::new(11_500));
    }

    #[test]
    fn combination_voided_whole_under_strict_policy() {
        let mut config = WagerConfig::default();
        config.settlement.void_leg_policy = VoidLegPolicy::VoidWholeBet;
        let h = harness(config);
        let account = h.engine.open_account(Cents::new(10_000)).unwrap();
        let placed = h
            .engine
            .place_bet(PlacementRequest::combination(
                account.id,
                Cents::new(1_500),
                vec![leg("f1", "1x2", "home", "2.00"), leg("f2", "1x2", "away", "1.80")],
            ))
            .unwrap();

        h.engine
            .apply_fixture_result(&final_result("f1", &[("1x2", "home", SelectionStatus::Won)]))
            .unwrap();
        h.engine
            .apply_fixture_result(&final_result("f2", &[("1x2", "away", SelectionStatus::Void)]))
            .unwrap();

        let bet = h.engine.bet(placed.bets[0].id()).unwrap().unwrap();
        assert_eq!(bet.bet.status, BetStatus::Void);
        assert_eq!(balance(&h, account.id), Cents::new(10_000));
        assert_eq!(count_events(&h, "stake_refunded"), 1);
    }

    #[test]
    fn combination_lost_leg_loses_everything() {
        let h = harness(WagerConfig::default());
        let account = h.engine.open_account(Cents::new(10_000)).unwrap();
        let placed = h
            .engine
            .place_bet(PlacementRequest::combination(
                account.id,
                Cents::new(1_000),
                vec![leg("f1", "1x2", "home", "2.00"), leg("f2", "1x2", "away", "1.80")],
            ))
            .unwrap();

        h.engine
            .apply_fixture_result(&final_result("f1", &[("1x2", "home", SelectionStatus::Won)]))
            .unwrap();
        h.engine
            .apply_fixture_result(&final_result("f2", &[("1x2", "away", SelectionStatus::Lost)]))
            .unwrap();

        let bet = h.engine.bet(placed.bets[0].id()).unwrap().unwrap();
        assert_eq!(bet.bet.status, BetStatus::Lost);
        assert_eq!(bet.bet.actual_winnings, Cents::ZERO);
        assert_eq!(balance(&h, account.id), Cents::new(9_000));
        assert_eq!(h.engine.ledger().settlement_credit(bet.id()).unwrap(), None);
    }

    #[test]
    fn system_two_of_three_with_lost_leg() {
        let h = harness(WagerConfig::default());
        let account = h.engine.open_account(Cents::new(10_000)).unwrap();
        let placed = h
            .engine
            .place_bet(PlacementRequest::system(
                account.id,
                Cents::new(900),
                2,
                vec![leg("f1", "1x2", "home", "2.00"), leg("f2", "1x2", "home", "2.50"), leg("f3", "1x2", "home", "3.00")],
            ))
            .unwrap();
        assert_eq!(placed.quotes[0].combinations, 3);

        for (fixture, status) in [
            ("f1", SelectionStatus::Won),
            ("f2", SelectionStatus::Won),
            ("f3", SelectionStatus::Lost),
        ] {
            h.engine
                .apply_fixture_result(&final_result(fixture, &[("1x2", "home", status)]))
                .unwrap();
        }

        let bet = h.engine.bet(placed.bets[0].id()).unwrap().unwrap();
        assert_eq!(bet.bet.status, BetStatus::Won);
        // 900 / 3 per combination, only 2.00 x 2.50 survives
        assert_eq!(bet.bet.actual_winnings, Cents::new(1_500));
        assert_eq!(balance(&h, account.id), Cents::new(10_600));
    }

    #[test]
    fn system_with_every_combination_lost_is_lost() {
        let h = harness(WagerConfig::default());
        let account = h.engine.open_account(Cents::new(10_000)).unwrap();
        let placed = h
            .engine
            .place_bet(PlacementRequest::system(
                account.id,
                Cents::new(900),
                2,
                vec![leg("f1", "1x2", "home", "2.00"), leg("f2", "1x2", "home", "2.50"), leg("f3", "1x2", "home", "3.00")],
            ))
            .unwrap();

        for (fixture, status) in [
            ("f1", SelectionStatus::Won),
            ("f2", SelectionStatus::Lost),
            ("f3", SelectionStatus::Lost),
        ] {
            h.engine
                .apply_fixture_result(&final_result(fixture, &[("1x2", "home", status)]))
                .unwrap();
        }

        let bet = h.engine.bet(placed.bets[0].id()).unwrap().unwrap();
        assert_eq!(bet.bet.status, BetStatus::Lost);
        assert_eq!(balance(&h, account.id), Cents::new(9_100));
    }

    #[test]
    fn void_single_refunds_stake() {
        let h = harness(WagerConfig::default());
        let account = h.engine.open_account(Cents::new(5_000)).unwrap();
        let placed = h
            .engine
            .place_bet(PlacementRequest::singles(
                account.id,
                Cents::new(1_000),
                vec![leg("f1", "1x2", "draw", "3.30")],
            ))
            .unwrap();

        let summary = h
            .engine
            .apply_fixture_result(&final_result("f1", &[("1x2", "draw", SelectionStatus::Void)]))
            .unwrap();
        match &summary.settled[0] {
            SettleReport::Settled { status, credit, .. } => {
                assert_eq!(*status, BetStatus::Void);
                let tx = credit.as_ref().unwrap();
                assert_eq!(tx.kind, TransactionKind::Refund);
                assert_eq!(tx.amount, Cents::new(1_000));
            }
            other => panic!("unexpected report {:?}", other),
        }
        assert_eq!(h.engine.bet(placed.bets[0].id()).unwrap().unwrap().bet.status, BetStatus::Void);
        assert_eq!(balance(&h, account.id), Cents::new(5_000));
    }
}

/// Settling twice never pays twice.
mod idempotency_tests {
    use super::*;

    #[test]
    fn resettling_is_a_no_op() {
        let h = harness(WagerConfig::default());
        let account = h.engine.open_account(Cents::new(10_000)).unwrap();
        let placed = h
            .engine
            .place_bet(PlacementRequest::singles(
                account.id,
                Cents::new(2_000),
                vec![leg("f1", "1x2", "home", "2.50")],
            ))
            .unwrap();
        let bet_id = placed.bets[0].id();
        let result = final_result("f1", &[("1x2", "home", SelectionStatus::Won)]);

        h.engine.apply_fixture_result(&result).unwrap();
        let again = h.engine.apply_fixture_result(&result).unwrap();
        assert_eq!(again.settled_count(), 0);

        assert_eq!(
            h.engine.settle_bet(bet_id).unwrap(),
            SettleReport::Unchanged {
                bet_id,
                status: BetStatus::Won
            }
        );
        assert_eq!(balance(&h, account.id), Cents::new(13_000));
        assert_eq!(count_events(&h, "winnings_credited"), 1);
        assert_eq!(count_events(&h, "bet_settled"), 1);
    }

    #[test]
    fn provisional_results_settle_nothing() {
        let h = harness(WagerConfig::default());
        let account = h.engine.open_account(Cents::new(10_000)).unwrap();
        h.engine
            .place_bet(PlacementRequest::singles(
                account.id,
                Cents::new(2_000),
                vec![leg("f1", "1x2", "home", "2.50")],
            ))
            .unwrap();

        let provisional = FixtureResult::new(
            "f1",
            Finality::Provisional,
            vec![OutcomeResult::new("1x2", "home", SelectionStatus::Won)],
        );
        let summary = h.engine.apply_fixture_result(&provisional).unwrap();
        assert_eq!(summary.selections_updated, 0);
        assert_eq!(h.engine.ledger().pending_bets().unwrap().len(), 1);
    }

    #[test]
    fn credit_recorded_before_crash_is_finished_on_retry() {
        let h = harness(WagerConfig::default());
        let account = h.engine.open_account(Cents::new(10_000)).unwrap();
        let placed = h
            .engine
            .place_bet(PlacementRequest::singles(
                account.id,
                Cents::new(2_000),
                vec![leg("f1", "1x2", "home", "2.50")],
            ))
            .unwrap();
        let record = &placed.bets[0];

        // the credit landed but the process died before the status change
        h.engine
            .ledger()
            .set_selection_status(record.selections[0].id, SelectionStatus::Won)
            .unwrap();
        h.engine
            .ledger()
            .credit_winnings(record.id(), Cents::new(5_000), h.engine.now())
            .unwrap();

        let report = h.engine.settle_bet(record.id()).unwrap();
        assert!(report.is_settled());
        assert_eq!(balance(&h, account.id), Cents::new(13_000));
        assert_replays(&h, account.id);
    }

    #[test]
    fn conflicting_credit_halts_the_bet() {
        let h = harness(WagerConfig::default());
        let operator = ActorId::new("ops-1");
        let account = h.engine.open_account(Cents::new(10_000)).unwrap();
        let placed = h
            .engine
            .place_bet(PlacementRequest::singles(
                account.id,
                Cents::new(2_000),
                vec![leg("f1", "1x2", "home", "2.50")],
            ))
            .unwrap();
        let record = &placed.bets[0];
        let bet_id = record.id();

        h.engine
            .ledger()
            .credit_winnings(bet_id, Cents::new(4_000), h.engine.now())
            .unwrap();
        h.engine
            .ledger()
            .set_selection_status(record.selections[0].id, SelectionStatus::Won)
            .unwrap();

        assert!(matches!(
            h.engine.settle_bet(bet_id),
            Err(SettlementError::IdempotencyViolation { .. })
        ));
        assert!(h.engine.is_halted(bet_id));
        assert!(matches!(h.engine.settle_bet(bet_id), Err(SettlementError::Halted { .. })));
        assert_eq!(count_events(&h, "settlement_halted"), 1);
        // only the stray credit was paid
        assert_eq!(balance(&h, account.id), Cents::new(12_000));

        assert_eq!(
            h.engine.release_halt(bet_id, &operator, ""),
            Err(SettlementError::MissingReason)
        );
        h.engine.release_halt(bet_id, &operator, "investigated").unwrap();
        assert!(!h.engine.is_halted(bet_id));
        assert_eq!(
            h.engine.release_halt(bet_id, &operator, "again"),
            Err(SettlementError::NotHalted(bet_id))
        );
        assert_eq!(h.audit.for_target(&bet_id.to_string()).len(), 1);

        // the operator closes it out at the amount already paid
        let report = h
            .engine
            .force_settle(
                bet_id,
                ForcedOutcome::Won {
                    winnings: Some(Cents::new(4_000)),
                },
                "settle at the credited amount",
                &operator,
            )
            .unwrap();
        assert!(report.is_settled());
        assert_eq!(balance(&h, account.id), Cents::new(12_000));
        assert_replays(&h, account.id);
    }
}

/// Operator overrides and cashout.
mod manual_tests {
    use super::*;

    #[test]
    fn force_settle_void_refunds_and_audits() {
        let h = harness(WagerConfig::default());
        let trader = ActorId::new("trader-7");
        let account = h.engine.open_account(Cents::new(10_000)).unwrap();
        let placed = h
            .engine
            .place_bet(PlacementRequest::singles(
                account.id,
                Cents::new(1_000),
                vec![leg("f1", "1x2", "draw", "3.40")],
            ))
            .unwrap();
        let bet_id = placed.bets[0].id();

        assert_eq!(
            h.engine.force_settle(bet_id, ForcedOutcome::Void, "  ", &trader),
            Err(SettlementError::MissingReason)
        );
        h.engine
            .force_settle(bet_id, ForcedOutcome::Void, "match abandoned", &trader)
            .unwrap();

        assert_eq!(balance(&h, account.id), Cents::new(10_000));
        let entries = h.audit.for_target(&bet_id.to_string());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::ForceSettle);
        assert_eq!(entries[0].actor_id, trader);
        assert_eq!(entries[0].reason, "match abandoned");
        assert_eq!(entries[0].data_before["bet"]["status"], "pending");
        assert_eq!(entries[0].data_after["bet"]["status"], "void");
        assert_eq!(count_events(&h, "forced_settlement"), 1);

        // forcing a terminal bet changes nothing and writes no audit entry
        let again = h
            .engine
            .force_settle(bet_id, ForcedOutcome::Lost, "second attempt", &trader)
            .unwrap();
        assert_eq!(
            again,
            SettleReport::Unchanged {
                bet_id,
                status: BetStatus::Void
            }
        );
        assert_eq!(h.audit.len(), 1);
    }

    #[test]
    fn force_settle_won_defaults_to_potential_winnings() {
        let h = harness(WagerConfig::default());
        let trader = ActorId::new("trader-7");
        let account = h.engine.open_account(Cents::new(10_000)).unwrap();
        let placed = h
            .engine
            .place_bet(PlacementRequest::singles(
                account.id,
                Cents::new(1_000),
                vec![leg("f1", "1x2", "away", "4.00")],
            ))
            .unwrap();
        let bet_id = placed.bets[0].id();

        assert!(matches!(
            h.engine.force_settle(
                bet_id,
                ForcedOutcome::Won {
                    winnings: Some(Cents::ZERO)
                },
                "bad amount",
                &trader
            ),
            Err(SettlementError::InvalidAmount { .. })
        ));
        // more than the quoted 40.00 is refused too
        assert_eq!(
            h.engine.force_settle(
                bet_id,
                ForcedOutcome::Won {
                    winnings: Some(Cents::new(4_001))
                },
                "goodwill",
                &trader
            ),
            Err(SettlementError::InvalidAmount {
                bet_id,
                amount: Cents::new(4_001),
                max: Cents::new(4_000),
            })
        );
        assert_eq!(balance(&h, account.id), Cents::new(9_000));
        h.engine
            .force_settle(bet_id, ForcedOutcome::Won { winnings: None }, "feed outage", &trader)
            .unwrap();
        assert_eq!(balance(&h, account.id), Cents::new(13_000));
        assert!(h.engine.exposure_entries().is_empty());
    }

    #[test]
    fn cashout_pays_agreed_amount_once() {
        let h = harness(WagerConfig::default());
        let customer = ActorId::new("customer-1");
        let account = h.engine.open_account(Cents::new(10_000)).unwrap();
        let placed = h
            .engine
            .place_bet(PlacementRequest::singles(
                account.id,
                Cents::new(1_000),
                vec![leg("f1", "1x2", "away", "4.00")],
            ))
            .unwrap();
        let bet_id = placed.bets[0].id();

        assert!(matches!(
            h.engine.cash_out(bet_id, Cents::new(4_001), &customer),
            Err(SettlementError::InvalidAmount { .. })
        ));
        let report = h.engine.cash_out(bet_id, Cents::new(2_200), &customer).unwrap();
        assert!(report.is_settled());

        let bet = h.engine.bet(bet_id).unwrap().unwrap();
        assert_eq!(bet.bet.status, BetStatus::Cashout);
        assert_eq!(bet.bet.actual_winnings, Cents::new(2_200));
        assert_eq!(balance(&h, account.id), Cents::new(11_200));

        // a late result does not touch a cashed out bet
        h.engine
            .apply_fixture_result(&final_result("f1", &[("1x2", "away", SelectionStatus::Won)]))
            .unwrap();
        assert_eq!(balance(&h, account.id), Cents::new(11_200));
        assert_eq!(h.audit.entries()[0].action, AuditAction::CashOut);
    }

    #[test]
    fn balance_adjustment_is_audited() {
        let h = harness(WagerConfig::default());
        let operator = ActorId::new("ops-1");
        let account = h.engine.open_account(Cents::ZERO).unwrap();

        assert!(matches!(
            h.engine
                .adjust_balance(account.id, Cents::new(500), None, "dep-1", &operator, ""),
            Err(EngineError::MissingReason)
        ));
        h.engine
            .adjust_balance(account.id, Cents::new(500), None, "dep-1", &operator, "deposit")
            .unwrap();
        // stale expectation: balance is 500, not 0
        assert!(h
            .engine
            .adjust_balance(account.id, Cents::new(100), Some(Cents::ZERO), "dep-2", &operator, "deposit")
            .is_err());

        assert_eq!(balance(&h, account.id), Cents::new(500));
        assert_eq!(h.audit.len(), 1);
        assert_eq!(count_events(&h, "balance_adjusted"), 1);
        assert_replays(&h, account.id);
    }
}

/// Placement guards that need collaborators.
mod placement_tests {
    use super::*;

    #[test]
    fn closed_market_rejects_without_debit() {
        let h = harness(WagerConfig::default());
        let account = h.engine.open_account(Cents::new(10_000)).unwrap();
        h.markets
            .suspend(&FixtureId::new("f1"), &MarketKey::new("1x2"));

        let err = h
            .engine
            .place_bet(PlacementRequest::singles(
                account.id,
                Cents::new(1_000),
                vec![leg("f1", "1x2", "home", "2.00")],
            ))
            .unwrap_err();
        assert!(matches!(err, PlacementError::MarketClosed { .. }));
        assert_eq!(balance(&h, account.id), Cents::new(10_000));
        assert!(h.engine.transactions(account.id).unwrap().len() <= 1);
    }

    #[test]
    fn insufficient_funds_creates_nothing() {
        let h = harness(WagerConfig::default());
        let account = h.engine.open_account(Cents::new(1_500)).unwrap();

        let err = h
            .engine
            .place_bet(PlacementRequest::singles(
                account.id,
                Cents::new(1_000),
                vec![leg("f1", "1x2", "home", "2.00"), leg("f2", "1x2", "home", "2.00")],
            ))
            .unwrap_err();
        assert!(matches!(err, PlacementError::InsufficientFunds { .. }));
        assert!(h.engine.ledger().pending_bets().unwrap().is_empty());
        assert!(h.engine.exposure_entries().is_empty());
        assert_eq!(balance(&h, account.id), Cents::new(1_500));
    }

    #[test]
    fn unknown_account_is_reported() {
        let h = harness(WagerConfig::default());
        let err = h
            .engine
            .place_bet(PlacementRequest::singles(
                AccountId(999),
                Cents::new(1_000),
                vec![leg("f1", "1x2", "home", "2.00")],
            ))
            .unwrap_err();
        assert_eq!(err, PlacementError::AccountNotFound(AccountId(999)));
    }
}

/// Missing, duplicate and mismatched results.
mod reconciliation_tests {
    use super::*;

    #[test]
    fn missing_result_raised_then_escalated_then_cleared() {
        let h = harness(WagerConfig::development());
        let account = h.engine.open_account(Cents::new(10_000)).unwrap();
        let placed = h
            .engine
            .place_bet(PlacementRequest::singles(
                account.id,
                Cents::new(1_000),
                vec![leg("f1", "1x2", "home", "2.00")],
            ))
            .unwrap();
        let fixture = FixtureId::new("f1");
        let threshold = h.engine.config().reconciliation.missing_result_after_ms;

        let report = h.engine.reconcile_fixture(&fixture).unwrap();
        assert_eq!(report.result, ResultState::Absent);
        assert!(report.raised.is_empty());

        h.clock.advance(threshold);
        let report = h.engine.reconcile_fixture(&fixture).unwrap();
        assert_eq!(report.raised.len(), 1);
        assert_eq!(report.raised[0].issue_type, IssueType::MissingResult);
        assert_eq!(report.raised[0].severity, Severity::Medium);
        assert_eq!(report.raised[0].affected_bet_ids, vec![placed.bets[0].id()]);

        // same observation again only refreshes
        let report = h.engine.reconcile_fixture(&fixture).unwrap();
        assert!(report.raised.is_empty() && report.escalated.is_empty());

        h.clock.advance(threshold);
        let report = h.engine.reconcile_fixture(&fixture).unwrap();
        assert_eq!(report.escalated.len(), 1);
        assert_eq!(report.escalated[0].severity, Severity::High);
        assert_eq!(h.engine.open_issues().len(), 1);

        h.results
            .publish(final_result("f1", &[("1x2", "home", SelectionStatus::Won)]));
        let report = h.engine.reconcile_fixture(&fixture).unwrap();
        assert_eq!(report.resolved.len(), 1);
        assert_eq!(report.settlement.unwrap().settled_count(), 1);
        assert!(h.engine.open_issues().is_empty());
        assert_eq!(balance(&h, account.id), Cents::new(11_000));
    }

    #[test]
    fn feed_outage_is_recorded_not_fatal() {
        let h = harness(WagerConfig::development());
        let account = h.engine.open_account(Cents::new(10_000)).unwrap();
        h.engine
            .place_bet(PlacementRequest::singles(
                account.id,
                Cents::new(1_000),
                vec![leg("f1", "1x2", "home", "2.00"), leg("f2", "1x2", "home", "2.00")],
            ))
            .unwrap();
        h.results.fail(&FixtureId::new("f1"));
        h.results
            .publish(final_result("f2", &[("1x2", "home", SelectionStatus::Lost)]));

        let sweep = h.engine.reconcile_all().unwrap();
        assert_eq!(sweep.reports.len(), 2);
        assert_eq!(sweep.feed_errors(), 1);
        assert!(sweep.failures.is_empty());
        assert_eq!(h.engine.ledger().pending_bets().unwrap().len(), 1);
    }

    #[test]
    fn conflicting_outcome_stays_pending_until_clean() {
        let h = harness(WagerConfig::development());
        let account = h.engine.open_account(Cents::new(10_000)).unwrap();
        let placed = h
            .engine
            .place_bet(PlacementRequest::singles(
                account.id,
                Cents::new(1_000),
                vec![leg("f1", "1x2", "home", "2.10"), leg("f1", "ou25", "over", "1.90")],
            ))
            .unwrap();
        let (home, over) = (placed.bets[0].id(), placed.bets[1].id());
        let fixture = FixtureId::new("f1");

        h.results.publish(final_result(
            "f1",
            &[
                ("1x2", "home", SelectionStatus::Won),
                ("ou25", "over", SelectionStatus::Won),
                ("ou25", "over", SelectionStatus::Lost),
            ],
        ));
        let report = h.engine.reconcile_fixture(&fixture).unwrap();
        assert_eq!(report.raised.len(), 1);
        let issue = &report.raised[0];
        assert_eq!(issue.issue_type, IssueType::DuplicateResult);
        assert_eq!(issue.severity, Severity::High);
        assert_eq!(issue.affected_bet_ids, vec![over]);

        let settlement = report.settlement.unwrap();
        assert_eq!(settlement.conflicting_outcomes, 1);
        assert_eq!(settlement.still_pending, vec![over]);
        assert_eq!(h.engine.bet(home).unwrap().unwrap().bet.status, BetStatus::Won);

        h.results.publish(final_result(
            "f1",
            &[("1x2", "home", SelectionStatus::Won), ("ou25", "over", SelectionStatus::Lost)],
        ));
        let report = h.engine.reconcile_fixture(&fixture).unwrap();
        assert_eq!(report.resolved.len(), 1);
        assert!(report.raised.is_empty());
        assert_eq!(h.engine.bet(over).unwrap().unwrap().bet.status, BetStatus::Lost);
        assert!(h.engine.open_issues().is_empty());
        assert_eq!(balance(&h, account.id), Cents::new(10_100));
    }

    #[test]
    fn changed_result_after_payout_is_critical_and_keeps_payout() {
        let h = harness(WagerConfig::development());
        let operator = ActorId::new("ops-1");
        let account = h.engine.open_account(Cents::new(10_000)).unwrap();
        let placed = h
            .engine
            .place_bet(PlacementRequest::singles(
                account.id,
                Cents::new(1_000),
                vec![leg("f1", "1x2", "home", "2.00")],
            ))
            .unwrap();
        let bet_id = placed.bets[0].id();

        h.results
            .publish(final_result("f1", &[("1x2", "home", SelectionStatus::Won)]));
        h.engine.reconcile_all().unwrap();
        assert_eq!(balance(&h, account.id), Cents::new(11_000));

        h.results
            .publish(final_result("f1", &[("1x2", "home", SelectionStatus::Lost)]));
        let sweep = h.engine.reconcile_all().unwrap();
        assert_eq!(sweep.issues_raised(), 1);

        let issues = h.engine.open_issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_type, IssueType::Mismatch);
        assert_eq!(issues[0].severity, Severity::Critical);
        assert_eq!(issues[0].affected_bet_ids, vec![bet_id]);
        assert_eq!(balance(&h, account.id), Cents::new(11_000));
        assert_eq!(h.engine.bet(bet_id).unwrap().unwrap().bet.status, BetStatus::Won);

        assert_eq!(
            h.engine.resolve_issue(issues[0].id, &operator, "").unwrap_err(),
            ReconcileError::MissingReason
        );
        let resolved = h
            .engine
            .resolve_issue(issues[0].id, &operator, "customer kept winnings")
            .unwrap();
        assert_eq!(resolved.resolved_by, Some(operator.clone()));
        assert!(h.engine.open_issues().is_empty());
        assert_eq!(h.audit.entries()[0].action, AuditAction::ResolveIssue);
        assert_eq!(count_events(&h, "issue_resolved"), 1);
    }

    #[test]
    fn watched_fixture_is_forgotten_after_window() {
        let h = harness(WagerConfig::development());
        let account = h.engine.open_account(Cents::new(10_000)).unwrap();
        h.engine
            .place_bet(PlacementRequest::singles(
                account.id,
                Cents::new(1_000),
                vec![leg("f1", "1x2", "home", "2.00")],
            ))
            .unwrap();
        h.results
            .publish(final_result("f1", &[("1x2", "home", SelectionStatus::Won)]));
        h.engine.reconcile_all().unwrap();
        assert_eq!(h.engine.reconcile_all().unwrap().reports.len(), 1);

        h.clock
            .advance(h.engine.config().reconciliation.mismatch_watch_ms + 1);
        h.engine.reconcile_all().unwrap();
        assert!(h.engine.reconcile_all().unwrap().reports.is_empty());
    }
}

/// Liability book follows the pending set.
mod exposure_tests {
    use super::*;

    #[test]
    fn exposure_tracks_placement_and_settlement() {
        let h = harness(WagerConfig::default());
        let account = h.engine.open_account(Cents::new(50_000)).unwrap();
        h.engine
            .place_bet(PlacementRequest::singles(
                account.id,
                Cents::new(1_000),
                vec![leg("f1", "1x2", "home", "2.50"), leg("f1", "1x2", "away", "3.00")],
            ))
            .unwrap();
        h.engine
            .place_bet(PlacementRequest::singles(
                account.id,
                Cents::new(2_000),
                vec![leg("f1", "1x2", "home", "2.00")],
            ))
            .unwrap();

        let home = ExposureKey::new("f1", "1x2", "home");
        let away = ExposureKey::new("f1", "1x2", "away");
        assert_eq!(h.engine.exposure(&home), Cents::new(1_500 + 2_000));
        assert_eq!(h.engine.exposure(&away), Cents::new(2_000));
        assert_eq!(h.engine.max_exposure().unwrap().key, home);
        assert_eq!(h.engine.exposure_for_fixture(&FixtureId::new("f1")).len(), 2);
        h.engine.verify_exposure().unwrap();

        h.engine
            .apply_fixture_result(&final_result(
                "f1",
                &[("1x2", "home", SelectionStatus::Won), ("1x2", "away", SelectionStatus::Lost)],
            ))
            .unwrap();
        assert_eq!(h.engine.exposure(&home), Cents::ZERO);
        assert_eq!(h.engine.total_exposure(), Cents::ZERO);
        h.engine.verify_exposure().unwrap();
        assert!(count_events(&h, "exposure_updated") >= 2);
    }

    #[test]
    fn restart_rebuilds_the_same_book() {
        let ledger: Arc<dyn LedgerStore> = Arc::new(InMemoryLedger::new());
        let collaborators = |ledger: Arc<dyn LedgerStore>| Collaborators {
            ledger,
            results: Arc::new(InMemoryResultFeed::new()),
            markets: Arc::new(InMemoryMarketBoard::new()),
            audit: Arc::new(InMemoryAuditLog::new()),
            clock: Arc::new(ManualClock::new(Timestamp::from_millis(1_000))),
        };

        let first = Engine::new(WagerConfig::default(), collaborators(ledger.clone())).unwrap();
        let account = first.open_account(Cents::new(50_000)).unwrap();
        first
            .place_bet(PlacementRequest::combination(
                account.id,
                Cents::new(1_000),
                vec![leg("f1", "1x2", "home", "1.50"), leg("f2", "1x2", "home", "2.20")],
            ))
            .unwrap();
        first
            .place_bet(PlacementRequest::system(
                account.id,
                Cents::new(900),
                2,
                vec![leg("f1", "1x2", "away", "4.00"), leg("f3", "btts", "yes", "1.80"), leg("f4", "1x2", "draw", "3.10")],
            ))
            .unwrap();

        let second = Engine::new(WagerConfig::default(), collaborators(ledger)).unwrap();
        assert_eq!(first.exposure_entries(), second.exposure_entries());
        assert_eq!(second.rebuild_exposure().unwrap(), 0);
    }

    /// Ledger that lets a settler finalize each bet the moment placement commits it,
    /// before the engine has touched the exposure book.
    struct SettleOnReserve {
        inner: InMemoryLedger,
        engine: std::sync::OnceLock<std::sync::Weak<Engine>>,
    }

    impl LedgerStore for SettleOnReserve {
        fn open_account(&self, opening_balance: Cents, at: Timestamp) -> Result<Account, LedgerError> {
            self.inner.open_account(opening_balance, at)
        }
        fn account(&self, account_id: AccountId) -> Result<Option<Account>, LedgerError> {
            self.inner.account(account_id)
        }
        fn account_ids(&self) -> Result<Vec<AccountId>, LedgerError> {
            self.inner.account_ids()
        }
        fn transactions(&self, account_id: AccountId) -> Result<Vec<Transaction>, LedgerError> {
            self.inner.transactions(account_id)
        }
        fn adjust_balance(
            &self,
            account_id: AccountId,
            amount: Cents,
            expected_balance: Option<Cents>,
            reference: &str,
            at: Timestamp,
        ) -> Result<Transaction, LedgerError> {
            self.inner.adjust_balance(account_id, amount, expected_balance, reference, at)
        }
        fn reserve_stake_and_create_bets(
            &self,
            account_id: AccountId,
            drafts: &[BetDraft],
            placed_at: Timestamp,
        ) -> Result<Reservation, LedgerError> {
            let reservation = self.inner.reserve_stake_and_create_bets(account_id, drafts, placed_at)?;
            if let Some(engine) = self.engine.get().and_then(|w| w.upgrade()) {
                for record in &reservation.bets {
                    engine
                        .force_settle(record.id(), ForcedOutcome::Void, "fixture abandoned", &ActorId::new("ops"))
                        .unwrap();
                }
            }
            Ok(reservation)
        }
        fn credit_winnings(&self, bet_id: BetId, amount: Cents, at: Timestamp) -> Result<Transaction, LedgerError> {
            self.inner.credit_winnings(bet_id, amount, at)
        }
        fn refund_stake(&self, bet_id: BetId, at: Timestamp) -> Result<Transaction, LedgerError> {
            self.inner.refund_stake(bet_id, at)
        }
        fn finalize_bet(
            &self,
            bet_id: BetId,
            status: BetStatus,
            actual_winnings: Cents,
            settled_at: Timestamp,
        ) -> Result<Finalized, LedgerError> {
            self.inner.finalize_bet(bet_id, status, actual_winnings, settled_at)
        }
        fn set_selection_status(
            &self,
            selection_id: SelectionId,
            status: SelectionStatus,
        ) -> Result<Selection, LedgerError> {
            self.inner.set_selection_status(selection_id, status)
        }
        fn bet(&self, bet_id: BetId) -> Result<Option<BetRecord>, LedgerError> {
            self.inner.bet(bet_id)
        }
        fn pending_bets(&self) -> Result<Vec<BetRecord>, LedgerError> {
            self.inner.pending_bets()
        }
        fn pending_bets_for_fixture(&self, fixture_id: &FixtureId) -> Result<Vec<BetRecord>, LedgerError> {
            self.inner.pending_bets_for_fixture(fixture_id)
        }
        fn bets_for_fixture(&self, fixture_id: &FixtureId) -> Result<Vec<BetRecord>, LedgerError> {
            self.inner.bets_for_fixture(fixture_id)
        }
        fn pending_fixtures(&self) -> Result<Vec<FixtureId>, LedgerError> {
            self.inner.pending_fixtures()
        }
        fn settlement_credit(&self, bet_id: BetId) -> Result<Option<Transaction>, LedgerError> {
            self.inner.settlement_credit(bet_id)
        }
    }

    #[test]
    fn bet_settled_before_exposure_update_leaves_no_liability() {
        let ledger = Arc::new(SettleOnReserve {
            inner: InMemoryLedger::new(),
            engine: std::sync::OnceLock::new(),
        });
        let engine = Arc::new(
            Engine::new(
                WagerConfig::default(),
                Collaborators {
                    ledger: ledger.clone(),
                    results: Arc::new(InMemoryResultFeed::new()),
                    markets: Arc::new(InMemoryMarketBoard::new()),
                    audit: Arc::new(InMemoryAuditLog::new()),
                    clock: Arc::new(ManualClock::new(Timestamp::from_millis(1_000))),
                },
            )
            .unwrap(),
        );
        let account = engine.open_account(Cents::new(10_000)).unwrap();
        ledger.engine.set(Arc::downgrade(&engine)).unwrap();

        let placed = engine
            .place_bet(PlacementRequest::singles(
                account.id,
                Cents::new(2_000),
                vec![leg("f1", "1x2", "home", "2.50")],
            ))
            .unwrap();

        let stored = engine.ledger().bet(placed.bets[0].id()).unwrap().unwrap();
        assert_eq!(stored.bet.status, BetStatus::Void);
        assert_eq!(engine.exposure(&ExposureKey::new("f1", "1x2", "home")), Cents::ZERO);
        assert_eq!(engine.total_exposure(), Cents::ZERO);
        engine.verify_exposure().unwrap();
        assert_eq!(engine.account(account.id).unwrap().unwrap().balance, Cents::new(10_000));
    }
}
