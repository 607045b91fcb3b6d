//! Benchmark: Managed Position state transition performance
//!
//! Purpose: measure overhead of `ManagedPosition::apply_event`, the only
//! mutator on the position state machine.
//! Target: transitions should cost a handful of decimal arithmetic ops and
//! a small map/set insert, not more.
//!
//! What's Measured:
//! - Pending -> Open (entry fill finalises the entry, places stop + TP ladder)
//! - A single TP1 partial fill (break-even stop move, state -> Partial)
//! - A full clean lifecycle (entry, TP1, TP2, TP3 -> Closed)
//! - Duplicate-event replay (the idempotency fast path)
//! - Operator exit request -> EXIT_PENDING -> Closed
//!
//! Why This Matters:
//! Every exchange event for every open position flows through this
//! function. It must stay cheap enough that a burst of fills across a full
//! book of positions never becomes the tick-loop bottleneck.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use perp_core::clock::FakeClock;
use perp_core::events::ExchangeEvent;
use perp_core::ids::{ExchangeOrderId, FillId, PositionId};
use perp_core::position::{ManagedPosition, PositionConfig, PositionIntent};
use perp_core::types::{Side, Symbol};
use rust_decimal_macros::dec;

fn config() -> PositionConfig {
    PositionConfig {
        tp_splits: [dec!(0.4), dec!(0.4), dec!(0.2)],
        min_partial_for_be: dec!(0.3),
        trailing_activation_atr_min: None,
    }
}

fn intent() -> PositionIntent {
    PositionIntent {
        initial_size: dec!(1.0),
        initial_entry_price: dec!(50000),
        initial_stop_price: dec!(49000),
        initial_tp_prices: [dec!(50500), dec!(51000), dec!(52000)],
        entry_score: dec!(1),
        cluster: None,
        initial_stop_distance_pct: dec!(0.02),
        margin_used_at_entry: dec!(5000),
        atr_at_entry: None,
    }
}

fn pending_position(clock: &FakeClock) -> ManagedPosition {
    ManagedPosition::new(
        PositionId::try_from("p1".to_string()).unwrap(),
        Symbol::from("BTC/USD"),
        Side::Long,
        intent(),
        clock,
    )
}

fn bench_entry_fill_finalises(c: &mut Criterion) {
    let mut group = c.benchmark_group("position_fsm");
    group.significance_level(0.01).sample_size(10_000);

    let clock = FakeClock::new();
    let cfg = config();

    group.bench_function("entry_fill_to_open", |b| {
        b.iter(|| {
            let mut pos = pending_position(&clock);
            let actions = pos
                .apply_event(
                    ExchangeEvent::EntryFill {
                        order_id: ExchangeOrderId("o1".to_string()),
                        fill_id: FillId("f1".to_string()),
                        qty: dec!(1.0),
                        price: dec!(50000),
                        event_seq: 1,
                    },
                    &cfg,
                    &clock,
                )
                .unwrap();
            black_box(actions);
        });
    });

    group.finish();
}

fn bench_tp1_partial_with_break_even(c: &mut Criterion) {
    let mut group = c.benchmark_group("position_fsm");
    group.significance_level(0.01).sample_size(10_000);

    let clock = FakeClock::new();
    let cfg = config();

    group.bench_function("tp1_partial_break_even", |b| {
        b.iter(|| {
            let mut pos = pending_position(&clock);
            pos.apply_event(
                ExchangeEvent::EntryFill {
                    order_id: ExchangeOrderId("o1".to_string()),
                    fill_id: FillId("f1".to_string()),
                    qty: dec!(1.0),
                    price: dec!(50000),
                    event_seq: 1,
                },
                &cfg,
                &clock,
            )
            .unwrap();
            let actions = pos
                .apply_event(
                    ExchangeEvent::TpFill {
                        tp_index: 1,
                        order_id: ExchangeOrderId("tp1".to_string()),
                        fill_id: FillId("f2".to_string()),
                        qty: dec!(0.4),
                        price: dec!(50500),
                        event_seq: 1,
                    },
                    &cfg,
                    &clock,
                )
                .unwrap();
            black_box(actions);
        });
    });

    group.finish();
}

fn bench_full_clean_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("position_fsm");
    group.significance_level(0.01).sample_size(5_000);

    let clock = FakeClock::new();
    let cfg = config();

    group.bench_function("full_lifecycle_to_closed", |b| {
        b.iter(|| {
            let mut pos = pending_position(&clock);
            pos.apply_event(
                ExchangeEvent::EntryFill {
                    order_id: ExchangeOrderId("o1".to_string()),
                    fill_id: FillId("f1".to_string()),
                    qty: dec!(1.0),
                    price: dec!(50000),
                    event_seq: 1,
                },
                &cfg,
                &clock,
            )
            .unwrap();
            pos.apply_event(
                ExchangeEvent::TpFill {
                    tp_index: 1,
                    order_id: ExchangeOrderId("tp1".to_string()),
                    fill_id: FillId("f2".to_string()),
                    qty: dec!(0.4),
                    price: dec!(50500),
                    event_seq: 1,
                },
                &cfg,
                &clock,
            )
            .unwrap();
            pos.apply_event(
                ExchangeEvent::TpFill {
                    tp_index: 2,
                    order_id: ExchangeOrderId("tp2".to_string()),
                    fill_id: FillId("f3".to_string()),
                    qty: dec!(0.4),
                    price: dec!(51000),
                    event_seq: 1,
                },
                &cfg,
                &clock,
            )
            .unwrap();
            let actions = pos
                .apply_event(
                    ExchangeEvent::TpFill {
                        tp_index: 3,
                        order_id: ExchangeOrderId("tp3".to_string()),
                        fill_id: FillId("f4".to_string()),
                        qty: dec!(0.2),
                        price: dec!(52000),
                        event_seq: 1,
                    },
                    &cfg,
                    &clock,
                )
                .unwrap();
            black_box(actions);
        });
    });

    group.finish();
}

fn bench_duplicate_event_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("position_fsm");
    group.significance_level(0.01).sample_size(10_000);

    let clock = FakeClock::new();
    let cfg = config();
    let mut pos = pending_position(&clock);
    let event = ExchangeEvent::EntryFill {
        order_id: ExchangeOrderId("o1".to_string()),
        fill_id: FillId("f1".to_string()),
        qty: dec!(1.0),
        price: dec!(50000),
        event_seq: 1,
    };
    pos.apply_event(event.clone(), &cfg, &clock).unwrap();

    group.bench_function("duplicate_fill_noop", |b| {
        b.iter(|| {
            black_box(pos.apply_event(black_box(event.clone()), &cfg, &clock).unwrap());
        });
    });

    group.finish();
}

fn bench_operator_exit_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("position_fsm");
    group.significance_level(0.01).sample_size(10_000);

    let clock = FakeClock::new();
    let cfg = config();

    group.bench_function("exit_requested_to_exit_pending", |b| {
        b.iter(|| {
            let mut pos = pending_position(&clock);
            pos.apply_event(
                ExchangeEvent::EntryFill {
                    order_id: ExchangeOrderId("o1".to_string()),
                    fill_id: FillId("f1".to_string()),
                    qty: dec!(1.0),
                    price: dec!(50000),
                    event_seq: 1,
                },
                &cfg,
                &clock,
            )
            .unwrap();
            let actions = pos.apply_event(ExchangeEvent::ExitRequested, &cfg, &clock).unwrap();
            black_box(actions);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_entry_fill_finalises,
    bench_tp1_partial_with_break_even,
    bench_full_clean_lifecycle,
    bench_duplicate_event_replay,
    bench_operator_exit_request,
);

criterion_main!(benches);
