//! The run-plan builder: for one output, fuse the price forecast (or
//! schedule fallback), the daily budget with shortfall carry-over, and
//! every constraint gate into an ON/OFF decision per half-hour slot.
//!
//! Plans are pure functions of their inputs: building twice from the same
//! context yields byte-identical slots. Cross-output parent gating is a
//! separate post-pass applied in topological order by the control loop.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use ordered_float::OrderedFloat;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::clock::Clock;
use crate::domain::{
    slot_floor, AppOverride, DailyBudget, HealthVerdict, OperatingSchedule, OutputConfig,
    PlanDecision, PlanMode, PlanSlot, PricePoint, ReasonCode, RunPlan, UnhealthyAction,
    SLOT_MINUTES,
};

/// Everything the builder needs for one output. Assembled by the control
/// loop from the latest worker snapshots.
pub struct PlanContext<'a> {
    pub clock: &'a Clock,
    pub now: DateTime<Utc>,
    pub lookback: Duration,
    pub horizon: Duration,
    /// Price per slot over the whole horizon. The caller fills holes with
    /// fallback points, so missing slots mean "no price known at all".
    pub prices: &'a [PricePoint],
    pub schedule: Option<&'a OperatingSchedule>,
    pub constraint_schedule: Option<&'a OperatingSchedule>,
    /// Verdict of the linked UPS, if the output has one.
    pub ups_verdict: Option<HealthVerdict>,
    pub app_override: Option<AppOverride>,
    /// Latest fresh probe temperatures by probe name; a stale or missing
    /// probe is simply absent.
    pub probe_temps: &'a HashMap<String, f64>,
    /// Hours already accumulated today (A).
    pub today_on_hours: f64,
    /// Carried shortfall from prior days (S).
    pub shortfall_hours: f64,
}

/// Working state for one slot before decisions are finalised.
struct SlotDraft {
    start: DateTime<Utc>,
    price: Option<f64>,
    eligible: bool,
    reason: ReasonCode,
    /// Hard exclusions an app override cannot beat.
    date_off: bool,
    ups_off: bool,
    schedule_hit: bool,
    schedule_price: Option<f64>,
}

/// Build the plan for one output over `[now - lookback, now + horizon)`.
pub fn build_plan(output: &OutputConfig, ctx: &PlanContext<'_>) -> RunPlan {
    let first = slot_floor(ctx.now - ctx.lookback);
    let end = slot_floor(ctx.now) + ctx.horizon;
    let price_by_slot: HashMap<DateTime<Utc>, f64> = ctx
        .prices
        .iter()
        .map(|p| (slot_floor(p.start), p.per_kwh))
        .collect();

    let mut drafts = Vec::new();
    let mut slot = first;
    while slot < end {
        drafts.push(draft_slot(output, ctx, slot, price_by_slot.get(&slot).copied()));
        slot += Duration::minutes(SLOT_MINUTES);
    }

    select_slots(output, ctx, &mut drafts);
    apply_app_override(ctx, &mut drafts);

    let slots = drafts
        .into_iter()
        .map(|d| PlanSlot {
            start: d.start,
            end: d.start + Duration::minutes(SLOT_MINUTES),
            decision: if d.eligible && is_on_reason(d.reason) {
                PlanDecision::On
            } else {
                PlanDecision::Off
            },
            reason: d.reason,
            price: d.price,
        })
        .collect();

    RunPlan {
        output: output.name.clone(),
        built_at: ctx.now,
        slots,
    }
}

fn is_on_reason(reason: ReasonCode) -> bool {
    matches!(
        reason,
        ReasonCode::ScheduleHit
            | ReasonCode::PriceBelowCeiling
            | ReasonCode::Priority
            | ReasonCode::AppOverride
    )
}

/// Step 1 of the algorithm: the eligibility mask with its base reason.
fn draft_slot(
    output: &OutputConfig,
    ctx: &PlanContext<'_>,
    start: DateTime<Utc>,
    price: Option<f64>,
) -> SlotDraft {
    let local = ctx.clock.local(start);
    let local_date = local.date_naive();
    let daylight = ctx.clock.daylight(local_date);

    let mut draft = SlotDraft {
        start,
        price,
        eligible: true,
        reason: ReasonCode::NotSelected,
        date_off: false,
        ups_off: false,
        schedule_hit: false,
        schedule_price: None,
    };

    if let Some(s) = ctx.schedule {
        let (hit, window_price) = s.in_window(local.weekday(), local.time(), daylight);
        draft.schedule_hit = hit;
        draft.schedule_price = window_price;
    }

    if output.in_dates_off(local_date) {
        draft.eligible = false;
        draft.date_off = true;
        draft.reason = ReasonCode::DateOff;
        return draft;
    }

    if ctx.ups_verdict == Some(HealthVerdict::Unhealthy)
        && output
            .ups_link
            .as_ref()
            .is_some_and(|l| l.action == UnhealthyAction::TurnOff)
    {
        draft.eligible = false;
        draft.ups_off = true;
        draft.reason = ReasonCode::ConstrainedOff;
        return draft;
    }

    if let Some(c) = ctx.constraint_schedule {
        let (hit, _) = c.in_window(local.weekday(), local.time(), daylight);
        if !hit {
            draft.eligible = false;
            draft.reason = ReasonCode::ConstrainedOff;
            return draft;
        }
    }

    if output.mode == PlanMode::Schedule && !draft.schedule_hit {
        draft.eligible = false;
        draft.reason = ReasonCode::NotSelected;
        return draft;
    }

    // A stale probe reading is absent from the map and therefore unknown:
    // it does not fail the constraint on its own.
    for t in &output.temp_constraints {
        if t.violated_by(ctx.probe_temps.get(&t.probe).copied()) {
            draft.eligible = false;
            draft.reason = ReasonCode::ConstrainedOff;
            return draft;
        }
    }

    if let Some(ov) = ctx.app_override {
        let applies = ov.active(ctx.now) && ov.expires_at.map_or(true, |exp| start < exp);
        if applies && !ov.target_on {
            draft.eligible = false;
            draft.reason = ReasonCode::ForcedOff;
            return draft;
        }
    }

    draft
}

/// Steps 2-5: budget arithmetic and slot selection, per local day.
fn select_slots(output: &OutputConfig, ctx: &PlanContext<'_>, drafts: &mut [SlotDraft]) {
    let today = ctx.clock.local_date(ctx.now);
    let current_slot = slot_floor(ctx.now);

    // Group selectable (current and future, eligible) slot indices by the
    // local day they start in.
    let mut by_day: BTreeMap<NaiveDate, Vec<usize>> = BTreeMap::new();
    for (i, d) in drafts.iter().enumerate() {
        if d.start >= current_slot && d.eligible {
            by_day.entry(ctx.clock.local_date(d.start)).or_default().push(i);
        }
    }

    for (day, indices) in by_day {
        // Accumulated hours and shortfall only count against today.
        let (accumulated, shortfall) = if day == today {
            (ctx.today_on_hours, ctx.shortfall_hours)
        } else {
            (0.0, 0.0)
        };
        match output.mode {
            PlanMode::BestPrice => {
                select_best_price(output, drafts, &indices, day, accumulated, shortfall)
            }
            PlanMode::Schedule => select_schedule(output, drafts, &indices, accumulated),
        }
    }
}

fn select_best_price(
    output: &OutputConfig,
    drafts: &mut [SlotDraft],
    indices: &[usize],
    day: NaiveDate,
    accumulated: f64,
    shortfall: f64,
) {
    let budget = &output.budget;
    let ceilings = &output.ceilings;
    let month = day.month();

    // Sort eligible slots cheapest first; stable on (price, start). Slots
    // with no price at all sort last and are never auto-selected.
    let mut order: Vec<usize> = indices.to_vec();
    order.sort_by_key(|&i| {
        (
            OrderedFloat(drafts[i].price.unwrap_or(f64::INFINITY)),
            drafts[i].start,
        )
    });

    if budget.wants_all_eligible(month) {
        for &i in indices {
            if let Some(price) = drafts[i].price {
                if price <= ceilings.max_best_price {
                    drafts[i].reason = ReasonCode::PriceBelowCeiling;
                } else {
                    drafts[i].reason = ReasonCode::PriceAboveCeiling;
                }
            }
        }
        return;
    }

    let target = budget.target_for_month(month);
    let carried = shortfall.min(budget.max_shortfall_hours);
    let mut need = (target - accumulated).max(0.0) + carried;
    need = need.min(budget.max_hours - accumulated).max(0.0);
    let need_slots = (need * 2.0).ceil() as usize;

    let mut selected = 0usize;
    for &i in &order {
        if selected >= need_slots {
            break;
        }
        let Some(price) = drafts[i].price else { break };
        if price > ceilings.max_best_price {
            break;
        }
        drafts[i].reason = ReasonCode::PriceBelowCeiling;
        selected += 1;
    }

    // Priority lift: make up towards min_hours from slots under the
    // priority ceiling, cheapest first.
    let min_slots = (budget.min_hours * 2.0).ceil() as usize;
    let run_slots = (accumulated * 2.0).floor() as usize;
    for &i in &order {
        if run_slots + selected >= min_slots {
            break;
        }
        if is_on_reason(drafts[i].reason) {
            continue;
        }
        let Some(price) = drafts[i].price else { break };
        if price > ceilings.max_priority_price {
            break;
        }
        drafts[i].reason = if price <= ceilings.max_best_price {
            ReasonCode::PriceBelowCeiling
        } else {
            ReasonCode::Priority
        };
        selected += 1;
    }

    if run_slots + selected < min_slots {
        warn!(
            output = %output.name,
            %day,
            selected,
            min_slots,
            "not enough eligible slots under the priority ceiling to reach min hours"
        );
    }

    // Annotate the remainder.
    for &i in indices {
        if drafts[i].reason == ReasonCode::NotSelected {
            if let Some(price) = drafts[i].price {
                if price > ceilings.max_best_price {
                    drafts[i].reason = ReasonCode::PriceAboveCeiling;
                }
            }
        }
    }
}

fn select_schedule(
    output: &OutputConfig,
    drafts: &mut [SlotDraft],
    indices: &[usize],
    accumulated: f64,
) {
    let max_slots = (output.budget.max_hours * 2.0).floor() as usize;
    let run_slots = (accumulated * 2.0).floor() as usize;
    let mut selected = 0usize;
    for &i in indices {
        if drafts[i].schedule_hit {
            if run_slots + selected >= max_slots {
                break;
            }
            drafts[i].reason = ReasonCode::ScheduleHit;
            selected += 1;
        }
    }
}

/// Step 7: an active ON override forces its slots on regardless of
/// selection, except where a date exclusion or UPS turn-off stands.
fn apply_app_override(ctx: &PlanContext<'_>, drafts: &mut [SlotDraft]) {
    let Some(ov) = ctx.app_override else { return };
    if !ov.target_on || !ov.active(ctx.now) {
        return;
    }
    let current_slot = slot_floor(ctx.now);
    for d in drafts.iter_mut() {
        if d.start < current_slot {
            continue;
        }
        if let Some(exp) = ov.expires_at {
            if d.start >= exp {
                continue;
            }
        }
        if d.date_off || d.ups_off {
            continue;
        }
        d.eligible = true;
        d.reason = ReasonCode::AppOverride;
    }
}

/// Gate a child plan on its parent's: a child slot stays ON only where the
/// parent plan also has that slot ON.
pub fn apply_parent_gate(child: &mut RunPlan, parent: &RunPlan) {
    for slot in &mut child.slots {
        if slot.decision == PlanDecision::On && parent.decision_at(slot.start) != PlanDecision::On {
            slot.decision = PlanDecision::Off;
            slot.reason = ReasonCode::ParentGated;
        }
    }
}

/// Midnight rollover: yesterday's unmet target carries forward, bounded.
/// An all-eligible target resets the carry entirely.
pub fn roll_shortfall(
    budget: &DailyBudget,
    month: u32,
    yesterday_actual_hours: f64,
    old_shortfall: f64,
) -> f64 {
    let target = budget.target_for_month(month);
    if target == DailyBudget::ALL_ELIGIBLE {
        return 0.0;
    }
    (target - yesterday_actual_hours + old_shortfall)
        .clamp(0.0, budget.max_shortfall_hours)
}
