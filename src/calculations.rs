// src/calculations.rs - Revenue and CLV rollups over validated orders
//
// Everything here is a pure function of (orders, now). The service layer owns
// fetching and caching.
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::models::{
    constants, ClvReport, ClvSummary, Customer, CustomerClv, CustomerMetrics, DailyRevenue, Order,
    PeriodComparison, RevenueOverview, Segment, SegmentCount, TopProduct,
};

/// Round half towards positive infinity, the way dashboards have always
/// displayed these numbers (`-50.5` becomes `-50`).
#[inline]
pub fn round_half_up(value: f64) -> f64 {
    (value + 0.5).floor()
}

/// Percentage change between two windows.
#[inline]
pub fn trend(current: f64, previous: f64) -> i64 {
    if previous == 0.0 {
        return if current > 0.0 { 100 } else { 0 };
    }
    round_half_up(((current - previous) / previous) * 100.0) as i64
}

pub struct RevenueCalculator;

impl RevenueCalculator {
    pub fn total_revenue(orders: &[Order]) -> f64 {
        orders.iter().map(|order| order.total_price).sum()
    }

    pub fn average_order_value(orders: &[Order]) -> f64 {
        if orders.is_empty() {
            return 0.0;
        }
        Self::total_revenue(orders) / orders.len() as f64
    }

    /// Orders in `[end - days, end)` where `end = now - days * periods_ago`.
    /// Orders without a timestamp never fall in any window.
    pub fn filter_period(
        orders: &[Order],
        days: u32,
        periods_ago: u32,
        now: DateTime<Utc>,
    ) -> Vec<Order> {
        let (start, end) = Self::period_bounds(days, periods_ago, now);

        orders
            .iter()
            .filter(|order| match order.created_at_utc() {
                Some(created) => created >= start && created < end,
                None => false,
            })
            .cloned()
            .collect()
    }

    pub fn period_bounds(
        days: u32,
        periods_ago: u32,
        now: DateTime<Utc>,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        let width = Duration::days(i64::from(days));
        let end = now - width * periods_ago as i32;
        (end - width, end)
    }

    /// Daily totals keyed by the calendar day in each order's own offset.
    /// An empty result is replaced by a zero series ending at `fill_end`.
    pub fn revenue_by_day(orders: &[Order], fill_end: NaiveDate) -> Vec<DailyRevenue> {
        let mut by_day: BTreeMap<NaiveDate, f64> = BTreeMap::new();

        for order in orders {
            let Some(created) = order.created_at else {
                continue;
            };
            *by_day.entry(created.date_naive()).or_insert(0.0) += order.total_price;
        }

        if by_day.is_empty() {
            return Self::zero_series(fill_end, constants::EMPTY_SERIES_DAYS);
        }

        by_day
            .into_iter()
            .map(|(date, revenue)| DailyRevenue { date, revenue })
            .collect()
    }

    pub fn zero_series(end: NaiveDate, days: i64) -> Vec<DailyRevenue> {
        (0..days)
            .rev()
            .map(|offset| DailyRevenue {
                date: end - Duration::days(offset),
                revenue: 0.0,
            })
            .collect()
    }

    pub fn compare_periods(current: &[Order], previous: &[Order]) -> PeriodComparison {
        PeriodComparison {
            revenue_trend: trend(
                Self::total_revenue(current),
                Self::total_revenue(previous),
            ),
            order_trend: trend(current.len() as f64, previous.len() as f64),
            aov_trend: trend(
                Self::average_order_value(current),
                Self::average_order_value(previous),
            ),
        }
    }

    pub fn top_products(orders: &[Order], limit: usize) -> Vec<TopProduct> {
        let mut products: HashMap<i64, TopProduct> = HashMap::new();

        for item in orders.iter().flat_map(|order| order.line_items.iter()) {
            let Some(product_id) = item.product_id else {
                continue;
            };
            let entry = products.entry(product_id).or_insert_with(|| TopProduct {
                id: product_id,
                title: item.title.clone(),
                units: 0,
                revenue: 0.0,
            });
            entry.units += item.quantity;
            entry.revenue += item.price.map_or(0.0, |price| price * item.quantity as f64);
        }

        let mut ranked: Vec<TopProduct> = products.into_values().collect();
        ranked.sort_by(|a, b| {
            b.revenue
                .partial_cmp(&a.revenue)
                .unwrap_or(Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        ranked.truncate(limit);
        ranked
    }

    /// Full overview for a `days` window. `orders` must cover two windows so
    /// the previous period can be compared.
    pub fn revenue_overview(
        orders: &[Order],
        days: u32,
        now: DateTime<Utc>,
        truncated: bool,
    ) -> RevenueOverview {
        let current = Self::filter_period(orders, days, 0, now);
        let previous = Self::filter_period(orders, days, 1, now);
        let (current_start, _) = Self::period_bounds(days, 0, now);

        RevenueOverview {
            days,
            total_revenue: Self::total_revenue(&current),
            average_order_value: Self::average_order_value(&current),
            order_count: current.len(),
            conversion_rate: None,
            top_products: Self::top_products(&current, constants::TOP_PRODUCTS_LIMIT),
            revenue_by_day: Self::revenue_by_day(&current, now.date_naive()),
            previous_period_revenue_by_day: Self::revenue_by_day(
                &previous,
                (current_start - Duration::seconds(1)).date_naive(),
            ),
            period_comparison: Self::compare_periods(&current, &previous),
            truncated,
        }
    }
}

pub struct ClvCalculator;

impl ClvCalculator {
    /// Group by customer id, preserving first-seen order. Guest orders are dropped.
    pub fn group_by_customer(orders: &[Order]) -> Vec<(Customer, Vec<&Order>)> {
        let mut index: HashMap<i64, usize> = HashMap::new();
        let mut groups: Vec<(Customer, Vec<&Order>)> = Vec::new();

        for order in orders {
            let Some(customer) = &order.customer else {
                continue;
            };
            match index.get(&customer.id) {
                Some(&slot) => groups[slot].1.push(order),
                None => {
                    index.insert(customer.id, groups.len());
                    groups.push((customer.clone(), vec![order]));
                }
            }
        }

        groups
    }

    fn days_between(now: DateTime<Utc>, then: DateTime<Utc>) -> i64 {
        let millis = (now - then).num_milliseconds() as f64;
        round_half_up(millis / 86_400_000.0) as i64
    }

    pub fn customer_metrics(orders: &[&Order], now: DateTime<Utc>) -> CustomerMetrics {
        if orders.is_empty() {
            return CustomerMetrics {
                total_spent: 0.0,
                order_count: 0,
                avg_order_value: 0.0,
                days_since_first_order: 0,
                days_since_last_order: 0,
                first_order_date: None,
                last_order_date: None,
            };
        }

        let total_spent: f64 = orders.iter().map(|order| order.total_price).sum();
        let order_count = orders.len();

        let mut first = None;
        let mut last = None;
        for created in orders.iter().filter_map(|order| order.created_at) {
            // Strict comparisons keep the earliest input on ties.
            if first.map_or(true, |current| created < current) {
                first = Some(created);
            }
            if last.map_or(true, |current| created > current) {
                last = Some(created);
            }
        }

        let days_since = |ts: Option<chrono::DateTime<chrono::FixedOffset>>| {
            ts.map_or(0, |ts| Self::days_between(now, ts.with_timezone(&Utc)))
        };

        CustomerMetrics {
            total_spent,
            order_count,
            avg_order_value: total_spent / order_count as f64,
            days_since_first_order: days_since(first),
            days_since_last_order: days_since(last),
            first_order_date: first,
            last_order_date: last,
        }
    }

    /// Heuristic RFM score:
    /// `aov * (orders / max(first_days / 30, 1)) * 24 * max(0, 100 - last_days) / 100`.
    pub fn predict_clv(metrics: &CustomerMetrics) -> i64 {
        let months_active =
            (metrics.days_since_first_order as f64 / constants::DAYS_PER_MONTH).max(1.0);
        let purchase_frequency = metrics.order_count as f64 / months_active;
        let retention_factor = (100.0 - metrics.days_since_last_order as f64).max(0.0) / 100.0;

        round_half_up(
            metrics.avg_order_value
                * purchase_frequency
                * constants::EXPECTED_LIFESPAN_MONTHS
                * retention_factor,
        ) as i64
    }

    /// First matching rule wins.
    pub fn assign_segment(
        order_count: usize,
        days_since_last_order: i64,
        total_spent: f64,
    ) -> Segment {
        if order_count == 1 {
            Segment::NewCustomer
        } else if days_since_last_order > 180 {
            Segment::AtRisk
        } else if days_since_last_order > 90 {
            Segment::NeedsAttention
        } else if total_spent > 1000.0 && order_count > 5 {
            Segment::Vip
        } else if order_count > 3 {
            Segment::Loyal
        } else {
            Segment::Promising
        }
    }

    /// Count per observed segment, busiest first; ties keep first-seen order.
    /// With no customers every segment is listed at zero.
    pub fn summarize_segments(customers: &[CustomerClv]) -> Vec<SegmentCount> {
        if customers.is_empty() {
            return Segment::ALL
                .iter()
                .map(|segment| SegmentCount {
                    name: *segment,
                    count: 0,
                })
                .collect();
        }

        let mut counts: Vec<SegmentCount> = Vec::new();
        for customer in customers {
            match counts.iter_mut().find(|c| c.name == customer.segment) {
                Some(entry) => entry.count += 1,
                None => counts.push(SegmentCount {
                    name: customer.segment,
                    count: 1,
                }),
            }
        }
        counts.sort_by(|a, b| b.count.cmp(&a.count));
        counts
    }

    pub fn average_clv(customers: &[CustomerClv]) -> f64 {
        if customers.is_empty() {
            return 0.0;
        }
        customers.iter().map(|c| c.predicted_clv as f64).sum::<f64>() / customers.len() as f64
    }

    fn score_customer(customer: &Customer, orders: &[&Order], now: DateTime<Utc>) -> CustomerClv {
        let metrics = Self::customer_metrics(orders, now);
        CustomerClv {
            customer_id: customer.id,
            customer_name: customer.display_name(),
            email: customer.email.clone(),
            total_spent: metrics.total_spent,
            order_count: metrics.order_count,
            avg_order_value: metrics.avg_order_value,
            days_since_first_order: metrics.days_since_first_order,
            days_since_last_order: metrics.days_since_last_order,
            last_order_date: metrics.last_order_date.map(|ts| ts.with_timezone(&Utc)),
            predicted_clv: Self::predict_clv(&metrics),
            segment: Self::assign_segment(
                metrics.order_count,
                metrics.days_since_last_order,
                metrics.total_spent,
            ),
        }
    }

    /// Whether `score_customers` fans out over rayon for these orders.
    pub fn scores_in_parallel(orders: &[Order], parallel_threshold: usize) -> bool {
        let customers: HashSet<i64> = orders
            .iter()
            .filter_map(|order| order.customer.as_ref().map(|c| c.id))
            .collect();
        customers.len() > parallel_threshold
    }

    /// Score every customer, highest predicted CLV first.
    pub fn score_customers(
        orders: &[Order],
        now: DateTime<Utc>,
        parallel_threshold: usize,
    ) -> Vec<CustomerClv> {
        let groups = Self::group_by_customer(orders);

        let mut scored: Vec<CustomerClv> = if groups.len() > parallel_threshold {
            groups
                .par_iter()
                .map(|(customer, orders)| Self::score_customer(customer, orders, now))
                .collect()
        } else {
            groups
                .iter()
                .map(|(customer, orders)| Self::score_customer(customer, orders, now))
                .collect()
        };

        // Stable: equal scores keep first-seen order.
        scored.sort_by(|a, b| b.predicted_clv.cmp(&a.predicted_clv));
        scored
    }

    /// Report for the dashboard. With `customer_filter` only that customer is
    /// listed; the summary still covers every scored customer.
    pub fn clv_report(
        scored: &[CustomerClv],
        customer_filter: Option<i64>,
        truncated: bool,
    ) -> ClvReport {
        let customers = match customer_filter {
            Some(id) => scored
                .iter()
                .filter(|c| c.customer_id == id)
                .cloned()
                .collect(),
            None => scored.to_vec(),
        };

        ClvReport {
            customers,
            summary: ClvSummary {
                average_clv: Self::average_clv(scored),
                top_segments: Self::summarize_segments(scored),
            },
            truncated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LineItem;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    fn order(id: i64, price: f64, days_ago: i64, customer: Option<i64>) -> Order {
        Order {
            id,
            created_at: Some((now() - Duration::days(days_ago)).fixed_offset()),
            total_price: price,
            customer: customer.map(|id| Customer {
                id,
                first_name: Some("Ada".to_string()),
                last_name: Some("Lovelace".to_string()),
                email: Some(format!("c{}@example.com", id)),
            }),
            line_items: Vec::new(),
        }
    }

    fn metrics(count: usize, aov: f64, first: i64, last: i64) -> CustomerMetrics {
        CustomerMetrics {
            total_spent: aov * count as f64,
            order_count: count,
            avg_order_value: aov,
            days_since_first_order: first,
            days_since_last_order: last,
            first_order_date: None,
            last_order_date: None,
        }
    }

    #[test]
    fn test_trend_reference_values() {
        assert_eq!(trend(0.0, 0.0), 0);
        assert_eq!(trend(50.0, 0.0), 100);
        assert_eq!(trend(150.0, 100.0), 50);
        assert_eq!(trend(50.0, 100.0), -50);
        assert_eq!(trend(0.0, 100.0), -100);
    }

    #[test]
    fn test_average_order_value_of_nothing_is_zero() {
        assert_eq!(RevenueCalculator::average_order_value(&[]), 0.0);
        assert_eq!(RevenueCalculator::total_revenue(&[]), 0.0);
    }

    #[test]
    fn test_empty_revenue_series_is_thirty_zero_days() {
        let today = now().date_naive();
        let series = RevenueCalculator::revenue_by_day(&[], today);

        assert_eq!(series.len(), 30);
        assert!(series.iter().all(|day| day.revenue == 0.0));
        assert_eq!(series.last().unwrap().date, today);
        assert_eq!(series[0].date, today - Duration::days(29));
        for pair in series.windows(2) {
            assert_eq!(pair[1].date - pair[0].date, Duration::days(1));
        }
    }

    #[test]
    fn test_undated_orders_fall_back_to_zero_series() {
        let mut undated = order(1, 40.0, 0, None);
        undated.created_at = None;

        let series = RevenueCalculator::revenue_by_day(&[undated], now().date_naive());
        assert_eq!(series.len(), 30);
        assert!(series.iter().all(|day| day.revenue == 0.0));
    }

    #[test]
    fn test_revenue_grouped_by_day_sorted() {
        let orders = vec![
            order(1, 10.0, 2, None),
            order(2, 15.0, 5, None),
            order(3, 5.0, 2, None),
        ];
        let series = RevenueCalculator::revenue_by_day(&orders, now().date_naive());

        assert_eq!(series.len(), 2);
        assert!(series[0].date < series[1].date);
        assert_eq!(series[0].revenue, 15.0);
        assert_eq!(series[1].revenue, 15.0);
    }

    #[test]
    fn test_periods_do_not_overlap() {
        let orders = vec![
            order(1, 100.0, 1, None),
            order(2, 100.0, 10, None),
            order(3, 50.0, 12, None),
            order(4, 70.0, 25, None),
        ];

        let current = RevenueCalculator::filter_period(&orders, 10, 0, now());
        let previous = RevenueCalculator::filter_period(&orders, 10, 1, now());

        // Exactly ten days old is the inclusive start of the current window.
        assert_eq!(current.iter().map(|o| o.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(previous.iter().map(|o| o.id).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_top_products_ranked_and_capped() {
        let mut orders = Vec::new();
        for id in 1..=7 {
            let mut o = order(id, 10.0, 1, None);
            o.line_items.push(LineItem {
                product_id: Some(id),
                title: format!("Product {}", id),
                quantity: 2,
                price: Some(id as f64),
            });
            orders.push(o);
        }
        orders[0].line_items.push(LineItem {
            product_id: Some(1),
            title: "Product 1".to_string(),
            quantity: 1,
            price: Some(1.0),
        });
        orders[1].line_items.push(LineItem {
            product_id: None,
            title: "Gift card".to_string(),
            quantity: 1,
            price: Some(500.0),
        });

        let top = RevenueCalculator::top_products(&orders, 5);
        assert_eq!(top.len(), 5);
        assert_eq!(top[0].id, 7);
        assert_eq!(top[0].revenue, 14.0);
        assert!(top.iter().all(|p| p.id != 1));
        assert!(top.windows(2).all(|w| w[0].revenue >= w[1].revenue));
    }

    #[test]
    fn test_overview_compares_with_previous_window() {
        let orders = vec![
            order(1, 150.0, 3, None),
            order(2, 100.0, 40, None),
        ];
        let overview = RevenueCalculator::revenue_overview(&orders, 30, now(), false);

        assert_eq!(overview.order_count, 1);
        assert_eq!(overview.total_revenue, 150.0);
        assert_eq!(overview.period_comparison.revenue_trend, 50);
        assert_eq!(overview.period_comparison.order_trend, 0);
        assert_eq!(overview.conversion_rate, None);
        assert_eq!(overview.previous_period_revenue_by_day.len(), 1);
    }

    #[test]
    fn test_predicted_clv_reference_value() {
        assert_eq!(ClvCalculator::predict_clv(&metrics(4, 100.0, 60, 10)), 4320);
    }

    #[test]
    fn test_predicted_clv_lapsed_customer_is_zero() {
        assert_eq!(ClvCalculator::predict_clv(&metrics(3, 80.0, 300, 150)), 0);
    }

    #[test]
    fn test_segment_priority() {
        assert_eq!(ClvCalculator::assign_segment(1, 5, 5000.0), Segment::NewCustomer);
        assert_eq!(ClvCalculator::assign_segment(1, 400, 10.0), Segment::NewCustomer);
        assert_eq!(ClvCalculator::assign_segment(8, 181, 5000.0), Segment::AtRisk);
        assert_eq!(ClvCalculator::assign_segment(8, 91, 5000.0), Segment::NeedsAttention);
        assert_eq!(ClvCalculator::assign_segment(6, 10, 1000.01), Segment::Vip);
        assert_eq!(ClvCalculator::assign_segment(6, 10, 1000.0), Segment::Loyal);
        assert_eq!(ClvCalculator::assign_segment(4, 10, 50.0), Segment::Loyal);
        assert_eq!(ClvCalculator::assign_segment(3, 10, 50.0), Segment::Promising);
    }

    #[test]
    fn test_three_order_customer_scenario() {
        let orders = vec![
            order(1, 100.0, 100, Some(7)),
            order(2, 200.0, 50, Some(7)),
            order(3, 300.0, 5, Some(7)),
        ];
        let groups = ClvCalculator::group_by_customer(&orders);
        assert_eq!(groups.len(), 1);

        let m = ClvCalculator::customer_metrics(&groups[0].1, now());
        assert_eq!(m.total_spent, 600.0);
        assert_eq!(m.order_count, 3);
        assert_eq!(m.avg_order_value, 200.0);
        assert_eq!(m.days_since_first_order, 100);
        assert_eq!(m.days_since_last_order, 5);
        assert_eq!(
            ClvCalculator::assign_segment(m.order_count, m.days_since_last_order, m.total_spent),
            Segment::Promising
        );
    }

    #[test]
    fn test_guest_orders_are_ignored() {
        let orders = vec![order(1, 10.0, 1, None), order(2, 20.0, 2, Some(3))];
        let scored = ClvCalculator::score_customers(&orders, now(), 1_000);
        assert_eq!(scored.len(), 1);
        assert_eq!(scored[0].customer_id, 3);
        assert_eq!(scored[0].customer_name.as_deref(), Some("Ada Lovelace"));
    }

    #[test]
    fn test_scores_sorted_descending_in_both_modes() {
        let orders = vec![
            order(1, 10.0, 40, Some(1)),
            order(2, 500.0, 3, Some(2)),
            order(3, 500.0, 20, Some(2)),
            order(4, 90.0, 2, Some(3)),
        ];
        let sequential = ClvCalculator::score_customers(&orders, now(), 1_000);
        let parallel = ClvCalculator::score_customers(&orders, now(), 0);

        assert_eq!(sequential, parallel);
        assert_eq!(sequential[0].customer_id, 2);
        assert!(sequential
            .windows(2)
            .all(|w| w[0].predicted_clv >= w[1].predicted_clv));
    }

    #[test]
    fn test_empty_summary_lists_every_segment() {
        let report = ClvCalculator::clv_report(&[], None, false);
        assert!(report.customers.is_empty());
        assert_eq!(report.summary.average_clv, 0.0);
        assert_eq!(report.summary.top_segments.len(), 6);
        assert!(report.summary.top_segments.iter().all(|s| s.count == 0));
    }

    #[test]
    fn test_summary_lists_only_observed_segments() {
        let orders = vec![
            order(1, 10.0, 4, Some(1)),
            order(2, 20.0, 200, Some(2)),
            order(3, 20.0, 190, Some(2)),
            order(4, 30.0, 2, Some(3)),
        ];
        let scored = ClvCalculator::score_customers(&orders, now(), 1_000);
        let report = ClvCalculator::clv_report(&scored, None, false);

        let summary: Vec<(Segment, usize)> = report
            .summary
            .top_segments
            .iter()
            .map(|s| (s.name, s.count))
            .collect();
        assert_eq!(
            summary,
            vec![(Segment::NewCustomer, 2), (Segment::AtRisk, 1)]
        );

        let single = ClvCalculator::score_customers(&orders[..1], now(), 1_000);
        let report = ClvCalculator::clv_report(&single, None, false);
        assert_eq!(report.summary.top_segments.len(), 1);
        assert_eq!(report.summary.top_segments[0].name, Segment::NewCustomer);
    }

    #[test]
    fn test_report_filter_keeps_summary() {
        let orders = vec![order(1, 10.0, 4, Some(1)), order(2, 30.0, 2, Some(2))];
        let scored = ClvCalculator::score_customers(&orders, now(), 1_000);
        let report = ClvCalculator::clv_report(&scored, Some(2), false);

        assert_eq!(report.customers.len(), 1);
        assert_eq!(report.customers[0].customer_id, 2);
        assert_eq!(
            report
                .summary
                .top_segments
                .iter()
                .find(|s| s.name == Segment::NewCustomer)
                .map(|s| s.count),
            Some(2)
        );
    }

    proptest! {
        #[test]
        fn prop_total_revenue_is_sum_of_prices(prices in proptest::collection::vec(0.0f64..10_000.0, 0..50)) {
            let orders: Vec<Order> = prices
                .iter()
                .enumerate()
                .map(|(i, p)| order(i as i64, *p, 1, None))
                .collect();
            let expected: f64 = prices.iter().sum();
            prop_assert!((RevenueCalculator::total_revenue(&orders) - expected).abs() < 1e-6);
        }

        #[test]
        fn prop_trend_sign_follows_direction(current in 0.0f64..1e6, previous in 0.01f64..1e6) {
            let t = trend(current, previous);
            if current > previous * 1.01 {
                prop_assert!(t >= 0);
            }
            if current < previous * 0.99 {
                prop_assert!(t <= 0);
            }
        }
    }

    #[test]
    fn test_parallel_scoring_counts_customers_not_orders() {
        // Many orders from two customers plus guests stay sequential.
        let mut orders: Vec<Order> = (0..40).map(|i| order(i, 10.0, 5, Some(1 + i % 2))).collect();
        orders.extend((100..120).map(|i| order(i, 10.0, 5, None)));
        assert!(!ClvCalculator::scores_in_parallel(&orders, 2));
        assert!(ClvCalculator::scores_in_parallel(&orders, 1));

        let sequential = ClvCalculator::score_customers(&orders, now(), 2);
        let parallel = ClvCalculator::score_customers(&orders, now(), 1);
        assert_eq!(sequential.len(), 2);
        assert_eq!(sequential, parallel);
    }
}
