use chrono::{DateTime, Duration, NaiveDate, Utc};
use leadwatch_core::time::{start_of_day, start_of_week};
use leadwatch_core::{FieldValue, LeadSnapshot, LeadStatus};
use std::collections::BTreeMap;

const OVERDUE_AFTER_HOURS: i64 = 12;
const MAX_OVERDUE_LINES: usize = 10;
const TOP_SELLERS: usize = 5;

/// Snapshot dashboard sent to admins every morning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub total: usize,
    pub active: usize,
    pub overdue: usize,
    pub created_today: usize,
    pub created_this_week: usize,
    /// Sellers by leads created this week, most first.
    pub top_sellers: Vec<(String, usize)>,
    pub overdue_leads: Vec<String>,
}

impl DailySummary {
    pub fn from_leads(leads: &[LeadSnapshot], now: DateTime<Utc>) -> Self {
        let today = start_of_day(now);
        let week = start_of_week(now);
        let mut summary = Self {
            date: now.date_naive(),
            total: leads.len(),
            active: 0,
            overdue: 0,
            created_today: 0,
            created_this_week: 0,
            top_sellers: Vec::new(),
            overdue_leads: Vec::new(),
        };
        let mut weekly_by_seller = BTreeMap::<String, usize>::new();

        for lead in leads {
            let closed = matches!(&lead.status, FieldValue::Value(status) if status.is_closed());
            if !closed {
                summary.active += 1;
            }

            let created = lead.created_at.value().copied();
            if lead.status == FieldValue::Value(LeadStatus::Call1Needed) {
                if let Some(created) = created {
                    if now - created > Duration::hours(OVERDUE_AFTER_HOURS) {
                        summary.overdue += 1;
                        if summary.overdue_leads.len() < MAX_OVERDUE_LINES {
                            summary.overdue_leads.push(format!(
                                "{} ({})",
                                lead.id,
                                lead.seller_name().unwrap_or("unassigned")
                            ));
                        }
                    }
                }
            }

            let Some(created) = created else { continue };
            if created >= today {
                summary.created_today += 1;
            }
            if created >= week {
                summary.created_this_week += 1;
                if let Some(seller) = lead.seller_name() {
                    *weekly_by_seller.entry(seller.to_string()).or_default() += 1;
                }
            }
        }

        let mut top = weekly_by_seller.into_iter().collect::<Vec<_>>();
        top.sort_by(|left, right| right.1.cmp(&left.1).then_with(|| left.0.cmp(&right.0)));
        summary.top_sellers = top;
        summary
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SellerPerformance {
    pub name: String,
    pub total: usize,
    pub converted: usize,
    pub conversion_rate: f64,
}

/// Funnel completion rates over every lead in the sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct WeeklySummary {
    pub week_start: NaiveDate,
    pub total: usize,
    pub call1_rate: f64,
    pub call2_rate: f64,
    pub call3_rate: f64,
    pub conversion_rate: f64,
    pub top_sellers: Vec<SellerPerformance>,
}

#[derive(Default)]
struct FunnelCounts {
    total: usize,
    call1: usize,
    call2: usize,
    call3: usize,
    converted: usize,
}

impl FunnelCounts {
    fn record(&mut self, status: Option<LeadStatus>) {
        self.total += 1;
        let Some(status) = status else { return };
        if matches!(
            status,
            LeadStatus::Call1Done | LeadStatus::Call2Done | LeadStatus::Call3Done | LeadStatus::Completed
        ) {
            self.call1 += 1;
        }
        if matches!(
            status,
            LeadStatus::Call2Done | LeadStatus::Call3Done | LeadStatus::Completed
        ) {
            self.call2 += 1;
        }
        if matches!(status, LeadStatus::Call3Done | LeadStatus::Completed) {
            self.call3 += 1;
        }
        if status == LeadStatus::Completed {
            self.converted += 1;
        }
    }
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

impl WeeklySummary {
    pub fn from_leads(leads: &[LeadSnapshot], now: DateTime<Utc>) -> Self {
        let mut overall = FunnelCounts::default();
        let mut by_seller = BTreeMap::<String, FunnelCounts>::new();

        for lead in leads {
            let status = lead.status.value().copied();
            overall.record(status);
            if let Some(seller) = lead.seller_name() {
                by_seller.entry(seller.to_string()).or_default().record(status);
            }
        }

        let mut top_sellers = by_seller
            .into_iter()
            .map(|(name, counts)| SellerPerformance {
                conversion_rate: percent(counts.converted, counts.total),
                name,
                total: counts.total,
                converted: counts.converted,
            })
            .collect::<Vec<_>>();
        top_sellers.sort_by(|left, right| {
            right
                .conversion_rate
                .total_cmp(&left.conversion_rate)
                .then_with(|| right.total.cmp(&left.total))
                .then_with(|| left.name.cmp(&right.name))
        });
        top_sellers.truncate(TOP_SELLERS);

        Self {
            week_start: start_of_week(now).date_naive(),
            total: overall.total,
            call1_rate: percent(overall.call1, overall.total),
            call2_rate: percent(overall.call2, overall.total),
            call3_rate: percent(overall.call3, overall.total),
            conversion_rate: percent(overall.converted, overall.total),
            top_sellers,
        }
    }
}
