//! Budget service - allocations, expenses and transparency reports

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{Actor, Capability};
use crate::clock::Clock;
use crate::db::budget::{self, SpendBreakdown};
use crate::db::grievances;
use crate::db::models::{utilization, BudgetEntry, CategoryAggregate, Expense, Grievance, SystemBudget};
use crate::db::GrievanceDb;
use crate::error::GrievanceError;

use super::events::{EventBus, GrievanceEvent};

/// Longest expense description accepted
pub const MAX_EXPENSE_DESCRIPTION: usize = 500;

pub const DEFAULT_TREND_MONTHS: u32 = 6;
pub const MAX_TREND_MONTHS: u32 = 24;

// ============================================================================
// Inputs and views
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordExpenseInput {
    pub amount: f64,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemBudgetInput {
    pub fiscal_year: String,
    pub total_allocated: f64,
    #[serde(default)]
    pub salary_allocated: f64,
    #[serde(default)]
    pub operational_allocated: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalaryDisbursementInput {
    pub fiscal_year: String,
    pub amount: f64,
}

/// Budget entry with its derived warning fields
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetEntryView {
    #[serde(flatten)]
    pub entry: BudgetEntry,
    pub over_budget: bool,
    pub utilization_percent: f64,
}

impl From<BudgetEntry> for BudgetEntryView {
    fn from(entry: BudgetEntry) -> Self {
        Self {
            over_budget: entry.over_budget(),
            utilization_percent: entry.utilization_percent(),
            entry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseOutcome {
    pub expense: Expense,
    pub budget: BudgetEntryView,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SalaryView {
    pub allocated: f64,
    pub spent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationalView {
    pub allocated: f64,
    pub spent: f64,
    pub remaining: f64,
}

/// Public fiscal-year report
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemBudgetSummary {
    pub fiscal_year: String,
    pub total_allocated: f64,
    pub total_spent: f64,
    pub remaining_budget: f64,
    pub salary: SalaryView,
    pub operational: OperationalView,
    pub category_wise: Vec<CategoryAggregate>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetOverview {
    pub total_allocated: f64,
    pub total_spent: f64,
    pub remaining: f64,
    pub utilization_percent: f64,
    pub grievance_count: i64,
    pub over_budget_count: i64,
    pub by_category: Vec<SpendBreakdown>,
    pub by_status: Vec<SpendBreakdown>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlySpend {
    /// "YYYY-MM"
    pub month: String,
    pub spent: f64,
    pub expense_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetTrends {
    pub months: Vec<MonthlySpend>,
    pub total_spent: f64,
}

// ============================================================================
// Shared transaction steps
// ============================================================================

/// Set the allocation of a grievance's entry inside an open transaction.
///
/// Mutates `grievance.budget_allocated`; the caller persists the grievance.
pub(crate) fn allocate_in_tx(
    conn: &Connection,
    grievance: &mut Grievance,
    amount: f64,
    now: DateTime<Utc>,
) -> Result<BudgetEntry, GrievanceError> {
    validate_amount(amount, true)?;

    let entry = budget::ensure_entry(conn, &grievance.id, grievance.category, now)?;
    budget::set_allocation(conn, &grievance.id, amount, now)?;
    budget::recompute_category(conn, &entry.fiscal_year, entry.category)?;

    grievance.budget_allocated = amount;
    grievance.updated_at = now;

    budget::get_entry(conn, &grievance.id)?
        .ok_or_else(|| GrievanceError::Internal("budget entry vanished mid-transaction".into()))
}

fn validate_amount(amount: f64, allow_zero: bool) -> Result<(), GrievanceError> {
    let ok = amount.is_finite() && (amount > 0.0 || (allow_zero && amount == 0.0));
    if ok {
        Ok(())
    } else if allow_zero {
        Err(GrievanceError::InvalidInput(format!(
            "amount must be a non-negative number, got {}",
            amount
        )))
    } else {
        Err(GrievanceError::InvalidInput(format!(
            "amount must be greater than zero, got {}",
            amount
        )))
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct BudgetService {
    db: Arc<GrievanceDb>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl BudgetService {
    pub fn new(db: Arc<GrievanceDb>, events: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self { db, events, clock }
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Append an expense to a grievance's budget.
    ///
    /// Spending past the allocation is accepted and reported through
    /// `overBudget` on the returned entry.
    pub fn record_expense(
        &self,
        grievance_id: &str,
        input: RecordExpenseInput,
        actor: &Actor,
    ) -> Result<ExpenseOutcome, GrievanceError> {
        actor.require(Capability::RecordExpense)?;
        validate_amount(input.amount, false)?;
        let description = input.description.trim();
        if description.is_empty() || description.chars().count() > MAX_EXPENSE_DESCRIPTION {
            return Err(GrievanceError::InvalidInput(format!(
                "description must be 1..={} characters",
                MAX_EXPENSE_DESCRIPTION
            )));
        }

        let now = self.clock.now();
        let outcome = self.db.write(|tx| {
            let mut grievance = grievances::require_grievance(tx, grievance_id)?;
            let entry = budget::ensure_entry(tx, &grievance.id, grievance.category, now)?;
            let expense =
                budget::insert_expense(tx, &grievance.id, input.amount, description, &actor.id, now)?;
            // The entry may belong to an earlier year; the spend lands in this one
            budget::recompute_category(tx, &budget::fiscal_year_of(now.date_naive()), entry.category)?;

            grievance.budget_spent += input.amount;
            grievance.updated_at = now;
            grievances::update_grievance(tx, &grievance)?;

            let entry = budget::get_entry(tx, &grievance.id)?.ok_or_else(|| {
                GrievanceError::Internal("budget entry vanished mid-transaction".into())
            })?;
            Ok(ExpenseOutcome {
                expense,
                budget: entry.into(),
            })
        })?;

        self.events.emit(GrievanceEvent::ExpenseRecorded {
            grievance_id: grievance_id.to_string(),
            amount: input.amount,
            over_budget: outcome.budget.over_budget,
        });

        Ok(outcome)
    }

    /// Set the allocation for a grievance
    pub fn allocate(
        &self,
        grievance_id: &str,
        amount: f64,
        actor: &Actor,
        expected_version: Option<i64>,
    ) -> Result<BudgetEntryView, GrievanceError> {
        actor.require(Capability::AllocateBudget)?;

        let now = self.clock.now();
        let entry = self.db.write(|tx| {
            let mut grievance = grievances::require_grievance(tx, grievance_id)?;
            super::grievance_service::check_version(&grievance, expected_version)?;
            let entry = allocate_in_tx(tx, &mut grievance, amount, now)?;
            grievances::update_grievance(tx, &grievance)?;
            Ok(entry)
        })?;

        self.events.emit(GrievanceEvent::BudgetAllocated {
            grievance_id: grievance_id.to_string(),
            allocated: amount,
        });

        Ok(entry.into())
    }

    /// Create or replace the system budget of a fiscal year
    pub fn upsert_system_budget(
        &self,
        input: SystemBudgetInput,
        actor: &Actor,
    ) -> Result<SystemBudgetSummary, GrievanceError> {
        actor.require(Capability::ManageSystemBudget)?;
        budget::fiscal_year_bounds(&input.fiscal_year)?;
        validate_amount(input.total_allocated, true)?;
        validate_amount(input.salary_allocated, true)?;
        validate_amount(input.operational_allocated, true)?;
        if input.salary_allocated + input.operational_allocated > input.total_allocated {
            return Err(GrievanceError::InvalidInput(format!(
                "salary ({}) and operational ({}) allocations exceed the total ({})",
                input.salary_allocated, input.operational_allocated, input.total_allocated
            )));
        }

        let now = self.clock.now();
        let summary = self.db.write(|tx| {
            budget::upsert_system_budget(
                tx,
                &SystemBudget {
                    fiscal_year: input.fiscal_year.clone(),
                    total_allocated: input.total_allocated,
                    salary_allocated: input.salary_allocated,
                    salary_spent: 0.0,
                    operational_allocated: input.operational_allocated,
                    created_by: actor.id.clone(),
                    updated_at: now,
                },
            )?;
            summarize(tx, &input.fiscal_year)
        })?;

        self.events.emit(GrievanceEvent::SystemBudgetUpdated {
            fiscal_year: input.fiscal_year,
        });

        Ok(summary)
    }

    pub fn record_salary_disbursement(
        &self,
        input: SalaryDisbursementInput,
        actor: &Actor,
    ) -> Result<SystemBudgetSummary, GrievanceError> {
        actor.require(Capability::ManageSystemBudget)?;
        budget::fiscal_year_bounds(&input.fiscal_year)?;
        validate_amount(input.amount, false)?;

        let now = self.clock.now();
        let summary = self.db.write(|tx| {
            if !budget::add_salary_spent(tx, &input.fiscal_year, input.amount, now)? {
                return Err(GrievanceError::NotFound(format!(
                    "system budget {}",
                    input.fiscal_year
                )));
            }
            summarize(tx, &input.fiscal_year)
        })?;

        self.events.emit(GrievanceEvent::SalaryDisbursed {
            fiscal_year: input.fiscal_year,
            amount: input.amount,
        });

        Ok(summary)
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Budget entry of a grievance with its expense lines
    pub fn entry(&self, grievance_id: &str) -> Result<BudgetEntryView, GrievanceError> {
        let entry = self.db.with_conn(|conn| {
            grievances::require_grievance(conn, grievance_id)?;
            budget::get_entry(conn, grievance_id)
        })?;
        entry.map(Into::into).ok_or_else(|| {
            GrievanceError::NotFound(format!("no budget recorded for grievance {}", grievance_id))
        })
    }

    /// Summary for `fiscal_year`, or the fiscal year containing today
    pub fn system_summary(
        &self,
        fiscal_year: Option<&str>,
    ) -> Result<SystemBudgetSummary, GrievanceError> {
        let fiscal_year = match fiscal_year {
            Some(fy) => {
                budget::fiscal_year_bounds(fy)?;
                fy.to_string()
            }
            None => self.current_fiscal_year(),
        };
        debug!(fiscal_year = %fiscal_year, "Building system budget summary");

        self.db.with_conn(|conn| summarize(conn, &fiscal_year))
    }

    pub fn current_fiscal_year(&self) -> String {
        budget::fiscal_year_of(self.clock.now().date_naive())
    }

    pub fn overview(&self) -> Result<BudgetOverview, GrievanceError> {
        self.db.with_conn(|conn| {
            let totals = budget::entry_totals(conn)?;
            Ok(BudgetOverview {
                total_allocated: totals.allocated,
                total_spent: totals.spent,
                remaining: totals.allocated - totals.spent,
                utilization_percent: utilization(totals.allocated, totals.spent),
                grievance_count: totals.grievance_count,
                over_budget_count: totals.over_budget_count,
                by_category: budget::spend_by_category(conn)?,
                by_status: budget::spend_by_status(conn)?,
            })
        })
    }

    /// Spend per calendar month for the last `months` months, current month last
    pub fn trends(&self, months: Option<u32>) -> Result<BudgetTrends, GrievanceError> {
        let months = months.unwrap_or(DEFAULT_TREND_MONTHS);
        if !(1..=MAX_TREND_MONTHS).contains(&months) {
            return Err(GrievanceError::InvalidInput(format!(
                "months must be between 1 and {}",
                MAX_TREND_MONTHS
            )));
        }

        let labels = month_labels(self.clock.now(), months)?;
        let since = month_start(&labels[0])?;
        let recorded: HashMap<String, (f64, i64)> = self
            .db
            .with_conn(|conn| budget::monthly_spend(conn, since))?
            .into_iter()
            .map(|(month, spent, count)| (month, (spent, count)))
            .collect();

        let months: Vec<MonthlySpend> = labels
            .into_iter()
            .map(|month| {
                let (spent, expense_count) = recorded.get(&month).copied().unwrap_or((0.0, 0));
                MonthlySpend {
                    month,
                    spent,
                    expense_count,
                }
            })
            .collect();
        let total_spent = months.iter().map(|m| m.spent).sum();

        Ok(BudgetTrends {
            months,
            total_spent,
        })
    }
}

fn summarize(conn: &Connection, fiscal_year: &str) -> Result<SystemBudgetSummary, GrievanceError> {
    let system = budget::get_system_budget(conn, fiscal_year)?
        .ok_or_else(|| GrievanceError::NotFound(format!("system budget {}", fiscal_year)))?;
    let operational_spent = budget::fiscal_year_spent(conn, fiscal_year)?;
    let total_spent = system.salary_spent + operational_spent;

    Ok(SystemBudgetSummary {
        total_allocated: system.total_allocated,
        total_spent,
        remaining_budget: system.total_allocated - total_spent,
        salary: SalaryView {
            allocated: system.salary_allocated,
            spent: system.salary_spent,
        },
        operational: OperationalView {
            allocated: system.operational_allocated,
            spent: operational_spent,
            remaining: system.operational_allocated - operational_spent,
        },
        category_wise: budget::list_category_aggregates(conn, fiscal_year)?,
        updated_at: system.updated_at,
        fiscal_year: system.fiscal_year,
    })
}

/// "YYYY-MM" labels of the `count` months ending with the month of `now`
fn month_labels(now: DateTime<Utc>, count: u32) -> Result<Vec<String>, GrievanceError> {
    let current = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .ok_or_else(|| GrievanceError::Internal("invalid current month".into()))?;

    (0..count)
        .rev()
        .map(|back| {
            current
                .checked_sub_months(Months::new(back))
                .map(|d| d.format("%Y-%m").to_string())
                .ok_or_else(|| GrievanceError::Internal("month arithmetic overflow".into()))
        })
        .collect()
}

fn month_start(label: &str) -> Result<DateTime<Utc>, GrievanceError> {
    let date = NaiveDate::parse_from_str(&format!("{}-01", label), "%Y-%m-%d")
        .map_err(|e| GrievanceError::Internal(format!("bad month label {}: {}", label, e)))?;
    date.and_hms_opt(0, 0, 0)
        .map(|midnight| Utc.from_utc_datetime(&midnight))
        .ok_or_else(|| GrievanceError::Internal(format!("bad month label {}", label)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::parse_timestamp;

    #[test]
    fn test_month_labels_cross_year() {
        let now = parse_timestamp("2026-02-14T10:00:00.000Z").unwrap();
        assert_eq!(
            month_labels(now, 4).unwrap(),
            vec!["2025-11", "2025-12", "2026-01", "2026-02"]
        );
    }

    #[test]
    fn test_month_start() {
        assert_eq!(
            month_start("2025-11").unwrap(),
            parse_timestamp("2025-11-01T00:00:00.000Z").unwrap()
        );
    }

    #[test]
    fn test_validate_amount() {
        assert!(validate_amount(0.0, true).is_ok());
        assert!(validate_amount(0.0, false).is_err());
        assert!(validate_amount(-1.0, true).is_err());
        assert!(validate_amount(f64::NAN, true).is_err());
        assert!(validate_amount(f64::INFINITY, false).is_err());
    }
}
