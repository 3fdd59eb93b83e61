//! Usage settlement against prepaid balance accounts.
//!
//! A turn settles exactly once: the ledger computes a billable amount from
//! the provider-reported token counts and performs the deduction as one
//! atomic conditional update **inside a transaction the caller supplies**.
//! If the caller's transaction rolls back — say, persisting the conversation
//! failed — the deduction rolls back with it, which is how "charge on
//! success, refund automatically on failure" works without a separate
//! compensating step.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};

// ---------------------------------------------------------------------------
// Billing rates
// ---------------------------------------------------------------------------

/// Power units charged per token consumption.
#[derive(Debug, Clone, Copy)]
pub struct BillingRates {
    /// Power units per 1000 prompt tokens (rounded up).
    pub prompt_per_1k: i64,
    /// Power units per 1000 completion tokens (rounded up).
    pub completion_per_1k: i64,
    /// Flat fee added to any turn that consumed tokens.
    pub per_turn_fee: i64,
}

impl Default for BillingRates {
    fn default() -> Self {
        Self {
            prompt_per_1k: 1,
            completion_per_1k: 2,
            per_turn_fee: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Settlement types
// ---------------------------------------------------------------------------

/// How a turn concluded, as recorded on its usage record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// The turn produced a final assistant message.
    Completed,
    /// The caller cancelled mid-turn.
    Cancelled,
    /// The turn failed with a hard error.
    Failed,
}

impl TurnStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> LedgerResult<Self> {
        match s {
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(LedgerError::InvalidArgument(format!(
                "unknown turn status `{other}`"
            ))),
        }
    }
}

/// The billing input for one concluded turn.
///
/// `source` is an explicit caller-supplied identifier for what consumed the
/// balance; `association_no` is the turn identity that makes settlement
/// idempotent against client retries.
#[derive(Debug, Clone)]
pub struct TurnSettlement {
    /// The account to charge.
    pub user_id: String,
    /// What consumed the balance (e.g. `"chat"`, an extension id).
    pub source: String,
    /// Caller-supplied turn identity (e.g. the request id).
    pub association_no: String,
    /// Provider-reported prompt tokens (zero when none were reported).
    pub prompt_tokens: u32,
    /// Provider-reported completion tokens.
    pub completion_tokens: u32,
    /// How the turn concluded.
    pub status: TurnStatus,
}

/// One committed row of the usage ledger.  Append-only; corrections are new
/// compensating records.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    /// Record id.
    pub id: String,
    /// The charged account.
    pub user_id: String,
    /// Power units deducted.
    pub amount: i64,
    /// Caller-supplied source identifier.
    pub source: String,
    /// The turn identity this record settles.
    pub association_no: String,
    /// Prompt tokens billed.
    pub prompt_tokens: u32,
    /// Completion tokens billed.
    pub completion_tokens: u32,
    /// How the turn concluded.
    pub status: TurnStatus,
    /// When the record was written.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Computes billable amounts and performs transactional settlement.
#[derive(Debug, Clone, Default)]
pub struct UsageLedger {
    rates: BillingRates,
}

impl UsageLedger {
    /// Create a ledger with the given rates.
    pub fn new(rates: BillingRates) -> Self {
        Self { rates }
    }

    /// Compute the billable amount for a settlement.
    ///
    /// A turn with zero reported tokens (a cancelled or failed turn the
    /// provider never counted) costs nothing.
    pub fn compute_amount(&self, settlement: &TurnSettlement) -> i64 {
        let total_tokens = settlement.prompt_tokens as i64 + settlement.completion_tokens as i64;
        if total_tokens == 0 {
            return 0;
        }

        let prompt = (settlement.prompt_tokens as i64 * self.rates.prompt_per_1k + 999) / 1000;
        let completion =
            (settlement.completion_tokens as i64 * self.rates.completion_per_1k + 999) / 1000;
        prompt + completion + self.rates.per_turn_fee
    }

    /// Settle one turn inside the caller's transaction.
    ///
    /// Idempotent per `association_no`: a record that already exists is
    /// returned unchanged with no further deduction.  The deduction itself
    /// is a single conditional update, so the balance check and decrement
    /// cannot race with a concurrent turn for the same user.
    pub fn settle(
        &self,
        tx: &Transaction<'_>,
        settlement: &TurnSettlement,
    ) -> LedgerResult<UsageRecord> {
        if settlement.user_id.is_empty() {
            return Err(LedgerError::InvalidArgument("empty user_id".into()));
        }
        if settlement.association_no.is_empty() {
            return Err(LedgerError::InvalidArgument("empty association_no".into()));
        }

        // Idempotency probe: this turn may already be settled.
        if let Some(existing) = Self::record_by_association(tx, &settlement.association_no)? {
            debug!(
                association_no = %settlement.association_no,
                "turn already settled, returning existing record"
            );
            return Ok(existing);
        }

        let amount = self.compute_amount(settlement);
        let now = Utc::now();

        if amount > 0 {
            // Atomic check-and-decrement: zero affected rows means the
            // account is missing or short.
            let updated = tx.execute(
                "UPDATE accounts SET power = power - ?1, updated_at = ?2
                 WHERE user_id = ?3 AND power >= ?1",
                params![amount, now.timestamp(), settlement.user_id],
            )?;

            if updated == 0 {
                let available: Option<i64> = tx
                    .query_row(
                        "SELECT power FROM accounts WHERE user_id = ?1",
                        params![settlement.user_id],
                        |row| row.get(0),
                    )
                    .optional()?;

                return match available {
                    None => Err(LedgerError::AccountNotFound {
                        user_id: settlement.user_id.clone(),
                    }),
                    Some(available) => Err(LedgerError::InsufficientBalance {
                        user_id: settlement.user_id.clone(),
                        required: amount,
                        available,
                    }),
                };
            }
        } else {
            // Nothing to deduct, but the record still needs a valid account.
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM accounts WHERE user_id = ?1",
                    params![settlement.user_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(LedgerError::AccountNotFound {
                    user_id: settlement.user_id.clone(),
                });
            }
        }

        let record = UsageRecord {
            id: Uuid::now_v7().to_string(),
            user_id: settlement.user_id.clone(),
            amount,
            source: settlement.source.clone(),
            association_no: settlement.association_no.clone(),
            prompt_tokens: settlement.prompt_tokens,
            completion_tokens: settlement.completion_tokens,
            status: settlement.status,
            created_at: now,
        };

        tx.execute(
            "INSERT INTO usage_records
             (id, user_id, amount, source, association_no, prompt_tokens, completion_tokens, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                record.user_id,
                record.amount,
                record.source,
                record.association_no,
                record.prompt_tokens,
                record.completion_tokens,
                record.status.as_str(),
                record.created_at.timestamp(),
            ],
        )?;

        info!(
            user = %record.user_id,
            amount = record.amount,
            association_no = %record.association_no,
            status = record.status.as_str(),
            "turn settled"
        );
        Ok(record)
    }

    /// Advisory balance pre-check.
    ///
    /// The balance can change between this check and the deduction; only
    /// [`settle`](Self::settle) is authoritative.  Useful for rejecting a
    /// request before any provider call is made.
    pub fn has_sufficient_power(
        &self,
        conn: &Connection,
        user_id: &str,
        estimate: i64,
    ) -> LedgerResult<bool> {
        Ok(Self::balance(conn, user_id)? >= estimate)
    }

    /// Current balance for an account.
    pub fn balance(conn: &Connection, user_id: &str) -> LedgerResult<i64> {
        conn.query_row(
            "SELECT power FROM accounts WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| LedgerError::AccountNotFound {
            user_id: user_id.to_owned(),
        })
    }

    /// Add power to an account, creating it if missing.  Returns the new
    /// balance.
    pub fn credit(conn: &Connection, user_id: &str, amount: i64) -> LedgerResult<i64> {
        if amount < 0 {
            return Err(LedgerError::InvalidArgument(
                "credit amount must be non-negative".into(),
            ));
        }

        conn.execute(
            "INSERT INTO accounts (user_id, power, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET power = power + ?2, updated_at = ?3",
            params![user_id, amount, Utc::now().timestamp()],
        )?;

        Self::balance(conn, user_id)
    }

    /// Usage records for one account, newest first.
    pub fn records_for_user(conn: &Connection, user_id: &str) -> LedgerResult<Vec<UsageRecord>> {
        let mut stmt = conn.prepare(
            "SELECT id, user_id, amount, source, association_no, prompt_tokens, completion_tokens, status, created_at
             FROM usage_records WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
        )?;

        let rows = stmt.query_map(params![user_id], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        // Status strings come from a CHECK-constrained column; re-validate
        // anyway so a hand-edited database fails loudly.
        records
            .into_iter()
            .map(|(record, status)| {
                Ok(UsageRecord {
                    status: TurnStatus::parse(&status)?,
                    ..record
                })
            })
            .collect()
    }

    /// Look up a settled record by turn identity.
    fn record_by_association(
        tx: &Transaction<'_>,
        association_no: &str,
    ) -> LedgerResult<Option<UsageRecord>> {
        let row = tx
            .query_row(
                "SELECT id, user_id, amount, source, association_no, prompt_tokens, completion_tokens, status, created_at
                 FROM usage_records WHERE association_no = ?1",
                params![association_no],
                row_to_record,
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((record, status)) => Ok(Some(UsageRecord {
                status: TurnStatus::parse(&status)?,
                ..record
            })),
        }
    }
}

/// Map a usage_records row; the status string is parsed by the caller.
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(UsageRecord, String)> {
    let created_at: i64 = row.get(8)?;
    Ok((
        UsageRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            amount: row.get(2)?,
            source: row.get(3)?,
            association_no: row.get(4)?,
            prompt_tokens: row.get(5)?,
            completion_tokens: row.get(6)?,
            status: TurnStatus::Completed,
            created_at: Utc
                .timestamp_opt(created_at, 0)
                .single()
                .unwrap_or(DateTime::UNIX_EPOCH),
        },
        row.get(7)?,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
