//! Durable [`State`] on SQLite.
//!
//! Every call runs on the blocking pool against one shared connection. A batch of [`Change`]s is
//! written inside a single `BEGIN IMMEDIATE` transaction, so the compare-and-swap checks and the
//! writes they guard cannot interleave with another commit. Uniqueness of external references
//! and checkout references is enforced by indexes, not by lookups.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveTime, SecondsFormat, Utc, Weekday};
use rusqlite::{
    params, params_from_iter, types::Type, Connection, ErrorCode, OptionalExtension, Row,
    TransactionBehavior,
};
use spinwallet_execution::{Change, CommitError, State, TransactionFilter};
use spinwallet_types::{
    ActivationWindow, AlgorithmConfiguration, PaymentRequest, PaymentStatus, Transaction,
    TransactionKind, UserId, Wallet, WalletId,
};
use std::{
    path::Path,
    str::FromStr,
    sync::{Arc, Mutex},
};
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     CREATE TABLE IF NOT EXISTS wallets (
         id TEXT PRIMARY KEY,
         user_id INTEGER NOT NULL UNIQUE,
         balance TEXT NOT NULL,
         total_deposits TEXT NOT NULL,
         total_winnings TEXT NOT NULL,
         total_losses TEXT NOT NULL,
         version INTEGER NOT NULL,
         created_at TEXT NOT NULL,
         updated_at TEXT NOT NULL
     );
     CREATE TABLE IF NOT EXISTS transactions (
         seq INTEGER PRIMARY KEY AUTOINCREMENT,
         id TEXT NOT NULL UNIQUE,
         wallet_id TEXT NOT NULL REFERENCES wallets(id),
         kind TEXT NOT NULL,
         amount TEXT NOT NULL,
         source TEXT NOT NULL,
         external_reference TEXT,
         notes TEXT NOT NULL,
         created_at TEXT NOT NULL
     );
     CREATE INDEX IF NOT EXISTS transactions_wallet ON transactions(wallet_id, seq);
     CREATE UNIQUE INDEX IF NOT EXISTS transactions_reference
         ON transactions(wallet_id, external_reference, kind)
         WHERE external_reference IS NOT NULL;
     CREATE TABLE IF NOT EXISTS payments (
         id TEXT PRIMARY KEY,
         user_id INTEGER NOT NULL,
         amount TEXT NOT NULL,
         phone TEXT NOT NULL,
         checkout_reference TEXT UNIQUE,
         status TEXT NOT NULL,
         initiated_at TEXT NOT NULL,
         completed_at TEXT,
         error_message TEXT
     );
     CREATE INDEX IF NOT EXISTS payments_status ON payments(status, initiated_at);
     CREATE TABLE IF NOT EXISTS algorithm_configurations (
         name TEXT PRIMARY KEY,
         key TEXT NOT NULL,
         is_active INTEGER NOT NULL DEFAULT 0,
         start_time TEXT,
         end_time TEXT,
         days_of_week TEXT NOT NULL DEFAULT '',
         description TEXT NOT NULL DEFAULT '',
         activated_at TEXT,
         created_at TEXT NOT NULL
     );
     CREATE UNIQUE INDEX IF NOT EXISTS algorithm_configurations_active
         ON algorithm_configurations(is_active) WHERE is_active = 1;";

const WALLET_COLUMNS: &str = "id, user_id, balance, total_deposits, total_winnings, total_losses, \
     version, created_at, updated_at";
const TRANSACTION_COLUMNS: &str =
    "id, wallet_id, kind, amount, source, external_reference, notes, created_at";
const PAYMENT_COLUMNS: &str = "id, user_id, amount, phone, checkout_reference, status, \
     initiated_at, completed_at, error_message";
const CONFIGURATION_COLUMNS: &str =
    "name, key, is_active, start_time, end_time, days_of_week, description, activated_at, created_at";

/// Fixed-width UTC timestamps so that text order is time order.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn time_of_day(time: &NaiveTime) -> String {
    time.format("%H:%M:%S").to_string()
}

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn parsed_opt<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        raw.parse().map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
        })
    })
    .transpose()
}

fn weekdays(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<Weekday>> {
    let raw: String = row.get(idx)?;
    raw.split(',')
        .filter(|day| !day.is_empty())
        .map(|day| {
            day.parse::<Weekday>().map_err(|_| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    Type::Text,
                    format!("invalid weekday {day}").into(),
                )
            })
        })
        .collect()
}

fn wallet_from_row(row: &Row<'_>) -> rusqlite::Result<Wallet> {
    Ok(Wallet {
        id: parsed(row, 0)?,
        user: UserId(row.get(1)?),
        balance: parsed(row, 2)?,
        total_deposits: parsed(row, 3)?,
        total_winnings: parsed(row, 4)?,
        total_losses: parsed(row, 5)?,
        version: row.get(6)?,
        created_at: parsed(row, 7)?,
        updated_at: parsed(row, 8)?,
    })
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: parsed(row, 0)?,
        wallet_id: parsed(row, 1)?,
        kind: parsed(row, 2)?,
        amount: parsed(row, 3)?,
        source: row.get(4)?,
        external_reference: row.get(5)?,
        notes: row.get(6)?,
        created_at: parsed(row, 7)?,
    })
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<PaymentRequest> {
    Ok(PaymentRequest {
        id: parsed(row, 0)?,
        user: UserId(row.get(1)?),
        amount: parsed(row, 2)?,
        phone: row.get(3)?,
        checkout_reference: row.get(4)?,
        status: parsed(row, 5)?,
        initiated_at: parsed(row, 6)?,
        completed_at: parsed_opt(row, 7)?,
        error_message: row.get(8)?,
    })
}

fn configuration_from_row(row: &Row<'_>) -> rusqlite::Result<AlgorithmConfiguration> {
    Ok(AlgorithmConfiguration {
        name: row.get(0)?,
        key: row.get(1)?,
        is_active: row.get(2)?,
        window: ActivationWindow {
            start_time: parsed_opt(row, 3)?,
            end_time: parsed_opt(row, 4)?,
            days_of_week: weekdays(row, 5)?,
        },
        description: row.get(6)?,
        activated_at: parsed_opt(row, 7)?,
        created_at: parsed(row, 8)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

fn storage(err: rusqlite::Error) -> CommitError {
    CommitError::Storage(err.into())
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA).context("init wallet schema")?;
    Ok(())
}

/// SQLite-backed [`State`].
#[derive(Clone)]
pub struct SqliteState {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteState {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open wallet database {}", path.display()))?;
        init_schema(&conn)?;
        debug!(path = %path.display(), "wallet database ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, E, F>(&self, f: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<anyhow::Error> + Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, E> + Send + 'static,
    {
        let conn = self.conn.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        });
        match handle.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!("sqlite task failed: {err}").into()),
        }
    }
}

fn stage(tx: &rusqlite::Transaction<'_>, change: Change) -> Result<(), CommitError> {
    match change {
        Change::Wallet {
            wallet,
            expected_version,
        } => {
            let stale = || CommitError::StaleWallet {
                user: wallet.user,
                expected: expected_version,
            };
            match expected_version {
                None => {
                    let inserted = tx.execute(
                        "INSERT INTO wallets (id, user_id, balance, total_deposits, total_winnings, total_losses, version, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        params![
                            wallet.id.to_string(),
                            wallet.user.0,
                            wallet.balance.to_string(),
                            wallet.total_deposits.to_string(),
                            wallet.total_winnings.to_string(),
                            wallet.total_losses.to_string(),
                            wallet.version,
                            timestamp(&wallet.created_at),
                            timestamp(&wallet.updated_at),
                        ],
                    );
                    match inserted {
                        Ok(_) => {}
                        Err(err) if is_unique_violation(&err) => return Err(stale()),
                        Err(err) => return Err(storage(err)),
                    }
                }
                Some(version) => {
                    let updated = tx
                        .execute(
                            "UPDATE wallets SET balance = ?1, total_deposits = ?2, total_winnings = ?3,
                             total_losses = ?4, version = ?5, updated_at = ?6
                             WHERE user_id = ?7 AND version = ?8",
                            params![
                                wallet.balance.to_string(),
                                wallet.total_deposits.to_string(),
                                wallet.total_winnings.to_string(),
                                wallet.total_losses.to_string(),
                                wallet.version,
                                timestamp(&wallet.updated_at),
                                wallet.user.0,
                                version,
                            ],
                        )
                        .map_err(storage)?;
                    if updated == 0 {
                        return Err(stale());
                    }
                }
            }
        }
        Change::Transaction(transaction) => {
            let inserted = tx.execute(
                "INSERT INTO transactions (id, wallet_id, kind, amount, source, external_reference, notes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    transaction.id.to_string(),
                    transaction.wallet_id.to_string(),
                    transaction.kind.as_str(),
                    transaction.amount.to_string(),
                    transaction.source,
                    transaction.external_reference,
                    transaction.notes,
                    timestamp(&transaction.created_at),
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(err) if is_unique_violation(&err) => {
                    return Err(CommitError::Duplicate {
                        wallet_id: transaction.wallet_id,
                        reference: transaction.external_reference.unwrap_or_default(),
                        kind: transaction.kind,
                    })
                }
                Err(err) => return Err(storage(err)),
            }
        }
        Change::Payment {
            payment,
            expected_status,
        } => {
            let stored: Option<String> = tx
                .query_row(
                    "SELECT status FROM payments WHERE id = ?1",
                    params![payment.id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage)?;
            if stored.as_deref() != expected_status.map(|status| status.as_str()) {
                return Err(CommitError::StalePayment { id: payment.id });
            }
            let written = tx.execute(
                "INSERT INTO payments (id, user_id, amount, phone, checkout_reference, status, initiated_at, completed_at, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                     checkout_reference = excluded.checkout_reference,
                     status = excluded.status,
                     completed_at = excluded.completed_at,
                     error_message = excluded.error_message",
                params![
                    payment.id.to_string(),
                    payment.user.0,
                    payment.amount.to_string(),
                    payment.phone,
                    payment.checkout_reference,
                    payment.status.as_str(),
                    timestamp(&payment.initiated_at),
                    payment.completed_at.as_ref().map(timestamp),
                    payment.error_message,
                ],
            );
            match written {
                Ok(_) => {}
                Err(err) if is_unique_violation(&err) => {
                    return Err(CommitError::DuplicateCheckout {
                        reference: payment.checkout_reference.unwrap_or_default(),
                    })
                }
                Err(err) => return Err(storage(err)),
            }
        }
        Change::Configuration(configuration) => {
            let days = configuration
                .window
                .days_of_week
                .iter()
                .map(|day| day.to_string())
                .collect::<Vec<_>>()
                .join(",");
            tx.execute(
                "INSERT INTO algorithm_configurations (name, key, is_active, start_time, end_time, days_of_week, description, activated_at, created_at)
                 VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6, NULL, ?7)
                 ON CONFLICT(name) DO UPDATE SET
                     key = excluded.key,
                     start_time = excluded.start_time,
                     end_time = excluded.end_time,
                     days_of_week = excluded.days_of_week,
                     description = excluded.description",
                params![
                    configuration.name,
                    configuration.key,
                    configuration.window.start_time.as_ref().map(time_of_day),
                    configuration.window.end_time.as_ref().map(time_of_day),
                    days,
                    configuration.description,
                    timestamp(&configuration.created_at),
                ],
            )
            .map_err(storage)?;
        }
        Change::Activate { name, at } => {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM algorithm_configurations WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage)?;
            if exists.is_none() {
                return Err(CommitError::MissingConfiguration { name });
            }
            tx.execute(
                "UPDATE algorithm_configurations SET is_active = 0 WHERE is_active = 1",
                [],
            )
            .map_err(storage)?;
            tx.execute(
                "UPDATE algorithm_configurations SET is_active = 1, activated_at = ?1 WHERE name = ?2",
                params![timestamp(&at), name],
            )
            .map_err(storage)?;
        }
        Change::DeactivateAll => {
            tx.execute(
                "UPDATE algorithm_configurations SET is_active = 0 WHERE is_active = 1",
                [],
            )
            .map_err(storage)?;
        }
    }
    Ok(())
}

impl State for SqliteState {
    async fn wallet(&self, user: UserId) -> Result<Option<Wallet>> {
        self.blocking(move |conn| {
            let sql = format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE user_id = ?1");
            conn.query_row(&sql, params![user.0], wallet_from_row)
                .optional()
                .context("load wallet")
        })
        .await
    }

    async fn transactions(
        &self,
        wallet_id: WalletId,
        filter: TransactionFilter,
    ) -> Result<Vec<Transaction>> {
        self.blocking(move |conn| {
            let sql = format!(
                "SELECT {TRANSACTION_COLUMNS} FROM transactions
                 WHERE wallet_id = ?1 AND (?2 IS NULL OR kind = ?2)
                 ORDER BY seq DESC LIMIT ?3"
            );
            // A negative limit is unbounded.
            let limit = filter
                .limit
                .map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX));
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![
                    wallet_id.to_string(),
                    filter.kind.map(|kind| kind.as_str()),
                    limit
                ],
                transaction_from_row,
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("load transactions")
        })
        .await
    }

    async fn transaction_by_reference(
        &self,
        wallet_id: WalletId,
        reference: &str,
        kind: TransactionKind,
    ) -> Result<Option<Transaction>> {
        let reference = reference.to_string();
        self.blocking(move |conn| {
            let sql = format!(
                "SELECT {TRANSACTION_COLUMNS} FROM transactions
                 WHERE wallet_id = ?1 AND external_reference = ?2 AND kind = ?3"
            );
            conn.query_row(
                &sql,
                params![wallet_id.to_string(), reference, kind.as_str()],
                transaction_from_row,
            )
            .optional()
            .context("load transaction by reference")
        })
        .await
    }

    async fn payment(&self, id: Uuid) -> Result<Option<PaymentRequest>> {
        self.blocking(move |conn| {
            let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?1");
            conn.query_row(&sql, params![id.to_string()], payment_from_row)
                .optional()
                .context("load payment")
        })
        .await
    }

    async fn payment_by_reference(&self, reference: &str) -> Result<Option<PaymentRequest>> {
        let reference = reference.to_string();
        self.blocking(move |conn| {
            let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE checkout_reference = ?1");
            conn.query_row(&sql, params![reference], payment_from_row)
                .optional()
                .context("load payment by reference")
        })
        .await
    }

    async fn payments_in(
        &self,
        statuses: &[PaymentStatus],
        initiated_before: DateTime<Utc>,
    ) -> Result<Vec<PaymentRequest>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let statuses: Vec<&'static str> = statuses.iter().map(|status| status.as_str()).collect();
        self.blocking(move |conn| {
            let placeholders = (2..statuses.len() + 2)
                .map(|idx| format!("?{idx}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT {PAYMENT_COLUMNS} FROM payments
                 WHERE initiated_at < ?1 AND status IN ({placeholders})
                 ORDER BY initiated_at ASC"
            );
            let cutoff = timestamp(&initiated_before);
            let values = std::iter::once(cutoff.as_str()).chain(statuses.iter().copied());
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values), payment_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("load payments by status")
        })
        .await
    }

    async fn configurations(&self) -> Result<Vec<AlgorithmConfiguration>> {
        self.blocking(move |conn| {
            let sql =
                format!("SELECT {CONFIGURATION_COLUMNS} FROM algorithm_configurations ORDER BY name");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], configuration_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("load configurations")
        })
        .await
    }

    async fn apply(&self, changes: Vec<Change>) -> Result<(), CommitError> {
        if changes.is_empty() {
            return Ok(());
        }
        self.blocking(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(storage)?;
            for change in changes {
                // Dropping `tx` on error rolls the whole batch back.
                stage(&tx, change)?;
            }
            tx.commit().map_err(storage)
        })
        .await
    }
}
