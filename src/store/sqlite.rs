use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{OptionalExtension, TransactionBehavior};

use super::{
    AccountRecord, BalanceKind, CreditApplication, DailyBonusRecord, DebitOutcome, LedgerStore,
    PaymentSession, PaymentStatus, StoreError, TaskRecord, TaskStatus, TaskUpdate, UsageOutcome,
    UsageRecord,
};

/// SQLite-backed ledger. Opens one connection per operation on the blocking pool.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.with_conn(|_| Ok(())).await
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            op(&mut conn)
        })
        .await?
    }
}

type AccountRow = (String, String, i64, i64, Option<i64>);

fn account_from_row(row: AccountRow) -> Result<AccountRecord, StoreError> {
    let (id, kind, balance, created_at_ms, expires_at_ms) = row;
    let kind = BalanceKind::parse(&kind)
        .ok_or_else(|| StoreError::Corrupt(format!("account {id} has kind {kind}")))?;
    Ok(AccountRecord {
        id,
        kind,
        balance,
        created_at_ms,
        expires_at_ms,
    })
}

fn select_account(
    conn: &rusqlite::Connection,
    account_id: &str,
) -> Result<Option<AccountRecord>, StoreError> {
    let row: Option<AccountRow> = conn
        .query_row(
            "SELECT id, kind, balance, created_at_ms, expires_at_ms FROM accounts WHERE id=?1",
            rusqlite::params![account_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .optional()?;
    row.map(account_from_row).transpose()
}

fn select_balance(conn: &rusqlite::Connection, account_id: &str) -> Result<Option<i64>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT balance FROM accounts WHERE id=?1",
            rusqlite::params![account_id],
            |row| row.get(0),
        )
        .optional()?)
}

const CAPPED_INCREMENT: &str = "UPDATE accounts
     SET balance = CASE
         WHEN ?3 IS NULL THEN balance + ?2
         ELSE MAX(balance, MIN(balance + ?2, ?3))
     END
     WHERE id = ?1";

fn progress_from_i64(raw: i64) -> u8 {
    u8::try_from(raw.clamp(0, 100)).unwrap_or(100)
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn insert_account(&self, account: &AccountRecord) -> Result<AccountRecord, StoreError> {
        let account = account.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT OR IGNORE INTO accounts (id, kind, balance, created_at_ms, expires_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    account.id,
                    account.kind.as_str(),
                    account.balance,
                    account.created_at_ms,
                    account.expires_at_ms
                ],
            )?;
            let stored = select_account(&tx, &account.id)?
                .ok_or_else(|| StoreError::AccountNotFound(account.id.clone()))?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<AccountRecord>, StoreError> {
        let account_id = account_id.to_string();
        self.with_conn(move |conn| select_account(conn, &account_id))
            .await
    }

    async fn try_debit(&self, account_id: &str, amount: i64) -> Result<DebitOutcome, StoreError> {
        let account_id = account_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let changed = tx.execute(
                "UPDATE accounts SET balance = balance - ?2 WHERE id = ?1 AND balance >= ?2",
                rusqlite::params![account_id, amount],
            )?;
            let balance = select_balance(&tx, &account_id)?
                .ok_or_else(|| StoreError::AccountNotFound(account_id.clone()))?;
            tx.commit()?;
            if changed == 0 {
                return Ok(DebitOutcome::Insufficient { available: balance });
            }
            Ok(DebitOutcome::Debited { balance })
        })
        .await
    }

    async fn add_balance(
        &self,
        account_id: &str,
        amount: i64,
        cap: Option<i64>,
    ) -> Result<i64, StoreError> {
        let account_id = account_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let changed = tx.execute(CAPPED_INCREMENT, rusqlite::params![account_id, amount, cap])?;
            if changed == 0 {
                return Err(StoreError::AccountNotFound(account_id));
            }
            let balance = select_balance(&tx, &account_id)?
                .ok_or_else(|| StoreError::AccountNotFound(account_id.clone()))?;
            tx.commit()?;
            Ok(balance)
        })
        .await
    }

    async fn apply_credit(
        &self,
        account_id: &str,
        amount: i64,
        idempotency_key: &str,
        cap: Option<i64>,
        ts_ms: i64,
    ) -> Result<CreditApplication, StoreError> {
        let account_id = account_id.to_string();
        let idempotency_key = idempotency_key.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(current) = select_balance(&tx, &account_id)? else {
                return Err(StoreError::AccountNotFound(account_id));
            };

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO credit_grants (idempotency_key, account_id, amount, ts_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![idempotency_key, account_id, amount, ts_ms],
            )?;
            if inserted == 0 {
                return Ok(CreditApplication {
                    applied: false,
                    balance: current,
                });
            }

            tx.execute(CAPPED_INCREMENT, rusqlite::params![account_id, amount, cap])?;
            let balance = select_balance(&tx, &account_id)?.unwrap_or(current);
            tx.commit()?;
            Ok(CreditApplication {
                applied: true,
                balance,
            })
        })
        .await
    }

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO usage_records (account_id, action_type, credits_used, outcome, ts_ms, correlation_ref)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    record.account_id,
                    record.action_type,
                    record.credits_used,
                    record.outcome.as_str(),
                    record.ts_ms,
                    record.correlation_ref
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_usage(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let account_id = account_id.to_string();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT account_id, action_type, credits_used, outcome, ts_ms, correlation_ref
                 FROM usage_records
                 WHERE account_id=?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![account_id, limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (account_id, action_type, credits_used, outcome, ts_ms, correlation_ref) =
                    row?;
                let outcome = UsageOutcome::parse(&outcome)
                    .ok_or_else(|| StoreError::Corrupt(format!("usage outcome {outcome}")))?;
                out.push(UsageRecord {
                    account_id,
                    action_type,
                    credits_used,
                    outcome,
                    ts_ms,
                    correlation_ref,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        let task = task.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO tasks
                    (task_id, account_id, action_type, cost, status, progress_pct, result_url, message, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    task.task_id,
                    task.account_id,
                    task.action_type,
                    task.cost,
                    task.status.as_str(),
                    i64::from(task.progress_pct),
                    task.result_url,
                    task.message,
                    task.created_at_ms,
                    task.updated_at_ms
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Duplicate {
                    what: "task",
                    id: task.task_id,
                });
            }
            Ok(())
        })
        .await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT task_id, account_id, action_type, cost, status, progress_pct, result_url, message, created_at_ms, updated_at_ms
                     FROM tasks WHERE task_id=?1",
                    rusqlite::params![task_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, Option<String>>(6)?,
                            row.get::<_, Option<String>>(7)?,
                            row.get::<_, i64>(8)?,
                            row.get::<_, i64>(9)?,
                        ))
                    },
                )
                .optional()?;

            let Some((
                task_id,
                account_id,
                action_type,
                cost,
                status,
                progress_pct,
                result_url,
                message,
                created_at_ms,
                updated_at_ms,
            )) = row
            else {
                return Ok(None);
            };
            Ok(Some(TaskRecord {
                task_id,
                account_id,
                action_type,
                cost,
                status: TaskStatus::from_provider(&status),
                progress_pct: progress_from_i64(progress_pct),
                result_url,
                message,
                created_at_ms,
                updated_at_ms,
            }))
        })
        .await
    }

    async fn update_task(
        &self,
        task_id: &str,
        update: &TaskUpdate,
        ts_ms: i64,
    ) -> Result<bool, StoreError> {
        let task_id = task_id.to_string();
        let update = update.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE tasks
                 SET status = ?2, progress_pct = ?3, result_url = ?4, message = ?5, updated_at_ms = ?6
                 WHERE task_id = ?1",
                rusqlite::params![
                    task_id,
                    update.status.as_str(),
                    i64::from(update.progress_pct),
                    update.result_url,
                    update.message,
                    ts_ms
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn insert_payment_session(&self, session: &PaymentSession) -> Result<(), StoreError> {
        let session = session.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO payment_sessions
                    (session_id, account_id, amount, currency, credits, status, idempotency_key, created_at_ms, completed_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    session.session_id,
                    session.account_id,
                    session.amount,
                    session.currency,
                    session.credits,
                    session.status.as_str(),
                    session.idempotency_key,
                    session.created_at_ms,
                    session.completed_at_ms
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Duplicate {
                    what: "payment session",
                    id: session.session_id,
                });
            }
            Ok(())
        })
        .await
    }

    async fn get_payment_session(
        &self,
        session_id: &str,
    ) -> Result<Option<PaymentSession>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT session_id, account_id, amount, currency, credits, status, idempotency_key, created_at_ms, completed_at_ms
                     FROM payment_sessions WHERE session_id=?1",
                    rusqlite::params![session_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, i64>(7)?,
                            row.get::<_, Option<i64>>(8)?,
                        ))
                    },
                )
                .optional()?;

            let Some((
                session_id,
                account_id,
                amount,
                currency,
                credits,
                status,
                idempotency_key,
                created_at_ms,
                completed_at_ms,
            )) = row
            else {
                return Ok(None);
            };
            let status = PaymentStatus::parse(&status).ok_or_else(|| {
                StoreError::Corrupt(format!("payment session {session_id} has status {status}"))
            })?;
            Ok(Some(PaymentSession {
                session_id,
                account_id,
                amount,
                currency,
                credits,
                status,
                idempotency_key,
                created_at_ms,
                completed_at_ms,
            }))
        })
        .await
    }

    async fn complete_payment_session(
        &self,
        session_id: &str,
        ts_ms: i64,
    ) -> Result<bool, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE payment_sessions
                 SET status = 'completed', completed_at_ms = ?2
                 WHERE session_id = ?1 AND status = 'pending'",
                rusqlite::params![session_id, ts_ms],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn has_daily_bonus(&self, account_id: &str, date: &str) -> Result<bool, StoreError> {
        let account_id = account_id.to_string();
        let date = date.to_string();
        self.with_conn(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM daily_bonus WHERE account_id=?1 AND granted_on=?2",
                    rusqlite::params![account_id, date],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn try_insert_daily_bonus(&self, record: &DailyBonusRecord) -> Result<bool, StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO daily_bonus (account_id, granted_on, ts_ms) VALUES (?1, ?2, ?3)",
                rusqlite::params![record.account_id, record.granted_on, record.ts_ms],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn remove_daily_bonus(&self, account_id: &str, date: &str) -> Result<(), StoreError> {
        let account_id = account_id.to_string();
        let date = date.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM daily_bonus WHERE account_id=?1 AND granted_on=?2",
                rusqlite::params![account_id, date],
            )?;
            Ok(())
        })
        .await
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY NOT NULL,
            kind TEXT NOT NULL,
            balance INTEGER NOT NULL CHECK (balance >= 0),
            created_at_ms INTEGER NOT NULL,
            expires_at_ms INTEGER
        );

        CREATE TABLE IF NOT EXISTS credit_grants (
            idempotency_key TEXT PRIMARY KEY NOT NULL,
            account_id TEXT NOT NULL,
            amount INTEGER NOT NULL,
            ts_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS usage_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            action_type TEXT NOT NULL,
            credits_used INTEGER NOT NULL,
            outcome TEXT NOT NULL,
            ts_ms INTEGER NOT NULL,
            correlation_ref TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_records_account_id
            ON usage_records(account_id, id);

        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY NOT NULL,
            account_id TEXT NOT NULL,
            action_type TEXT NOT NULL,
            cost INTEGER NOT NULL,
            status TEXT NOT NULL,
            progress_pct INTEGER NOT NULL DEFAULT 0,
            result_url TEXT,
            message TEXT,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS payment_sessions (
            session_id TEXT PRIMARY KEY NOT NULL,
            account_id TEXT NOT NULL,
            amount INTEGER NOT NULL,
            currency TEXT NOT NULL,
            credits INTEGER NOT NULL,
            status TEXT NOT NULL,
            idempotency_key TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            completed_at_ms INTEGER
        );

        CREATE TABLE IF NOT EXISTS daily_bonus (
            account_id TEXT NOT NULL,
            granted_on TEXT NOT NULL,
            ts_ms INTEGER NOT NULL,
            PRIMARY KEY (account_id, granted_on)
        );",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visitor(id: &str, balance: i64) -> AccountRecord {
        AccountRecord {
            id: id.to_string(),
            kind: BalanceKind::Ephemeral,
            balance,
            created_at_ms: 1,
            expires_at_ms: Some(1_000),
        }
    }

    async fn open_store(dir: &tempfile::TempDir) -> SqliteStore {
        let store = SqliteStore::new(dir.path().join("ledger.sqlite"));
        store.init().await.expect("init");
        store
    }

    #[tokio::test]
    async fn sqlite_store_debits_only_when_covered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        store.insert_account(&visitor("v1", 2)).await.expect("insert");

        assert_eq!(
            store.try_debit("v1", 2).await.expect("debit"),
            DebitOutcome::Debited { balance: 0 }
        );
        assert_eq!(
            store.try_debit("v1", 1).await.expect("debit"),
            DebitOutcome::Insufficient { available: 0 }
        );
        assert!(matches!(
            store.try_debit("nobody", 1).await,
            Err(StoreError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn sqlite_store_capped_increment_never_lowers_balance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        store.insert_account(&visitor("v1", 0)).await.expect("insert");

        assert_eq!(store.add_balance("v1", 3, Some(1)).await.expect("add"), 1);
        assert_eq!(store.add_balance("v1", 3, Some(1)).await.expect("add"), 1);
        assert_eq!(store.add_balance("v1", 3, None).await.expect("add"), 4);
        assert_eq!(store.add_balance("v1", 1, Some(1)).await.expect("add"), 4);
    }

    #[tokio::test]
    async fn sqlite_store_credit_is_idempotent_per_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let mut account = visitor("u1", 0);
        account.kind = BalanceKind::Durable;
        account.expires_at_ms = None;
        store.insert_account(&account).await.expect("insert");

        let first = store
            .apply_credit("u1", 50, "cs_1", None, 1_700_000_000_000)
            .await
            .expect("credit");
        let replay = store
            .apply_credit("u1", 50, "cs_1", None, 1_700_000_900_000)
            .await
            .expect("credit replay");
        assert!(first.applied);
        assert!(!replay.applied);
        assert_eq!(replay.balance, 50);

        let grants = store
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT idempotency_key, amount, ts_ms FROM credit_grants")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .expect("grants");
        assert_eq!(grants, vec![("cs_1".to_string(), 50, 1_700_000_000_000)]);

        let loaded = store.get_account("u1").await.expect("get").expect("row");
        assert_eq!(loaded.balance, 50);
        assert_eq!(loaded.kind, BalanceKind::Durable);
    }

    #[tokio::test]
    async fn sqlite_store_payment_session_completes_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let session = PaymentSession {
            session_id: "cs_1".to_string(),
            account_id: "u1".to_string(),
            amount: 5,
            currency: "usd".to_string(),
            credits: 50,
            status: PaymentStatus::Pending,
            idempotency_key: "cs_1".to_string(),
            created_at_ms: 10,
            completed_at_ms: None,
        };
        store
            .insert_payment_session(&session)
            .await
            .expect("insert");
        assert!(matches!(
            store.insert_payment_session(&session).await,
            Err(StoreError::Duplicate { .. })
        ));

        assert!(store.complete_payment_session("cs_1", 20).await.expect("complete"));
        assert!(!store.complete_payment_session("cs_1", 30).await.expect("complete again"));

        let loaded = store
            .get_payment_session("cs_1")
            .await
            .expect("get")
            .expect("row");
        assert_eq!(loaded.status, PaymentStatus::Completed);
        assert_eq!(loaded.completed_at_ms, Some(20));
    }

    #[tokio::test]
    async fn sqlite_store_tasks_usage_and_daily_bonus() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;

        let task = TaskRecord {
            task_id: "t1".to_string(),
            account_id: "u1".to_string(),
            action_type: "sora2".to_string(),
            cost: 1,
            status: TaskStatus::Pending,
            progress_pct: 0,
            result_url: None,
            message: None,
            created_at_ms: 1,
            updated_at_ms: 1,
        };
        store.insert_task(&task).await.expect("insert task");
        let update = TaskUpdate {
            status: TaskStatus::Completed,
            progress_pct: 100,
            result_url: Some("https://cdn.example/v.mp4".to_string()),
            message: None,
        };
        assert!(store.update_task("t1", &update, 9).await.expect("update"));
        assert!(!store.update_task("t2", &update, 9).await.expect("update missing"));
        let loaded = store.get_task("t1").await.expect("get").expect("row");
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.progress_pct, 100);
        assert_eq!(loaded.updated_at_ms, 9);

        for (idx, outcome) in [UsageOutcome::Success, UsageOutcome::Failed]
            .into_iter()
            .enumerate()
        {
            store
                .append_usage(&UsageRecord {
                    account_id: "u1".to_string(),
                    action_type: "sora2".to_string(),
                    credits_used: 1,
                    outcome,
                    ts_ms: idx as i64,
                    correlation_ref: format!("t{idx}"),
                })
                .await
                .expect("append usage");
        }
        let usage = store.list_usage("u1", 10).await.expect("list usage");
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].outcome, UsageOutcome::Failed);

        let bonus = DailyBonusRecord {
            account_id: "u1".to_string(),
            granted_on: "2025-03-01".to_string(),
            ts_ms: 5,
        };
        assert!(store.try_insert_daily_bonus(&bonus).await.expect("insert"));
        assert!(!store.try_insert_daily_bonus(&bonus).await.expect("insert again"));
        assert!(store.has_daily_bonus("u1", "2025-03-01").await.expect("has"));
        store
            .remove_daily_bonus("u1", "2025-03-01")
            .await
            .expect("remove");
        assert!(!store.has_daily_bonus("u1", "2025-03-01").await.expect("has"));
    }
}
