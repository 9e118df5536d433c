// State Manager for the paper-trading ledger
// SQLite-based persistence with JSON backup
//
// Holds exactly one portfolio row and an append-only trade log. Every
// accepted trade is committed as a single transaction so the portfolio row
// and the trade row can never disagree.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::StorageError;
use crate::portfolio::{Portfolio, TradeRecord};
use crate::types::{Money, Side};

const DATE_FORMAT: &str = "%Y-%m-%d";

// =============================================================================
// Storage Seam
// =============================================================================

/// Durable home of the portfolio row and the trade log
pub trait LedgerStore: Send + Sync {
    fn load_portfolio(&self) -> Result<Option<Portfolio>, StorageError>;

    /// Overwrite the portfolio row (first run, day roll)
    fn save_portfolio(&self, portfolio: &Portfolio) -> Result<(), StorageError>;

    /// Write the successor portfolio and append `trade` atomically
    fn commit_trade(&self, portfolio: &Portfolio, trade: &TradeRecord) -> Result<(), StorageError>;

    /// Newest first
    fn load_trades(&self, limit: Option<usize>) -> Result<Vec<TradeRecord>, StorageError>;

    /// Entire log, oldest first
    fn trade_log(&self) -> Result<Vec<TradeRecord>, StorageError> {
        let mut trades = self.load_trades(None)?;
        trades.reverse();
        Ok(trades)
    }

    /// Refresh the secondary copy of the ledger, if this store keeps one.
    /// Called after a commit, outside the engine's writer lock.
    fn backup(&self) -> Result<Option<PathBuf>, StorageError> {
        Ok(None)
    }
}

// =============================================================================
// Column Conversions
// =============================================================================

// Decimals are stored as TEXT so nothing is lost to REAL rounding
impl ToSql for Money {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.inner().to_string()))
    }
}

impl FromSql for Money {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse::<Money>()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, err.into())
}

fn trade_from_row(row: &Row<'_>) -> rusqlite::Result<TradeRecord> {
    let timestamp: String = row.get(1)?;
    let side: String = row.get(2)?;

    Ok(TradeRecord {
        trade_id: row.get(0)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| conversion_error(1, e))?
            .with_timezone(&Utc),
        side: side.parse::<Side>().map_err(|e| conversion_error(2, e))?,
        quantity: row.get(3)?,
        price: row.get(4)?,
        total_value: row.get(5)?,
        signal_type: row.get(6)?,
        indicator_value_at_trade: row.get(7)?,
        resulting_balance: row.get(8)?,
    })
}

// =============================================================================
// State Manager Implementation
// =============================================================================

pub struct SqliteStateManager {
    conn: Arc<Mutex<Connection>>,
    json_backup_path: Option<PathBuf>,
    auto_backup: bool,
    // One backup writer at a time
    backup_lock: Mutex<()>,
}

impl SqliteStateManager {
    pub fn new<P: AsRef<Path>>(
        db_path: P,
        json_backup_path: Option<P>,
        auto_backup: bool,
    ) -> Result<Self, StorageError> {
        let db_path = db_path.as_ref();
        let json_backup_path = json_backup_path.map(|p| p.as_ref().to_path_buf());

        // Create parent directories
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = json_backup_path.as_deref().and_then(Path::parent) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;

        // WAL lets status readers run while a trade commits
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;

        let manager = Self {
            conn: Arc::new(Mutex::new(conn)),
            json_backup_path,
            auto_backup,
            backup_lock: Mutex::new(()),
        };

        manager.create_tables()?;
        info!("SQLite state manager initialized at {}", db_path.display());

        Ok(manager)
    }

    /// Throwaway database for tests and dry runs
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
            json_backup_path: None,
            auto_backup: false,
            backup_lock: Mutex::new(()),
        };
        manager.create_tables()?;
        Ok(manager)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn create_tables(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS portfolio (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                initial_balance TEXT NOT NULL,
                cash_balance TEXT NOT NULL,
                position_quantity TEXT NOT NULL,
                position_entry_price TEXT,
                daily_trade_count INTEGER NOT NULL DEFAULT 0,
                daily_reset_date TEXT NOT NULL,
                quote_currency TEXT NOT NULL,
                day_start_value TEXT,
                trading_paused INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        // Ledgers created before the daily profit target existed
        Self::ensure_column(&conn, "portfolio", "day_start_value", "TEXT")?;
        Self::ensure_column(
            &conn,
            "portfolio",
            "trading_paused",
            "INTEGER NOT NULL DEFAULT 0",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                trade_id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                side TEXT NOT NULL CHECK (side IN ('BUY', 'SELL')),
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                total_value TEXT NOT NULL,
                signal_type TEXT NOT NULL,
                indicator_value_at_trade REAL,
                resulting_balance TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_timestamp ON trades(timestamp)",
            [],
        )?;

        debug!("Database schema created/verified");
        Ok(())
    }

    fn ensure_column(
        conn: &Connection,
        table: &str,
        column: &str,
        definition: &str,
    ) -> Result<(), StorageError> {
        let columns = {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<Result<Vec<_>, _>>()?;
            names
        };
        let exists = columns.iter().any(|name| name == column);
        if !exists {
            conn.execute(
                &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition),
                [],
            )?;
            info!("Added column {}.{}", table, column);
        }
        Ok(())
    }

    fn write_portfolio(conn: &Connection, portfolio: &Portfolio) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT OR REPLACE INTO portfolio
             (id, initial_balance, cash_balance, position_quantity, position_entry_price,
              daily_trade_count, daily_reset_date, quote_currency, day_start_value,
              trading_paused, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                portfolio.initial_balance,
                portfolio.cash_balance,
                portfolio.position_quantity,
                portfolio.position_entry_price,
                portfolio.daily_trade_count,
                portfolio.daily_reset_date.format(DATE_FORMAT).to_string(),
                portfolio.quote_currency,
                portfolio.day_start_value,
                portfolio.trading_paused,
                Utc::now().to_rfc3339(),
            ],
        )
    }

    fn insert_trade(conn: &Connection, trade: &TradeRecord) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO trades
             (trade_id, timestamp, side, quantity, price, total_value,
              signal_type, indicator_value_at_trade, resulting_balance)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                trade.trade_id,
                trade.timestamp.to_rfc3339(),
                trade.side.as_str(),
                trade.quantity,
                trade.price,
                trade.total_value,
                trade.signal_type,
                trade.indicator_value_at_trade,
                trade.resulting_balance,
            ],
        )
    }

    pub fn trade_count(&self) -> Result<usize, StorageError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    /// Pretty JSON copy of the portfolio and the full trade log
    pub fn export_json(&self) -> Result<Option<PathBuf>, StorageError> {
        let Some(path) = self.json_backup_path.as_ref() else {
            return Ok(None);
        };
        self.export_json_to(path)?;
        Ok(Some(path.clone()))
    }

    pub fn export_json_to(&self, path: &Path) -> Result<(), StorageError> {
        let portfolio = self.load_portfolio()?;
        let trades = self.trade_log()?;

        let state = serde_json::json!({
            "exported_at": Utc::now().to_rfc3339(),
            "portfolio": portfolio,
            "trades": trades,
        });

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&state)?)?;
        debug!("State exported to: {}", path.display());
        Ok(())
    }
}

impl LedgerStore for SqliteStateManager {
    fn load_portfolio(&self) -> Result<Option<Portfolio>, StorageError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT initial_balance, cash_balance, position_quantity, position_entry_price,
                        daily_trade_count, daily_reset_date, quote_currency,
                        day_start_value, trading_paused
                 FROM portfolio WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, Money>(0)?,
                        row.get::<_, Money>(1)?,
                        row.get::<_, Money>(2)?,
                        row.get::<_, Option<Money>>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<Money>>(7)?,
                        row.get::<_, bool>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((initial, cash, quantity, entry, count, reset_date, currency, day_start, paused)) =
            row
        else {
            debug!("No portfolio row found");
            return Ok(None);
        };

        let daily_reset_date = NaiveDate::parse_from_str(&reset_date, DATE_FORMAT).map_err(|_| {
            StorageError::Corrupt {
                column: "daily_reset_date",
                value: reset_date.clone(),
            }
        })?;

        // Migrated rows have no day-start mark yet; fall back to cost basis
        let day_start_value = day_start.unwrap_or_else(|| {
            cash + entry
                .and_then(|price| price.checked_mul(quantity))
                .unwrap_or(Money::ZERO)
        });

        Ok(Some(Portfolio {
            initial_balance: initial,
            cash_balance: cash,
            position_quantity: quantity,
            position_entry_price: entry,
            daily_trade_count: count,
            daily_reset_date,
            quote_currency: currency,
            day_start_value,
            trading_paused: paused,
        }))
    }

    fn save_portfolio(&self, portfolio: &Portfolio) -> Result<(), StorageError> {
        let conn = self.conn()?;
        Self::write_portfolio(&conn, portfolio)?;
        debug!(
            "Portfolio saved: cash={} qty={} trades_today={}",
            portfolio.cash_balance, portfolio.position_quantity, portfolio.daily_trade_count
        );
        Ok(())
    }

    fn commit_trade(&self, portfolio: &Portfolio, trade: &TradeRecord) -> Result<(), StorageError> {
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            Self::write_portfolio(&tx, portfolio)?;
            Self::insert_trade(&tx, trade)?;
            tx.commit()?;
        }

        info!(
            "Trade recorded: {} {} @ {} = {} {} | {} | balance {}",
            trade.side,
            trade.quantity,
            trade.price,
            trade.total_value,
            portfolio.quote_currency,
            trade.signal_type,
            trade.resulting_balance
        );
        Ok(())
    }

    fn backup(&self) -> Result<Option<PathBuf>, StorageError> {
        if !self.auto_backup {
            return Ok(None);
        }
        let _guard = self.backup_lock.lock().map_err(|_| StorageError::LockPoisoned)?;
        self.export_json()
    }

    fn load_trades(&self, limit: Option<usize>) -> Result<Vec<TradeRecord>, StorageError> {
        let conn = self.conn()?;
        // SQLite treats a negative LIMIT as unbounded
        let limit = limit.map(|l| l.min(i64::MAX as usize) as i64).unwrap_or(-1);

        let mut stmt = conn.prepare(
            "SELECT trade_id, timestamp, side, quantity, price, total_value,
                    signal_type, indicator_value_at_trade, resulting_balance
             FROM trades ORDER BY rowid DESC LIMIT ?1",
        )?;
        let trades = stmt
            .query_map(params![limit], trade_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        debug!("Loaded {} trades (limit: {})", trades.len(), limit);
        Ok(trades)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn trade(id: &str, side: Side, qty: Money, price: Money, balance: Money) -> TradeRecord {
        TradeRecord {
            trade_id: id.to_string(),
            timestamp: Utc::now(),
            side,
            quantity: qty,
            price,
            total_value: qty * price,
            signal_type: "RSI".to_string(),
            indicator_value_at_trade: Some(21.5),
            resulting_balance: balance,
        }
    }

    #[test]
    fn test_portfolio_round_trip_is_exact() {
        let store = SqliteStateManager::in_memory().unwrap();
        assert!(store.load_portfolio().unwrap().is_none());

        let mut portfolio = Portfolio::new(Money::new(dec!(10000)), "USDC", day());
        portfolio.cash_balance = Money::new(dec!(9199.999999999999999999));
        portfolio.position_quantity = Money::new(dec!(0.01600000));
        portfolio.position_entry_price = Some(Money::new(dec!(50000.0000001)));
        portfolio.daily_trade_count = 3;
        portfolio.day_start_value = Money::new(dec!(10012.5));
        portfolio.trading_paused = true;

        store.save_portfolio(&portfolio).unwrap();
        assert_eq!(store.load_portfolio().unwrap(), Some(portfolio));
    }

    #[test]
    fn test_commit_and_history_order() {
        let store = SqliteStateManager::in_memory().unwrap();
        let p = Portfolio::new(Money::new(dec!(1000)), "USDC", day());

        for i in 0..5 {
            let t = trade(
                &format!("t{}", i),
                Side::Buy,
                Money::ONE,
                Money::from_i64(10),
                Money::from_i64(1000 - 10 * (i + 1)),
            );
            store.commit_trade(&p, &t).unwrap();
        }

        let newest = store.load_trades(Some(2)).unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].trade_id, "t4");
        assert_eq!(newest[1].trade_id, "t3");

        let log = store.trade_log().unwrap();
        assert_eq!(log.len(), 5);
        assert_eq!(log[0].trade_id, "t0");
        assert_eq!(log[0].indicator_value_at_trade, Some(21.5));
        assert_eq!(store.trade_count().unwrap(), 5);
    }

    #[test]
    fn test_duplicate_trade_id_rolls_back_portfolio() {
        let store = SqliteStateManager::in_memory().unwrap();
        let before = Portfolio::new(Money::new(dec!(1000)), "USDC", day());
        store.save_portfolio(&before).unwrap();

        let t = trade("dup", Side::Buy, Money::ONE, Money::from_i64(10), Money::from_i64(990));
        let mut after = before.clone();
        after.cash_balance = Money::from_i64(990);
        store.commit_trade(&after, &t).unwrap();

        let mut later = after.clone();
        later.cash_balance = Money::from_i64(980);
        assert!(store.commit_trade(&later, &t).is_err());

        // The failed transaction must not leave the new balance behind
        assert_eq!(store.load_portfolio().unwrap(), Some(after));
        assert_eq!(store.trade_count().unwrap(), 1);
    }

    #[test]
    fn test_file_backed_store_and_export() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("state").join("ledger.db");
        let json = dir.path().join("state").join("ledger.json");

        {
            let store = SqliteStateManager::new(&db, Some(&json), true).unwrap();
            let p = Portfolio::new(Money::new(dec!(500)), "USDC", day());
            let t = trade("a", Side::Buy, Money::ONE, Money::from_i64(100), Money::from_i64(400));
            store.commit_trade(&p, &t).unwrap();
            // Commit alone never touches the backup file
            assert!(!json.exists());
            assert_eq!(store.backup().unwrap(), Some(json.clone()));
        }

        let reopened = SqliteStateManager::new(&db, Some(&json), false).unwrap();
        assert_eq!(reopened.trade_count().unwrap(), 1);

        let backup: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&json).unwrap()).unwrap();
        assert_eq!(backup["trades"][0]["trade_id"], "a");
        assert_eq!(backup["portfolio"]["quote_currency"], "USDC");
    }

    #[test]
    fn test_backup_disabled() {
        let dir = tempdir().unwrap();
        let json = dir.path().join("ledger.json");
        let store =
            SqliteStateManager::new(dir.path().join("ledger.db"), Some(json.clone()), false).unwrap();
        assert_eq!(store.backup().unwrap(), None);
        assert!(!json.exists());
    }

    #[test]
    fn test_pre_target_schema_is_migrated() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("old.db");
        {
            let conn = Connection::open(&db).unwrap();
            conn.execute(
                "CREATE TABLE portfolio (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    initial_balance TEXT NOT NULL,
                    cash_balance TEXT NOT NULL,
                    position_quantity TEXT NOT NULL,
                    position_entry_price TEXT,
                    daily_trade_count INTEGER NOT NULL DEFAULT 0,
                    daily_reset_date TEXT NOT NULL,
                    quote_currency TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO portfolio VALUES (1, '1000', '900', '1', '100', 2, '2024-03-01', 'USDC', '')",
                [],
            )
            .unwrap();
        }

        let store = SqliteStateManager::new(&db, None, false).unwrap();
        let p = store.load_portfolio().unwrap().unwrap();
        assert_eq!(p.day_start_value, Money::from_i64(1000));
        assert!(!p.trading_paused);
        assert_eq!(p.daily_trade_count, 2);
    }
}
