//! Database schema definitions

/// Stored in `PRAGMA user_version` once [`CREATE_TABLES`] has been applied
pub const SCHEMA_VERSION: i64 = 1;

/// SQL to create all tables
/// NOTE: undefined metrics (NaN) are stored as NULL
pub const CREATE_TABLES: &str = r#"
-- Completed walk-forward backtest runs
CREATE TABLE IF NOT EXISTS backtest_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_hash TEXT NOT NULL UNIQUE,
    symbol TEXT NOT NULL,
    model TEXT NOT NULL,
    period TEXT NOT NULL,
    config_json TEXT NOT NULL,
    n_samples INTEGER NOT NULL DEFAULT 0,
    n_predictions INTEGER NOT NULL DEFAULT 0,
    sharpe REAL,
    cagr REAL,
    max_drawdown REAL,
    win_rate REAL,
    auc REAL,
    first_date TEXT,
    last_date TEXT,
    artifact_dir TEXT,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_runs_symbol ON backtest_runs(symbol, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_runs_created ON backtest_runs(created_at DESC)
"#;
